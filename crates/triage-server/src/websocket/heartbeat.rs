//! Channel liveness monitoring.

use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use triage_runtime::Channel;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound activity within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a channel's inbound activity.
///
/// Each `interval` tick consumes the channel's alive flag. A tick with no
/// activity since the previous one counts as a miss; `timeout / interval`
/// consecutive misses (at least one) end the loop with
/// [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat(
    channel: &Channel,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // The first tick fires immediately
    let _ = ticker.tick().await;
    let max_missed = max_missed(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if channel.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}

fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use triage_core::SessionId;

    fn make_channel() -> (Arc<Channel>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Channel::new(SessionId::from_raw("hb"), tx)), rx)
    }

    #[test]
    fn max_missed_from_ratio() {
        assert_eq!(max_missed(Duration::from_secs(30), Duration::from_secs(90)), 3);
        assert_eq!(max_missed(Duration::from_secs(30), Duration::from_secs(10)), 1);
        assert_eq!(max_missed(Duration::from_millis(100), Duration::from_millis(350)), 3);
    }

    #[tokio::test]
    async fn cancelled() {
        let (channel, _rx) = make_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(&channel, Duration::from_secs(100), Duration::from_secs(300), cancel).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_times_out_after_max_missed() {
        let (channel, _rx) = make_channel();
        let started = time::Instant::now();
        let result = run_heartbeat(
            &channel,
            Duration::from_millis(100),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        // the initial alive flag absorbs the first check, then three misses
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn active_channel_stays_alive() {
        let (channel, _rx) = make_channel();
        let cancel = CancellationToken::new();
        let hb_channel = Arc::clone(&channel);
        let hb_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_heartbeat(&hb_channel, Duration::from_millis(100), Duration::from_millis(200), hb_cancel).await
        });

        for _ in 0..20 {
            time::sleep(Duration::from_millis(50)).await;
            channel.mark_alive();
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }
}
