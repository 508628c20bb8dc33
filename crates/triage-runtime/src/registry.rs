//! Session registry: session id → (live channel, workflow snapshot).
//!
//! Each session lives in its own slot inside a sharded `DashMap`, so there is
//! no lock spanning sessions. Within a slot the channel and the workflow
//! snapshot have separate mutexes. Workflow snapshots are `Arc`s replaced
//! whole; a reader either sees the old snapshot or the new one.
//!
//! Slot creation, workflow commits and removal all go through the map's
//! entry API (shard write lock), so the idle sweeper can never remove a slot
//! while a commit into it is in progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use triage_core::{ChannelId, SessionId, WorkflowState, WorkflowStatus};
use triage_telemetry::metrics::{SESSIONS_SWEPT_TOTAL, WS_CHANNELS_RETIRED_TOTAL};

use crate::channel::{Channel, DisconnectReason};

struct SessionSlot {
    channel: Mutex<Option<Arc<Channel>>>,
    workflow: Mutex<Option<Arc<WorkflowState>>>,
    pipeline_gate: Arc<tokio::sync::Mutex<()>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl SessionSlot {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            channel: Mutex::new(None),
            workflow: Mutex::new(None),
            pipeline_gate: Arc::new(tokio::sync::Mutex::new(())),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// No open channel, nothing running, and quiet for longer than `ttl`.
    ///
    /// A workflow paused for client input is not running.
    fn is_idle(&self, ttl: Duration) -> bool {
        let has_channel = self.channel.lock().as_ref().is_some_and(|c| c.is_open());
        if has_channel {
            return false;
        }
        let running = self
            .workflow
            .lock()
            .as_ref()
            .is_some_and(|w| w.status == WorkflowStatus::Running);
        if running {
            return false;
        }
        self.last_activity.lock().elapsed() >= ttl
    }
}

/// Admin view of one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: SessionId,
    /// Attached channel, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    /// Workflow status, if a workflow exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_status: Option<WorkflowStatus>,
    /// Settled stage count, if a workflow exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<usize>,
    /// Seconds since the session was created.
    pub age_secs: u64,
}

/// Thread-safe map of sessions to their channel and workflow.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `channel` to its session, creating the session if needed.
    ///
    /// A previously attached channel is closed with
    /// [`DisconnectReason::Retired`] and returned.
    pub fn attach(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        let session_id = channel.session_id().clone();
        let retired = {
            let slot = self
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(SessionSlot::new()));
            slot.touch();
            slot.channel.lock().replace(channel)
        };
        if let Some(old) = &retired {
            old.close(DisconnectReason::Retired);
            counter!(WS_CHANNELS_RETIRED_TOTAL).increment(1);
            info!(session_id = %session_id, channel_id = %old.id(), "retired previous channel");
        }
        retired
    }

    /// Remove the channel association, keeping workflow state.
    pub fn detach(&self, session_id: &SessionId) -> Option<Arc<Channel>> {
        let slot = self.sessions.get(session_id)?;
        slot.touch();
        slot.channel.lock().take()
    }

    /// Detach only if `channel_id` is the attached channel.
    ///
    /// Returns `true` if a channel was detached.
    pub fn detach_channel(&self, session_id: &SessionId, channel_id: &ChannelId) -> bool {
        let Some(slot) = self.sessions.get(session_id) else {
            return false;
        };
        let mut attached = slot.channel.lock();
        if attached.as_ref().is_some_and(|c| c.id() == channel_id) {
            *attached = None;
            drop(attached);
            slot.touch();
            debug!(session_id = %session_id, channel_id = %channel_id, "channel detached");
            true
        } else {
            false
        }
    }

    /// Live channel for a session.
    pub fn channel(&self, session_id: &SessionId) -> Option<Arc<Channel>> {
        self.sessions.get(session_id)?.channel.lock().clone()
    }

    /// Current workflow snapshot for a session.
    pub fn workflow_state(&self, session_id: &SessionId) -> Option<Arc<WorkflowState>> {
        self.sessions.get(session_id)?.workflow.lock().clone()
    }

    /// Replace the workflow snapshot, creating the session if needed.
    pub fn set_workflow_state(&self, session_id: &SessionId, state: WorkflowState) -> Arc<WorkflowState> {
        let state = Arc::new(state);
        let slot = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionSlot::new()));
        *slot.workflow.lock() = Some(Arc::clone(&state));
        slot.touch();
        state
    }

    /// Atomically read-modify-commit the workflow snapshot.
    ///
    /// `f` sees the current snapshot (or `None`) and returns the replacement.
    /// On `Err` nothing changes, and an absent session is not created.
    pub fn update_workflow_state<E, F>(&self, session_id: &SessionId, f: F) -> Result<Arc<WorkflowState>, E>
    where
        F: FnOnce(Option<&WorkflowState>) -> Result<WorkflowState, E>,
    {
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(entry) => {
                let slot = entry.get();
                let mut workflow = slot.workflow.lock();
                let next = Arc::new(f(workflow.as_deref())?);
                *workflow = Some(Arc::clone(&next));
                drop(workflow);
                slot.touch();
                Ok(next)
            }
            Entry::Vacant(entry) => {
                let next = Arc::new(f(None)?);
                let slot = SessionSlot::new();
                *slot.workflow.lock() = Some(Arc::clone(&next));
                let _ = entry.insert(Arc::new(slot));
                Ok(next)
            }
        }
    }

    /// Terminate a session: close its channel and drop its state.
    ///
    /// Returns `true` if the session existed.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        let Some((_, slot)) = self.sessions.remove(session_id) else {
            return false;
        };
        if let Some(channel) = slot.channel.lock().take() {
            channel.close(DisconnectReason::Terminated);
        }
        info!(session_id = %session_id, "session removed");
        true
    }

    /// Per-session async gate serializing stage execution.
    ///
    /// `None` if the session does not exist.
    pub fn pipeline_gate(&self, session_id: &SessionId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.sessions
            .get(session_id)
            .map(|slot| Arc::clone(&slot.pipeline_gate))
    }

    /// Per-session async gate, creating the session if needed.
    pub fn ensure_pipeline_gate(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let slot = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionSlot::new()));
        slot.touch();
        Arc::clone(&slot.pipeline_gate)
    }

    /// Whether the session exists.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Summaries of every session, sorted by id.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let slot = entry.value();
                let channel_id = slot.channel.lock().as_ref().map(|c| c.id().clone());
                let workflow = slot.workflow.lock().clone();
                SessionSummary {
                    session_id: entry.key().clone(),
                    channel_id,
                    workflow_status: workflow.as_ref().map(|w| w.status),
                    current_stage: workflow.as_ref().map(|w| w.current_stage),
                    age_secs: slot.created_at.elapsed().as_secs(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Number of sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions with an attached channel.
    pub fn channel_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().channel.lock().is_some())
            .count()
    }

    /// Close every attached channel.
    pub fn close_all(&self, reason: &DisconnectReason) -> usize {
        let mut closed = 0;
        for entry in &self.sessions {
            if let Some(channel) = entry.value().channel.lock().as_ref() {
                channel.close(reason.clone());
                closed += 1;
            }
        }
        closed
    }

    /// Remove sessions idle for longer than `ttl`.
    ///
    /// A session is idle when it has no open channel, no running workflow,
    /// and no activity within `ttl`.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|session_id, slot| {
            let idle = slot.is_idle(ttl);
            if idle {
                debug!(session_id = %session_id, "sweeping idle session");
            }
            !idle
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            counter!(SESSIONS_SWEPT_TOTAL).increment(removed as u64);
        }
        removed
    }

    /// Start a background task that sweeps idle sessions every `interval`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep_idle(ttl);
                        if removed > 0 {
                            info!(removed, "idle session sweep");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
