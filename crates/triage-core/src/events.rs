//! Wire envelopes exchanged over a session channel.
//!
//! - **[`Event`]**: server → client, `{type, data?, timestamp}`. Transient;
//!   an event with no live channel to receive it is dropped.
//! - **[`ControlMessage`]**: client → server, classified by its `type` field.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{ChannelId, SessionId};
use crate::workflow::WorkflowState;

/// Current UTC time as RFC 3339 with microsecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Event (outbound)
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of an outbound event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Sent once when a channel attaches.
    ConnectionEstablished,
    /// Reply to a client `ping`.
    Pong,
    /// Full workflow snapshot, on request.
    WorkflowStatus,
    /// A new workflow was created.
    WorkflowStarted,
    /// A stage completed or was skipped.
    WorkflowProgress,
    /// The final stage completed.
    WorkflowCompleted,
    /// A stage paused the workflow and asks the client for input.
    UserInputRequired,
    /// The client's answers were accepted; the workflow resumes.
    UserInputReceived,
    /// A stage failed, or an inbound message could not be parsed.
    Error,
    /// The session was terminated server-side.
    SessionTerminated,
}

impl EventKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::Pong => "pong",
            Self::WorkflowStatus => "workflow_status",
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowProgress => "workflow_progress",
            Self::WorkflowCompleted => "workflow_completed",
            Self::UserInputRequired => "user_input_required",
            Self::UserInputReceived => "user_input_received",
            Self::Error => "error",
            Self::SessionTerminated => "session_terminated",
        }
    }
}

/// Outbound envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Kind-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Emission time (RFC 3339, microseconds, UTC).
    pub timestamp: String,
}

impl Event {
    /// Event stamped with the current time.
    pub fn new(kind: EventKind, data: Option<Value>) -> Self {
        Self {
            kind,
            data,
            timestamp: now_timestamp(),
        }
    }

    /// `connection_established` carrying both ids.
    pub fn connection_established(session_id: &SessionId, channel_id: &ChannelId) -> Self {
        Self::new(
            EventKind::ConnectionEstablished,
            Some(json!({
                "sessionId": session_id,
                "channelId": channel_id,
            })),
        )
    }

    /// `pong` with no payload.
    pub fn pong() -> Self {
        Self::new(EventKind::Pong, None)
    }

    /// `workflow_status` with the full snapshot.
    pub fn workflow_status(state: &WorkflowState) -> Self {
        Self::new(EventKind::WorkflowStatus, serde_json::to_value(state).ok())
    }

    /// `workflow_started` with the initial snapshot.
    pub fn workflow_started(state: &WorkflowState) -> Self {
        Self::new(EventKind::WorkflowStarted, serde_json::to_value(state).ok())
    }

    /// `workflow_progress` with a stage summary.
    pub fn workflow_progress(data: Value) -> Self {
        Self::new(EventKind::WorkflowProgress, Some(data))
    }

    /// `workflow_completed` with a stage summary.
    pub fn workflow_completed(data: Value) -> Self {
        Self::new(EventKind::WorkflowCompleted, Some(data))
    }

    /// `user_input_required` with a stage summary.
    pub fn user_input_required(data: Value) -> Self {
        Self::new(EventKind::UserInputRequired, Some(data))
    }

    /// `user_input_received` echoing the accepted answers.
    pub fn user_input_received(data: Value) -> Self {
        Self::new(EventKind::UserInputReceived, Some(data))
    }

    /// `error` with a message and optional context.
    pub fn error(message: impl Into<String>, details: Option<Value>) -> Self {
        let mut data = json!({ "message": message.into() });
        if let (Some(details), Some(obj)) = (details, data.as_object_mut()) {
            if let Value::Object(extra) = details {
                obj.extend(extra);
            } else {
                let _ = obj.insert("details".into(), details);
            }
        }
        Self::new(EventKind::Error, Some(data))
    }

    /// `session_terminated` with an optional reason.
    pub fn session_terminated(reason: &str) -> Self {
        Self::new(
            EventKind::SessionTerminated,
            Some(json!({ "reason": reason })),
        )
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlMessage (inbound)
// ─────────────────────────────────────────────────────────────────────────────

/// Classified inbound client message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness check; answered with `pong`.
    Ping,
    /// Pull the current workflow snapshot.
    WorkflowStatusRequest,
    /// Any other `type`, or none at all. Ignored.
    Unknown(Option<String>),
}

impl ControlMessage {
    /// Classify a raw text frame.
    ///
    /// Only malformed JSON is an error; valid JSON of any shape classifies.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let kind = value.get("type").and_then(Value::as_str);
        Ok(match kind {
            Some("ping") => Self::Ping,
            Some("workflow_status_request") => Self::WorkflowStatusRequest,
            other => Self::Unknown(other.map(str::to_owned)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowTemplate;
    use chrono::DateTime;

    #[test]
    fn pong_has_no_data() {
        let json = Event::pong().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value.get("data").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn timestamp_is_rfc3339_micros_utc() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        let parsed = DateTime::parse_from_rfc3339(&ts).unwrap();
        let fraction = ts.split('.').nth(1).unwrap();
        assert_eq!(fraction.len(), 7, "six fractional digits plus Z: {ts}");
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[test]
    fn kind_wire_names_match_serde() {
        let kinds = [
            EventKind::ConnectionEstablished,
            EventKind::Pong,
            EventKind::WorkflowStatus,
            EventKind::WorkflowStarted,
            EventKind::WorkflowProgress,
            EventKind::WorkflowCompleted,
            EventKind::UserInputRequired,
            EventKind::UserInputReceived,
            EventKind::Error,
            EventKind::SessionTerminated,
        ];
        for kind in kinds {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn connection_established_carries_ids() {
        let event = Event::connection_established(
            &SessionId::from_raw("s1"),
            &ChannelId::from_raw("chan_1"),
        );
        let data = event.data.unwrap();
        assert_eq!(data["sessionId"], "s1");
        assert_eq!(data["channelId"], "chan_1");
    }

    #[test]
    fn workflow_status_embeds_snapshot() {
        let template = WorkflowTemplate::linear(&["a"]).unwrap();
        let state = WorkflowState::new(&template, json!({}));
        let event = Event::workflow_status(&state);
        assert_eq!(event.kind, EventKind::WorkflowStatus);
        assert_eq!(event.data.unwrap()["currentStage"], 0);
    }

    #[test]
    fn error_merges_object_details() {
        let event = Event::error("stage failed", Some(json!({"stage": "llm_diagnosis"})));
        let data = event.data.unwrap();
        assert_eq!(data["message"], "stage failed");
        assert_eq!(data["stage"], "llm_diagnosis");

        let event = Event::error("bad", Some(json!("raw")));
        assert_eq!(event.data.unwrap()["details"], "raw");
    }

    #[test]
    fn parse_known_messages() {
        assert_eq!(ControlMessage::parse(r#"{"type":"ping"}"#).unwrap(), ControlMessage::Ping);
        assert_eq!(
            ControlMessage::parse(r#"{"type":"workflow_status_request","extra":1}"#).unwrap(),
            ControlMessage::WorkflowStatusRequest
        );
    }

    #[test]
    fn parse_unknown_and_missing_type() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"subscribe"}"#).unwrap(),
            ControlMessage::Unknown(Some("subscribe".into()))
        );
        assert_eq!(
            ControlMessage::parse(r#"{"hello":"world"}"#).unwrap(),
            ControlMessage::Unknown(None)
        );
        assert_eq!(ControlMessage::parse("[1,2]").unwrap(), ControlMessage::Unknown(None));
        assert_eq!(
            ControlMessage::parse(r#"{"type":7}"#).unwrap(),
            ControlMessage::Unknown(None)
        );
    }

    #[test]
    fn parse_malformed_is_error() {
        assert!(ControlMessage::parse("{not json").is_err());
        assert!(ControlMessage::parse("").is_err());
    }
}
