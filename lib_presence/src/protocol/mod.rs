//! # Presence Wire Protocol
//!
//! JSON text frames exchanged with the presence service. Outbound frames are an
//! internally tagged enum on `type`. Inbound frames use two discriminants: the
//! snapshot broadcast is keyed on `action`, everything else on `type`; decoding
//! checks `action` first and then falls through to a tagged enum with an
//! explicit catch-all, so unknown frames are recognized and ignored rather
//! than reported as errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// `action` value of a presence snapshot broadcast.
pub const SNAPSHOT_ACTION: &str = "online_users_updated";

/// One online user, as asserted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Stable identity; key of the presence map.
    #[serde(rename = "id")]
    pub user_id: i64,
    /// Name shown in presence lists.
    #[serde(rename = "username")]
    pub display_name: String,
    /// Unix timestamp of the user's last activity; used only for ordering.
    #[serde(rename = "lastActivity")]
    pub last_activity: i64,
    /// Hides granular activity details when set.
    #[serde(rename = "privacyMode", default)]
    pub privacy_mode: bool,
    /// Avatar reference, if the user has one.
    #[serde(rename = "avatar", default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// What happened to a task in an activity broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// The sender started a task.
    Started,
    /// The sender completed a task.
    Completed,
    /// Any other action; recognized but not re-emitted.
    #[serde(other)]
    Other,
}

/// Task details carried by an activity broadcast. The service fills both the
/// `name`/`title` and `start`/`start_time` spellings; only one of each is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task id.
    #[serde(default)]
    pub id: Option<i64>,
    /// Task name.
    #[serde(default)]
    pub name: Option<String>,
    /// Task title.
    #[serde(default)]
    pub title: Option<String>,
    /// Task status string.
    #[serde(default)]
    pub status: Option<String>,
    /// Completion flag.
    #[serde(default)]
    pub completed: Option<bool>,
    /// Start time as sent by the service.
    #[serde(default)]
    pub start_time: Option<Value>,
    /// End time as sent by the service.
    #[serde(default)]
    pub end_time: Option<Value>,
    /// Duration in minutes.
    #[serde(default)]
    pub duration: Option<f64>,
}

impl TaskSummary {
    /// The title if present, otherwise the name.
    pub fn label(&self) -> Option<&str> {
        self.title.as_deref().or(self.name.as_deref())
    }
}

/// A task-started / task-completed broadcast from another user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskActivity {
    /// What happened.
    pub action: TaskAction,
    /// Which task.
    #[serde(default)]
    pub task: TaskSummary,
    /// Who it happened to.
    pub sender_id: i64,
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// First frame on every new channel.
    Authenticate {
        /// Bearer credential without the `Bearer ` prefix.
        token: String,
    },
    /// Mirrors the local privacy flag to the server.
    PrivacyMode {
        /// Whether privacy mode is on.
        enabled: bool,
    },
    /// Asks for a full presence snapshot.
    #[serde(rename = "get_online_users")]
    RequestSnapshot,
    /// Application-level liveness probe.
    Heartbeat,
    /// Publishes a task start/completion for re-broadcast to other users.
    TaskUpdate {
        /// What happened.
        action: TaskAction,
        /// Task payload, forwarded as-is by the service.
        task: Value,
    },
}

impl OutboundFrame {
    /// JSON text of the frame.
    pub fn to_text(&self) -> String {
        // Serializing this enum cannot fail: every variant is plain data.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Short name used in log lines; never includes the token.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Authenticate { .. } => "authenticate",
            OutboundFrame::PrivacyMode { .. } => "privacy_mode",
            OutboundFrame::RequestSnapshot => "get_online_users",
            OutboundFrame::Heartbeat => "heartbeat",
            OutboundFrame::TaskUpdate { .. } => "task_update",
        }
    }
}

/// Frames the client receives, after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Complete replacement of the presence set.
    PresenceSnapshot(Vec<PresenceRecord>),
    /// Server-asserted error; the channel stays open.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// Reply to `heartbeat`.
    HeartbeatAck,
    /// Task activity broadcast.
    TaskActivity(TaskActivity),
    /// A well-formed frame with a discriminant this client does not handle.
    Unknown,
}

#[derive(Deserialize)]
struct SnapshotBody {
    users: Vec<PresenceRecord>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedFrame {
    Error { message: String },
    HeartbeatAck,
    TaskUpdate(TaskActivity),
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Decodes one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        if value.get("action").and_then(Value::as_str) == Some(SNAPSHOT_ACTION) {
            let body: SnapshotBody = serde_json::from_value(value).map_err(|source| ProtocolError::InvalidFrame {
                kind: SNAPSHOT_ACTION,
                source,
            })?;
            return Ok(InboundFrame::PresenceSnapshot(body.users));
        }

        if value.get("type").is_none() {
            // Authentication rejections arrive as a bare {"error": "..."} object.
            return Ok(match value.get("error").and_then(Value::as_str) {
                Some(message) => InboundFrame::Error {
                    message: message.to_string(),
                },
                None => InboundFrame::Unknown,
            });
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map_or("typed", discriminant_name);
        let typed: TypedFrame = serde_json::from_value(value).map_err(|source| ProtocolError::InvalidFrame { kind, source })?;

        Ok(match typed {
            TypedFrame::Error { message } => InboundFrame::Error { message },
            TypedFrame::HeartbeatAck => InboundFrame::HeartbeatAck,
            TypedFrame::TaskUpdate(activity) => InboundFrame::TaskActivity(activity),
            TypedFrame::Unknown => InboundFrame::Unknown,
        })
    }
}

fn discriminant_name(kind: &str) -> &'static str {
    match kind {
        "error" => "error",
        "heartbeat_ack" => "heartbeat_ack",
        "task_update" => "task_update",
        _ => "typed",
    }
}
