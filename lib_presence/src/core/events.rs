//! Events the presence client publishes to its consumers.

use std::fmt;
use std::time::Duration;

use crate::protocol::TaskActivity;

/// A condition the user should be told about explicitly. Transient drops are
/// retried silently and never produce one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The service refused the connection because it is full.
    ServerAtCapacity,
    /// This user already has as many connections as the service allows.
    UserConnectionLimit,
    /// The retry budget ran out.
    ServiceUnreachable,
}

impl Notice {
    /// Short title.
    pub fn title(&self) -> &'static str {
        match self {
            Notice::ServerAtCapacity => "Server busy",
            Notice::UserConnectionLimit => "Connection limit reached",
            Notice::ServiceUnreachable => "Connection failed",
        }
    }

    /// User-facing, actionable description.
    pub fn message(&self) -> &'static str {
        match self {
            Notice::ServerAtCapacity => "The presence service has reached its connection limit, please try again later",
            Notice::UserConnectionLimit => {
                "You have reached your connection limit, please close other tabs and try again"
            }
            Notice::ServiceUnreachable => "Unable to reach the presence service, please refresh and try again",
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.message())
    }
}

/// Everything observable about the client, in order of occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The handshake settled; presence updates will follow.
    Connected,
    /// The channel closed.
    Disconnected {
        /// WebSocket close code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
    /// A retry was scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// The presence map was replaced.
    PresenceUpdated {
        /// New number of online users.
        count: usize,
    },
    /// The server reported an error; the channel is still open.
    ServerError(String),
    /// Another user started a task.
    TaskStarted(TaskActivity),
    /// Another user completed a task.
    TaskCompleted(TaskActivity),
    /// The local privacy flag changed.
    PrivacyModeChanged(bool),
    /// A user-facing condition.
    Notice(Notice),
}
