//! # Inbound Message Dispatcher
//!
//! Stateless routing of inbound text frames. Each frame is decoded once and
//! routed by its discriminant:
//!
//! - presence snapshot: replaces the store atomically, then announces the new count;
//! - error: re-published as an ambient `ServerError` event;
//! - heartbeat ack: nothing to do, the round trip itself is the signal;
//! - task activity: re-published as `TaskStarted` / `TaskCompleted`.
//!
//! Decoding failures are logged and dropped here. Nothing in this module can
//! fail in a way that reaches the transport.

use tokio::sync::broadcast;

use crate::core::events::PresenceEvent;
use crate::core::store::{PresenceStore, PresenceView};
use crate::protocol::{InboundFrame, TaskAction};

/// What a dispatched frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The store now holds this many users.
    Snapshot(usize),
    /// The server sent an error message.
    ServerError(String),
    /// Heartbeat reply.
    HeartbeatAck,
    /// A task activity broadcast (re-emitted or ignored by action).
    Activity,
    /// A well-formed frame nobody handles.
    Ignored,
    /// The frame could not be decoded and was dropped.
    Discarded,
}

impl Dispatched {
    /// Whether the frame was valid protocol traffic.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Dispatched::Discarded)
    }
}

/// Routes inbound frames into the presence store and the event stream.
pub struct Dispatcher {
    store: PresenceStore,
    events: broadcast::Sender<PresenceEvent>,
}

impl Dispatcher {
    /// Creates a dispatcher owning a fresh store.
    pub fn new(events: broadcast::Sender<PresenceEvent>) -> Self {
        Self {
            store: PresenceStore::new(),
            events,
        }
    }

    /// Read-only handle on the store.
    pub fn view(&self) -> PresenceView {
        self.store.view()
    }

    /// Empties the store, announcing the change if anything was removed.
    pub fn clear(&self) {
        if self.store.count() > 0 {
            self.store.clear();
            self.publish(PresenceEvent::PresenceUpdated { count: 0 });
        }
    }

    /// Decodes and routes one frame.
    pub fn dispatch(&self, text: &str) -> Dispatched {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Discarding inbound frame: {}", e);
                log::trace!("Discarded frame body: {}", text);
                return Dispatched::Discarded;
            }
        };

        match frame {
            InboundFrame::PresenceSnapshot(users) => {
                let count = self.store.replace_all(users);
                log::debug!("Presence snapshot applied: {} user(s) online", count);
                self.publish(PresenceEvent::PresenceUpdated { count });
                Dispatched::Snapshot(count)
            }
            InboundFrame::Error { message } => {
                log::warn!("Presence service reported an error: {}", message);
                self.publish(PresenceEvent::ServerError(message.clone()));
                Dispatched::ServerError(message)
            }
            InboundFrame::HeartbeatAck => {
                log::trace!("Heartbeat acknowledged");
                Dispatched::HeartbeatAck
            }
            InboundFrame::TaskActivity(activity) => {
                match activity.action {
                    TaskAction::Started => self.publish(PresenceEvent::TaskStarted(activity)),
                    TaskAction::Completed => self.publish(PresenceEvent::TaskCompleted(activity)),
                    TaskAction::Other => {
                        log::debug!("Ignoring task activity with unhandled action from user {}", activity.sender_id)
                    }
                }
                Dispatched::Activity
            }
            InboundFrame::Unknown => {
                log::debug!("Ignoring inbound frame with unknown discriminant");
                Dispatched::Ignored
            }
        }
    }

    fn publish(&self, event: PresenceEvent) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.events.send(event);
    }
}
