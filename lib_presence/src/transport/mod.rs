//! # Transport Seam
//!
//! The connection manager never touches a socket directly. It asks a
//! [`Connector`] to open a link and then only sees what the link reports
//! through its [`TransportSink`]: `Opened`, text `Message`s, `Error`, and a
//! final `Closed`. Opening returns immediately; the outcome arrives later as
//! events, which mirrors the callback model of a browser WebSocket.
//!
//! Each link is tagged with a [`LinkId`] so that events from a link the
//! manager has already abandoned can be recognised and dropped.

use tokio::sync::mpsc;
use url::Url;

#[cfg(feature = "ws")]
pub mod ws;

#[cfg(test)]
pub(crate) mod mock;

/// Identifies one connection attempt for its whole lifetime.
pub type LinkId = u64;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer sent a close frame without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the link died without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// What a link reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and can carry frames.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// Something failed. Always followed by `Closed`.
    Error(String),
    /// The link is gone. Nothing follows.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

/// An event tagged with the link that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Originating link.
    pub link: LinkId,
    /// What happened.
    pub event: TransportEvent,
}

/// Reporting side handed to a connector for one link.
#[derive(Debug, Clone)]
pub struct TransportSink {
    link: LinkId,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl TransportSink {
    /// Creates a sink that tags every event with `link`.
    pub fn new(link: LinkId, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { link, tx }
    }

    /// The link this sink reports for.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Reports `event`. Returns `false` once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(LinkEvent { link: self.link, event }).is_ok()
    }
}

/// Instructions from the manager to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Send a text frame.
    Send(String),
    /// Start the close handshake and stop reporting.
    Close {
        /// Close code to send.
        code: u16,
        /// Close reason to send.
        reason: String,
    },
}

/// Control side of an open (or opening) link. Cloneable so the size-1
/// registry can share it with other managers.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    /// Wraps the command channel of a link.
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }

    /// Queues a text frame. Returns `false` if the link task has exited.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(TransportCommand::Send(text)).is_ok()
    }

    /// Asks the link to close.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(TransportCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Whether the link task is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Opens links to presence endpoints.
pub trait Connector: Send + Sync + 'static {
    /// Starts opening a link to `endpoint`. Must not block; every outcome is
    /// reported through `sink`, ending with exactly one `Closed`.
    fn open(&self, endpoint: &Url, sink: TransportSink) -> TransportHandle;
}
