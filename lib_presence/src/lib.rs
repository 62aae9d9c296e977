//! # lib_presence
//!
//! Client side of the real-time presence channel: one authenticated WebSocket
//! per process, kept alive with an application heartbeat, periodically
//! resynchronised, and recovered with bounded exponential backoff. The set of
//! online users is held in a server-authoritative store that consumers read
//! through a [`PresenceView`].
//!
//! ```no_run
//! # #[cfg(feature = "ws")]
//! # async fn demo() -> Result<(), lib_presence::PresenceError> {
//! use std::sync::Arc;
//! use lib_presence::{PresenceClient, PresenceConfig, ClientDeps};
//! use lib_presence::credentials::EnvToken;
//! use lib_presence::preferences::MemoryPreferences;
//! use lib_presence::transport::ws::WsConnector;
//!
//! let deps = ClientDeps::new(
//!     Arc::new(WsConnector),
//!     Arc::new(EnvToken::new("PRESENCE_TOKEN")),
//!     Arc::new(MemoryPreferences::default()),
//! );
//! let client = PresenceClient::spawn(PresenceConfig::default(), deps, None)?;
//! client.connect()?;
//! println!("{} users online", client.presence().count());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod core;
pub mod credentials;
pub mod error;
pub mod preferences;
pub mod protocol;
pub mod transport;

#[cfg(feature = "loggers")]
pub mod loggers;

// --- Public API Re-exports ---
pub use config::PresenceConfig;
pub use core::events::{Notice, PresenceEvent};
pub use core::manager::{ClientDeps, ConnectionState, ConnectionStatus, PresenceClient};
pub use core::registry::LinkRegistry;
pub use core::store::{PresenceStore, PresenceView};
pub use error::{PresenceError, ProtocolError};
pub use protocol::{InboundFrame, OutboundFrame, PresenceRecord, TaskAction, TaskActivity};
