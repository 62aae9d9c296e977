//! Error types for the presence client.
//!
//! Only the synchronous edges of the client return these: constructing a
//! client, calling `connect()` without a credential, and talking to a client
//! whose actor has already stopped. Everything that happens on the live
//! channel is reported through `ConnectionStatus` and `PresenceEvent` instead.

use thiserror::Error;

/// Errors surfaced to callers of the presence client.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// No bearer credential could be resolved; no network I/O was attempted.
    #[error("No credential available; sign in before connecting to the presence service")]
    Unauthenticated,

    /// The manager task has exited, so commands can no longer be delivered.
    #[error("Presence client has stopped")]
    ClientStopped,

    /// The configured origin cannot be turned into WebSocket endpoints.
    #[error("Invalid presence endpoint: {0}")]
    InvalidEndpoint(String),

    /// URL parsing failed.
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Reading or writing a local file (token, preferences, config) failed.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// Local JSON content (preferences, config) could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration value is out of range or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors produced while decoding an inbound frame.
///
/// These never leave the dispatcher: a bad frame is logged and dropped so that
/// one malformed message cannot tear the channel down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The frame is JSON but does not match the shape its discriminant promises.
    #[error("Invalid {kind} frame: {source}")]
    InvalidFrame {
        /// The discriminant that was recognized.
        kind: &'static str,
        /// The underlying decoding failure.
        #[source]
        source: serde_json::Error,
    },
}
