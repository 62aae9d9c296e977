//! # Presence Core
//!
//! Everything between the transport and the consumers of presence state.
//!
//! ## Components, leaf first:
//!
//! - **`backoff`**: pure mapping from attempt number to retry delay, capped.
//!
//! - **`periodic`**: restartable interval timers. The heartbeat keeper and
//!   the resync scheduler are both built on it.
//!
//! - **`throttle`**: trailing-edge coalescing for user-driven sends such as
//!   the privacy toggle.
//!
//! - **`store`** and **`dispatcher`**: the server-authoritative map of online
//!   users, and the per-frame routing that feeds it.
//!
//! - **`registry`**: a size-one pool so that several managers in one process
//!   never open competing sockets.
//!
//! - **`manager`**: the actor that owns the link and drives all of the above.

/// Exponential backoff with a ceiling.
pub mod backoff;
/// The inbound frame router.
pub mod dispatcher;
/// Events published to consumers.
pub mod events;
/// The connection manager actor and its client handle.
pub mod manager;
/// Restartable periodic timers.
pub mod periodic;
/// The shared size-one link pool.
pub mod registry;
/// The online-user store and its read-only view.
pub mod store;
/// Trailing-edge throttling.
pub mod throttle;

#[cfg(test)]
mod tests;

pub use backoff::BackoffPolicy;
pub use dispatcher::{Dispatched, Dispatcher};
pub use manager::{ClientDeps, ConnectionState, ConnectionStatus, PresenceClient};
pub use periodic::{HeartbeatKeeper, ResyncScheduler};
pub use registry::{LinkRegistry, SharedLinkEvent};
pub use throttle::Throttler;
