//! # Presence Client Configuration
//!
//! All timing constants and endpoint settings used by the connection manager.
//! Values are plain milliseconds so the struct can be overlaid from JSON files
//! and command-line flags alike; the accessors hand out `Duration`s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::backoff::BackoffPolicy;
use crate::error::PresenceError;

/// Default application path that the reverse proxy forwards to the presence service.
pub const DEFAULT_PRIMARY_PATH: &str = "/api/online-users/ws";
/// Default port the presence service listens on when reached directly.
pub const DEFAULT_FALLBACK_PORT: u16 = 8002;
/// Default path on the direct endpoint.
pub const DEFAULT_FALLBACK_PATH: &str = "/ws";

/// Configuration for one presence client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceConfig {
    /// Origin of the web application, e.g. `https://study.example.com`.
    pub origin: String,
    /// Path of the proxied WebSocket route on the origin.
    pub primary_path: String,
    /// Port of the direct presence endpoint used as a one-time fallback.
    pub fallback_port: u16,
    /// Path on the direct presence endpoint.
    pub fallback_path: String,
    /// Backoff base delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Retry budget for non-terminal closures.
    pub max_reconnect_attempts: u32,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Full-snapshot resync period in milliseconds.
    pub resync_interval_ms: u64,
    /// Delay between `authenticate` and the follow-up frames, in milliseconds.
    pub settle_delay_ms: u64,
    /// Throttle window for user-driven privacy toggles, in milliseconds.
    pub privacy_throttle_ms: u64,
    /// Time allowed between `open` and the first inbound frame. `0` disables it.
    pub handshake_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost".to_string(),
            primary_path: DEFAULT_PRIMARY_PATH.to_string(),
            fallback_port: DEFAULT_FALLBACK_PORT,
            fallback_path: DEFAULT_FALLBACK_PATH.to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 3000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            resync_interval_ms: 60_000,
            settle_delay_ms: 500,
            privacy_throttle_ms: 1000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl PresenceConfig {
    /// Returns a default configuration pointed at `origin`.
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Default::default()
        }
    }

    /// Overlays a JSON file onto the defaults. Keys absent from the file keep
    /// their default values.
    #[cfg(feature = "configs")]
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, PresenceError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PresenceConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        log::debug!("Loaded presence config from {}", path.display());
        Ok(config)
    }

    /// Rejects settings the manager cannot run with.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(PresenceError::Config(format!(
                "reconnectBaseDelayMs ({}) exceeds reconnectMaxDelayMs ({})",
                self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.resync_interval_ms == 0 {
            return Err(PresenceError::Config(
                "heartbeat and resync intervals must be non-zero".to_string(),
            ));
        }
        self.endpoints().map(|_| ())
    }

    /// Resolves the primary and fallback WebSocket endpoints from the origin.
    pub fn endpoints(&self) -> Result<Endpoints, PresenceError> {
        Endpoints::resolve(self)
    }

    /// Backoff policy built from the reconnect delays.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Resync period.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    /// Authentication settling delay.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Privacy toggle throttle window.
    pub fn privacy_throttle(&self) -> Duration {
        Duration::from_millis(self.privacy_throttle_ms)
    }

    /// Handshake timeout, `None` when disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }
}

/// Which of the two endpoints a link was opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// The proxied application route.
    Primary,
    /// The direct service port.
    Fallback,
}

/// The pair of WebSocket URLs a connect attempt may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Proxied route on the application origin.
    pub primary: Url,
    /// Direct route to the presence service.
    pub fallback: Url,
}

impl Endpoints {
    fn resolve(config: &PresenceConfig) -> Result<Self, PresenceError> {
        let origin = Url::parse(&config.origin)?;
        let scheme = match origin.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(PresenceError::InvalidEndpoint(format!(
                    "unsupported origin scheme '{}'",
                    other
                )))
            }
        };
        let host = origin
            .host_str()
            .ok_or_else(|| PresenceError::InvalidEndpoint(format!("origin '{}' has no host", config.origin)))?;

        let authority = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let primary = Url::parse(&format!(
            "{}://{}{}",
            scheme,
            authority,
            normalize_path(&config.primary_path)
        ))?;
        let fallback = Url::parse(&format!(
            "{}://{}:{}{}",
            scheme,
            host,
            config.fallback_port,
            normalize_path(&config.fallback_path)
        ))?;

        Ok(Self { primary, fallback })
    }

    /// Returns the URL for `kind`.
    pub fn get(&self, kind: EndpointKind) -> &Url {
        match kind {
            EndpointKind::Primary => &self.primary,
            EndpointKind::Fallback => &self.fallback,
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
