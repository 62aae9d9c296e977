//! # Presence Service Live Test
//!
//! Connects to a running presence service through the real WebSocket
//! transport and checks the full client handshake end to end:
//!
//! 1. `authenticate` is accepted (no error frame, no terminal close);
//! 2. a presence snapshot arrives after the settle delay;
//! 3. an on-demand `request_update` produces another snapshot;
//! 4. a privacy toggle round-trips without tearing the channel down;
//! 5. `disconnect` clears the local presence view.
//!
//! The process exits with a non-zero status on the first failed step.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio::time::timeout;

use lib_presence::credentials::{EnvToken, StaticToken, CredentialSource};
use lib_presence::preferences::MemoryPreferences;
use lib_presence::transport::ws::WsConnector;
use lib_presence::{ClientDeps, PresenceClient, PresenceConfig, PresenceEvent};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Origin of the web application hosting the presence route
    #[clap(long, default_value = "http://localhost:8000")]
    origin: String,

    /// Bearer token; falls back to the PRESENCE_TOKEN environment variable
    #[clap(long)]
    token: Option<String>,

    /// Seconds to wait for each step
    #[clap(long, default_value_t = 15)]
    step_timeout_seconds: u64,
}

/// Waits for the next snapshot, failing on notices and terminal closes.
async fn next_snapshot(events: &mut broadcast::Receiver<PresenceEvent>, wait: Duration) -> Result<usize> {
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(PresenceEvent::PresenceUpdated { count }) => return Ok(count),
                Ok(PresenceEvent::Notice(notice)) => bail!("service refused: {}", notice),
                Ok(PresenceEvent::ServerError(message)) => bail!("server error: {}", message),
                Ok(PresenceEvent::Disconnected { code, reason }) => {
                    println!("   ...link closed ({} {}), waiting for retry", code, reason)
                }
                Ok(other) => println!("   ...{:?}", other),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("client stopped"),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out after {:?}", wait))?
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let args = Args::parse();
    let wait = Duration::from_secs(args.step_timeout_seconds);

    let credentials: Arc<dyn CredentialSource> = match args.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(EnvToken::new("PRESENCE_TOKEN")),
    };
    let deps = ClientDeps::new(Arc::new(WsConnector), credentials, Arc::new(MemoryPreferences::default()));
    let config = PresenceConfig::with_origin(args.origin.clone());

    println!("--- Starting Presence Live Test against {} ---", args.origin);
    let client = PresenceClient::spawn(config, deps, None)?;
    let mut events = client.subscribe();

    // --- TEST 1 + 2: handshake and first snapshot ---
    client.connect()?;
    let count = next_snapshot(&mut events, wait).await?;
    println!("✅ Snapshot received: {} user(s) online", count);
    for user in client.presence().sorted_by_recency() {
        println!("   #{} {} (last activity {})", user.user_id, user.display_name, user.last_activity);
    }

    // --- TEST 3: on-demand refresh ---
    client.request_update()?;
    let count = next_snapshot(&mut events, wait).await?;
    println!("✅ Refresh answered: {} user(s) online", count);

    // --- TEST 4: privacy toggle keeps the channel up ---
    client.set_privacy_mode(true)?;
    client.set_privacy_mode(false)?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    if !client.is_connected() {
        bail!("channel dropped after privacy toggle: {:?}", client.status());
    }
    println!("✅ Privacy toggle sent, channel still open");

    // --- TEST 5: disconnect clears local state ---
    client.disconnect()?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    if client.presence().count() != 0 || client.is_connected() {
        bail!("disconnect left state behind: {:?}", client.status());
    }
    println!("✅ Disconnected cleanly");

    println!("--- Presence Live Test passed ---");
    Ok(())
}
