use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;

use lib_presence::credentials::{CredentialSource, StaticToken, TokenFile};
use lib_presence::loggers;
use lib_presence::preferences::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
use lib_presence::transport::ws::WsConnector;
use lib_presence::{ClientDeps, ConnectionState, LinkRegistry, PresenceClient};

mod presence_logic;
use presence_logic::{config, monitor};

async fn wait_for_disconnect(client: &PresenceClient) {
    let mut status = client.status_receiver();
    while status.borrow().state != ConnectionState::Disconnected {
        if status.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let log_path = loggers::setup_logging(&log_dir, &log_level)?;
    log::info!("Logging to {}", log_path.display());

    let credentials: Arc<dyn CredentialSource> = match (&config.token, &config.token_file) {
        (Some(token), _) => Arc::new(StaticToken::new(token.clone())),
        (None, Some(path)) => Arc::new(TokenFile::new(path.clone())),
        (None, None) => Arc::new(StaticToken::none()),
    };
    let preferences: Arc<dyn PreferenceStore> = match &config.prefs_path {
        Some(path) => Arc::new(JsonFilePreferences::new(path.clone())),
        None => Arc::new(MemoryPreferences::default()),
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let deps = ClientDeps::new(Arc::new(WsConnector), credentials, preferences).with_registry(LinkRegistry::global());
    let client = PresenceClient::spawn(config.presence_config(), deps, Some(shutdown_tx.subscribe()))?;

    if let Some(enabled) = config.privacy_mode {
        client.set_privacy_mode(enabled)?;
    }
    if let Err(e) = client.connect() {
        log::error!("Cannot connect to the presence service: {}", e);
        return Err(e.into());
    }

    let report_every = Duration::from_secs(config.report_interval_seconds.unwrap_or(30).max(1));
    let monitor_handle = tokio::spawn(monitor::run(client.clone(), report_every, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, logging out.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, logging out.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // The presence client treats shutdown as a logout.
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(2), wait_for_disconnect(&client)).await;
    let _ = monitor_handle.await;
    // Give the link task a moment to put the close frame on the wire.
    tokio::time::sleep(Duration::from_millis(250)).await;

    log::info!("Shutdown complete.");
    Ok(())
}
