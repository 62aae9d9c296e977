use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use lib_presence::PresenceConfig;

const DEFAULT_CONFIG_FILE: &str = "presence_client.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Real-time presence client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PRESENCE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PRESENCE_ORIGIN", help = "Origin of the web application, e.g. https://study.example.com.")]
    pub origin: Option<String>,

    #[clap(long, env = "PRESENCE_TOKEN", help = "Bearer token. Takes precedence over the token file.")]
    pub token: Option<String>,

    #[clap(long, env = "PRESENCE_TOKEN_FILE", help = "File holding the bearer token.")]
    pub token_file: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_PREFS_PATH", help = "JSON file persisting the privacy flag.")]
    pub prefs_path: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_PRIVACY_MODE", help = "Set the privacy flag on start-up.")]
    pub privacy_mode: Option<bool>,

    #[clap(long, env = "PRESENCE_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_MAX_RECONNECT_ATTEMPTS", help = "Retries before giving up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "PRESENCE_HEARTBEAT_INTERVAL_MS", help = "Heartbeat period in milliseconds.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_RESYNC_INTERVAL_MS", help = "Full snapshot resync period in milliseconds.")]
    pub resync_interval_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_HANDSHAKE_TIMEOUT_MS", help = "Time allowed for the first frame after opening, 0 disables.")]
    pub handshake_timeout_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_REPORT_INTERVAL_SECONDS", help = "Interval in seconds between presence reports in the log.")]
    pub report_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            origin: other.origin.or(self.origin),
            token: other.token.or(self.token),
            token_file: other.token_file.or(self.token_file),
            prefs_path: other.prefs_path.or(self.prefs_path),
            privacy_mode: other.privacy_mode.or(self.privacy_mode),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            resync_interval_ms: other.resync_interval_ms.or(self.resync_interval_ms),
            handshake_timeout_ms: other.handshake_timeout_ms.or(self.handshake_timeout_ms),
            report_interval_seconds: other.report_interval_seconds.or(self.report_interval_seconds),
        }
    }

    /// Library configuration with every value set here applied over its defaults.
    pub fn presence_config(&self) -> PresenceConfig {
        let defaults = PresenceConfig::default();
        PresenceConfig {
            origin: self.origin.clone().unwrap_or(defaults.origin),
            reconnect_base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.reconnect_base_delay_ms),
            reconnect_max_delay_ms: self.reconnect_max_delay_ms.unwrap_or(defaults.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(defaults.max_reconnect_attempts),
            heartbeat_interval_ms: self.heartbeat_interval_ms.unwrap_or(defaults.heartbeat_interval_ms),
            resync_interval_ms: self.resync_interval_ms.unwrap_or(defaults.resync_interval_ms),
            handshake_timeout_ms: self.handshake_timeout_ms.unwrap_or(defaults.handshake_timeout_ms),
            ..defaults
        }
    }
}

fn defaults() -> Config {
    let presence = PresenceConfig::default();
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        origin: Some(presence.origin),
        reconnect_base_delay_ms: Some(presence.reconnect_base_delay_ms),
        reconnect_max_delay_ms: Some(presence.reconnect_max_delay_ms),
        max_reconnect_attempts: Some(presence.max_reconnect_attempts),
        heartbeat_interval_ms: Some(presence.heartbeat_interval_ms),
        resync_interval_ms: Some(presence.resync_interval_ms),
        handshake_timeout_ms: Some(presence.handshake_timeout_ms),
        report_interval_seconds: Some(30),
        ..Default::default()
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults < config file < environment and CLI (`cli`).
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config = current_config.merge(cli);

    // Token and preference files default to ~/.presence
    if current_config.token_file.is_none() || current_config.prefs_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let presence_dir = home_dir.join(".presence");
            if current_config.token_file.is_none() {
                current_config.token_file = Some(presence_dir.join("token"));
            }
            if current_config.prefs_path.is_none() {
                current_config.prefs_path = Some(presence_dir.join("prefs.json"));
            }
        } else {
            log::warn!("Could not determine home directory for default token and preference paths.");
        }
    }

    current_config
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_other() {
        let base = Config {
            origin: Some("http://a".into()),
            log_level: Some("info".into()),
            ..Default::default()
        };
        let over = Config {
            origin: Some("http://b".into()),
            ..Default::default()
        };
        let merged = base.merge(over);
        assert_eq!(merged.origin.as_deref(), Some("http://b"));
        assert_eq!(merged.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        fs::write(
            &path,
            r#"{"origin": "https://file.example", "heartbeatIntervalMs": 15000, "logLevel": "debug"}"#,
        )
        .unwrap();

        let cli = Config {
            config_path: Some(path),
            log_level: Some("warn".into()),
            ..Default::default()
        };
        let config = resolve(cli);

        assert_eq!(config.origin.as_deref(), Some("https://file.example"));
        assert_eq!(config.heartbeat_interval_ms, Some(15000));
        assert_eq!(config.log_level.as_deref(), Some("warn"));
        assert_eq!(config.resync_interval_ms, Some(60000));
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        fs::write(&path, "not json").unwrap();

        let config = resolve(Config {
            config_path: Some(path),
            ..Default::default()
        });
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.report_interval_seconds, Some(30));
    }

    #[test]
    fn test_presence_config_mapping() {
        let config = Config {
            origin: Some("https://study.example.com".into()),
            max_reconnect_attempts: Some(8),
            handshake_timeout_ms: Some(0),
            ..Default::default()
        };
        let presence = config.presence_config();
        assert_eq!(presence.origin, "https://study.example.com");
        assert_eq!(presence.max_reconnect_attempts, 8);
        assert_eq!(presence.handshake_timeout(), None);
        assert_eq!(presence.settle_delay_ms, 500);
    }

    #[test]
    fn test_cli_flags_parse() {
        let config = Config::parse_from([
            "presence_client",
            "--origin",
            "https://cli.example",
            "--privacy-mode",
            "true",
        ]);
        assert_eq!(config.origin.as_deref(), Some("https://cli.example"));
        assert_eq!(config.privacy_mode, Some(true));
    }
}
