/// `fern` dispatcher setup with coloured console output and file rotation.
pub mod setup;

pub use setup::{cleanup_old_logs, parse_level, setup_logging, LoggerError};
