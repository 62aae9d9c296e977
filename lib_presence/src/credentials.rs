//! # Credential Sources
//!
//! The presence client never issues tokens; it only presents one that was
//! obtained elsewhere. A [`CredentialSource`] is asked for the current bearer
//! token every time a link is about to be opened, so a token refreshed or
//! removed between reconnects is picked up.

use std::env;
use std::fs;
use std::path::PathBuf;

/// Resolves the bearer credential presented on the wire.
pub trait CredentialSource: Send + Sync {
    /// The raw stored credential, if any.
    fn raw_token(&self) -> Option<String>;

    /// The credential ready for the `authenticate` frame: trimmed, without a
    /// `Bearer ` prefix, and `None` when empty.
    fn bearer_token(&self) -> Option<String> {
        self.raw_token().and_then(|raw| normalize_token(&raw))
    }
}

/// Strips whitespace and a leading `Bearer ` scheme. A bare scheme is no token.
pub fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed == "Bearer" {
        return None;
    }
    let token = trimmed.strip_prefix("Bearer ").unwrap_or(trimmed).trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// First characters of a token, for log lines.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{}...", prefix)
}

/// A fixed token, typically handed over by whatever performed the login.
#[derive(Debug, Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Wraps `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// A source that never has a credential.
    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticToken {
    fn raw_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from an environment variable on every lookup.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    /// Reads from `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialSource for EnvToken {
    fn raw_token(&self) -> Option<String> {
        match env::var(&self.var) {
            Ok(value) => Some(value),
            Err(env::VarError::NotPresent) => None,
            Err(e) => {
                log::warn!("Credential variable {} unreadable: {}", self.var, e);
                None
            }
        }
    }
}

/// Reads the token from a file on every lookup; a missing file means signed out.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    /// Reads from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for TokenFile {
    fn raw_token(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Token file {} unreadable: {}", self.path.display(), e);
                None
            }
        }
    }
}
