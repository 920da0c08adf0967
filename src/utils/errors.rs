// src/utils/errors.rs
//! Error types
//!
//! `NetworkRequestAttempted` is the only error that ever reaches code under
//! test. Everything else in `AirgapError` is an internal condition: hook
//! installation problems, configuration mistakes, bridge lookups.

use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Port value used by the name-resolution hooks, where no connection
/// (and therefore no port) exists yet.
pub const NAME_RESOLUTION_PORT: i32 = -1;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, AirgapError>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum AirgapError {
    #[error(transparent)]
    NetworkRequestAttempted(#[from] NetworkRequestAttempted),

    #[error("Interception failed: {0}")]
    InterceptionFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid host pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Raised synchronously at the call site of a blocked connection or lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkRequestAttempted {
    /// Destination host (hostname or IP literal)
    pub host: String,

    /// Destination port, or `NAME_RESOLUTION_PORT` for lookups
    pub port: i32,

    /// Tag identifying the interception point that observed the attempt
    pub caller: String,

    /// Truncated call stack of the attempt
    pub stack: String,
}

impl NetworkRequestAttempted {
    pub fn new(
        host: impl Into<String>,
        port: i32,
        caller: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            caller: caller.into(),
            stack: stack.into(),
        }
    }

    /// `host:port`, or `host (name resolution)` for lookups
    pub fn destination(&self) -> String {
        if self.port == NAME_RESOLUTION_PORT {
            format!("{} (name resolution)", self.host)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Single-line message without the stack snippet
    pub fn message(&self) -> String {
        format!(
            "Network request blocked: {} (caller: {})",
            self.destination(),
            self.caller
        )
    }
}

impl fmt::Display for NetworkRequestAttempted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())?;
        if !self.stack.is_empty() {
            write!(f, "\n{}", self.stack)?;
        }
        Ok(())
    }
}

impl std::error::Error for NetworkRequestAttempted {}

impl From<NetworkRequestAttempted> for io::Error {
    fn from(err: NetworkRequestAttempted) -> Self {
        io::Error::new(io::ErrorKind::PermissionDenied, err)
    }
}

/// Recover the structured error from an `io::Error` produced by a hook
pub fn blocked_request(err: &io::Error) -> Option<&NetworkRequestAttempted> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<NetworkRequestAttempted>())
}
