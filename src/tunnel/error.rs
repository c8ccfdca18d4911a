//! Error types for the tunnel controller and its SSH collaborator.
//!
//! [`TunnelError`] is what an acquire caller sees. Three variants can reach
//! that caller:
//!
//! 1. **Configuration**: the supplied configuration failed validation. Nothing
//!    was resolved, connected or counted.
//! 2. **KeyResolution**: the private key file could not be read. Raised before
//!    any connection attempt.
//! 3. **Establishment**: the tunneling collaborator reported a failure (or the
//!    optional establish timeout expired). No handle is kept.
//!
//! `Teardown` only ever comes out of a handle's `close` and is swallowed by
//! the session, since teardown is best-effort.
//!
//! # Retry classification
//!
//! The controller never retries. The russh collaborator does retry its own
//! jump-host connect, and uses [`is_retryable_error`] to tell transient
//! network failures from permanent ones. Authentication failures take
//! precedence: a message carrying both authentication and connection keywords
//! is not retried, to avoid locking accounts with bad credentials.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid tunnel configuration: {0}")]
    Configuration(String),
    #[error("failed to read private key file {path:?}: {source}")]
    KeyResolution {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel establishment failed: {0}")]
    Establishment(String),
    #[error("tunnel teardown failed: {0}")]
    Teardown(String),
}

impl TunnelError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, TunnelError::Configuration(_))
    }

    pub fn is_establishment(&self) -> bool {
        matches!(self, TunnelError::Establishment(_))
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if a jump-host connect error is transient and worth retrying.
///
/// Authentication patterns are checked first and always win. Unknown errors
/// are retried unless they look like SSH protocol errors, which are only
/// retried when they also mention a timeout or a connect failure.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| error_lower.contains(pattern)) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
    {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
