//! Error types for the console engine and its transport adapters.
//!
//! Failures are contained where they happen:
//!
//! - **Per-session failures** (stream read/write errors) terminate that session
//!   only and are logged, never propagated to sibling sessions.
//! - **Bootstrap failures** (bad host key, bad authorized keys) are returned
//!   from adapter construction; the adapter is never started.
//! - **Listener failures** end the adapter's accept loop and are returned to
//!   the owner of the adapter.
//!
//! Chat link publish failures go through [`is_retryable_error`] to decide
//! whether the outbound publisher retries them.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by consoles and adapters.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Host key or authorized keys material could not be parsed.
    #[error("invalid key material: {0}")]
    Key(String),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The pub/sub link rejected an operation.
    #[error("chat link error: {0}")]
    ChatLink(String),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// The stream was already released.
    #[error("console stream closed")]
    Closed,
}

/// Publish failure patterns that will not go away by retrying.
const PERMANENT_ERRORS: &[&str] = &[
    "not authorized",
    "bad user name or password",
    "permission denied",
    "topic name invalid",
    "payload too large",
    "malformed",
];

/// Publish failure patterns caused by a transient link condition.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "not connected",
    "broker unavailable",
    "server unavailable",
    "queue full",
    "temporary failure",
    "broken pipe",
    "would block",
];

/// Determines if a chat link error is transient and the publish should be retried.
///
/// Permanent patterns are checked first and win over retryable ones, so
/// "timeout while not authorized" is not retried. Messages matching neither
/// list are retried unless they mention the protocol itself ("mqtt"), in
/// which case only connection/timeout wording makes them retryable.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    for permanent in PERMANENT_ERRORS {
        if error_lower.contains(permanent) {
            return false;
        }
    }

    for retryable in RETRYABLE_ERRORS {
        if error_lower.contains(retryable) {
            return true;
        }
    }

    !error_lower.contains("mqtt")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
