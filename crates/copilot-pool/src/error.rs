//! Error types for pool operations

use std::time::Duration;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup invariant: the pool must hold at least one credential.
    #[error("no refresh credentials configured")]
    Empty,

    #[error("unknown credential index {0}")]
    UnknownCredential(usize),

    /// Every credential is rate limited (or excluded for this request).
    /// `retry_after` is the time until the earliest backoff deadline, when
    /// one exists.
    #[error("all credentials rate limited or unusable")]
    Exhausted { retry_after: Option<Duration> },

    #[error("token exchange failed: {0}")]
    TokenExchange(#[from] copilot_auth::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
