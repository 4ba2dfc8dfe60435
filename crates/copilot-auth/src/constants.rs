//! GitHub Copilot endpoint and client identity constants
//!
//! These values are not secrets — they identify the public client the
//! upstream expects to see. The actual secrets (refresh credentials and
//! access tokens) are managed by the pool.

/// Token exchange endpoint. Takes a refresh credential, returns a
/// short-lived access token with an absolute expiry.
pub const TOKEN_ENDPOINT: &str = "https://api.github.com/copilot_internal/v2/token";

/// Chat completions endpoint on the individual Copilot API host.
pub const COMPLETIONS_ENDPOINT: &str =
    "https://api.individual.githubcopilot.com/chat/completions";

/// Editor identity the upstream requires on every call. Requests without
/// it are rejected regardless of token validity.
pub const EDITOR_VERSION: &str = "vscode/1.95.3";

/// Refresh an access token this many seconds before its actual expiry so
/// an upstream call never starts with a token about to lapse.
pub const EXPIRY_SAFETY_MARGIN_SECS: u64 = 300;

/// Upper bound on a single token exchange. The endpoint answers in well
/// under a second when healthy; a hung connection must fail the attempt
/// instead of stalling the request that triggered the refresh.
pub const TOKEN_EXCHANGE_TIMEOUT_SECS: u64 = 30;
