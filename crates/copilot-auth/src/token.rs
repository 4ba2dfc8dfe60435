//! Token exchange against the Copilot token endpoint
//!
//! One operation: trade a refresh credential for a short-lived access token.
//! The endpoint is GitHub's API host (`api.github.com`), not the inference
//! host (`api.individual.githubcopilot.com`). Authentication uses the
//! `token` scheme, not `Bearer` — that is what the upstream expects for
//! refresh credentials.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::EDITOR_VERSION;
use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_at` is an absolute unix timestamp in seconds, unlike the more
/// common `expires_in` delta. Unknown fields (tracking ids, endpoint maps)
/// are ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Short-lived bearer token for the completions endpoint
    pub token: String,
    /// Absolute expiry, unix seconds
    pub expires_at: u64,
    /// Capability flag: whether this token is enabled for chat
    #[serde(default)]
    pub chat_enabled: Option<bool>,
}

impl TokenResponse {
    /// Whether the token is still usable at `now` (unix seconds), keeping
    /// `margin_secs` of headroom before the actual expiry.
    pub fn is_fresh(&self, now: u64, margin_secs: u64) -> bool {
        self.expires_at > now + margin_secs
    }
}

/// Exchange a refresh credential for an access token.
///
/// Performs a single GET against `token_url`; no retry, no backoff. A
/// non-success status, transport failure, or unparsable body all map to an
/// error — the pool owns the decision of what to do with this credential
/// afterwards. `timeout` bounds the whole exchange so a hung endpoint
/// fails the call rather than stalling it.
pub async fn fetch_access_token(
    client: &reqwest::Client,
    token_url: &str,
    refresh_secret: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .get(token_url)
        .header("Authorization", format!("token {refresh_secret}"))
        .header("editor-version", EDITOR_VERSION)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Endpoint {
            status: status.as_u16(),
            body,
        });
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Parse(e.to_string()))?;

    debug!(expires_at = token.expires_at, "access token obtained");
    Ok(token)
}
