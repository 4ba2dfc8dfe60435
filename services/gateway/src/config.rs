//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Refresh tokens are loaded from the REFRESH_TOKENS env var or
//! refresh_tokens_file, never stored in the TOML directly to avoid
//! leaking secrets.

use common::Secret;
use copilot_auth::{COMPLETIONS_ENDPOINT, TOKEN_ENDPOINT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

/// Upstream endpoints and timeouts
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_completions_url")]
    pub completions_url: String,
    /// Upper bound on upstream time to first byte, in seconds. Streamed
    /// bodies are not subject to a total duration limit.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential sources
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(skip)]
    pub refresh_tokens: Vec<Secret<String>>,
    /// Path to a file of newline-separated refresh tokens (alternative to
    /// the REFRESH_TOKENS env var)
    #[serde(default)]
    pub refresh_tokens_file: Option<PathBuf>,
}

fn default_token_url() -> String {
    TOKEN_ENDPOINT.to_owned()
}

fn default_completions_url() -> String {
    COMPLETIONS_ENDPOINT.to_owned()
}

fn default_timeout() -> u64 {
    300
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            completions_url: default_completions_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Split a comma- or newline-separated token list, trimming whitespace and
/// dropping empty entries.
fn parse_token_list(raw: &str) -> Vec<Secret<String>> {
    raw.split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Secret::new(s.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Refresh token resolution order:
    /// 1. REFRESH_TOKENS env var (comma-separated)
    /// 2. refresh_tokens_file path from config (newline-separated)
    ///
    /// Zero credentials is a startup error: a gateway with nothing to
    /// rotate over cannot serve a single request.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        for (field, url) in [
            ("token_url", &config.upstream.token_url),
            ("completions_url", &config.upstream.completions_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{field} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        // Resolve refresh tokens: env var takes precedence over file
        if let Ok(raw) = std::env::var("REFRESH_TOKENS") {
            config.credentials.refresh_tokens = parse_token_list(&raw);
        } else if let Some(ref token_file) = config.credentials.refresh_tokens_file {
            let raw = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read refresh_tokens_file {}: {e}",
                    token_file.display()
                ))
            })?;
            config.credentials.refresh_tokens = parse_token_list(&raw);
        }

        if config.credentials.refresh_tokens.is_empty() {
            return Err(common::Error::Config(
                "no refresh tokens configured: set REFRESH_TOKENS or refresh_tokens_file".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-gateway.toml")
    }
}
