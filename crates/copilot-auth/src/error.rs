//! Error types for token exchange operations

/// Errors from the token exchange. None of these are retried here — the
/// caller decides whether to try a different credential.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token exchange request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("invalid token response: {0}")]
    Parse(String),
}

/// Result alias for token exchange operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_error_includes_status_and_body() {
        let err = Error::Endpoint {
            status: 403,
            body: "bad credentials".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("403"), "got: {msg}");
        assert!(msg.contains("bad credentials"), "got: {msg}");
    }

    #[test]
    fn error_debug_includes_variant_name() {
        let err = Error::Http("connection refused".into());
        assert!(format!("{err:?}").contains("Http"));
    }
}
