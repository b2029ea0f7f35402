//! Error types for token renewal

/// Errors from the token exchange protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("verifier length {0} outside 43..=128")]
    InvalidVerifierLength(usize),
}

/// Result alias for token exchange operations.
pub type Result<T> = std::result::Result<T, Error>;
