//! Error types for pool operations
//!
//! Expected outcomes (duplicate email, empty pool, unknown id) are ordinary
//! return values, not errors. What lands here is unexpected: storage faults,
//! failed token exchanges and producer failures.

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    TokenExchange(#[from] token_exchange::Error),

    #[error("account producer failed: {0}")]
    Producer(String),

    #[error("invalid account status: {0:?}")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
