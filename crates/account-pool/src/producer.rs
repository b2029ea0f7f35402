//! Source of fresh accounts and of first-time session tokens
//!
//! How accounts are actually created or logged into is opaque to the pool.
//! The service binary provides a command-driven implementation; tests use
//! in-process stubs.

use serde::Deserialize;

use crate::account::NewAccount;
use crate::error::Result;
use crate::storage::BoxFuture;

/// A credential freshly produced by the outside world.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducedAccount {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Some producers log in as part of registration
    #[serde(default)]
    pub token: Option<String>,
}

impl From<ProducedAccount> for NewAccount {
    fn from(produced: ProducedAccount) -> Self {
        NewAccount {
            email: produced.email,
            password: produced.password.into(),
            first_name: produced.first_name,
            last_name: produced.last_name,
            metadata: produced.metadata,
            token: produced.token.map(Into::into),
        }
    }
}

/// Creates accounts and obtains their first session token.
pub trait AccountProducer: Send + Sync {
    /// Produce one new account. Returning an error is an ordinary failed
    /// attempt; the replenishment loop logs it and carries on.
    fn create(&self) -> BoxFuture<'_, Result<ProducedAccount>>;

    /// Log in with the stored credentials. `Ok(None)` means the login
    /// completed but yielded no token.
    fn login<'a>(&'a self, email: &'a str, password: &'a str)
    -> BoxFuture<'a, Result<Option<String>>>;
}
