//! Persistence contract for account records
//!
//! Two interchangeable backends implement [`Storage`] with identical
//! semantics: [`SqlStore`] (SQLite through sqlx) and [`FileStore`] (a JSON
//! document rewritten atomically). Placeholder syntax and row materialization
//! are backend-internal; the engine only ever sees the trait.

mod file;
mod sql;

pub use file::FileStore;
pub use sql::SqlStore;

use std::future::Future;
use std::pin::Pin;

use crate::account::{Account, AccountStatus, Insert, NewAccount, PoolStats};
use crate::error::Result;

/// Boxed `Send` future, so `Storage` stays usable as `Arc<dyn Storage>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transactional table of account records.
///
/// Every method is atomic with respect to the record (or set of records) it
/// touches. "Now" comes from the backend's injected `Clock`.
pub trait Storage: Send + Sync {
    /// Backend label for logging ("sqlite", "file").
    fn backend(&self) -> &'static str;

    /// Insert with status Available and `register_time = now`.
    /// An existing email yields `Insert::Duplicate`.
    fn add(&self, account: NewAccount) -> BoxFuture<'_, Result<Insert>>;

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<Account>>>;

    /// The Available record with the smallest `register_time`, ties broken by
    /// insertion order.
    fn oldest_available(&self) -> BoxFuture<'_, Result<Option<Account>>>;

    /// Replace the token. True iff a record matched.
    fn update_token<'a>(&'a self, email: &'a str, token: &'a str)
    -> BoxFuture<'a, Result<bool>>;

    /// Set the status and, when `touch_allocated_time`, stamp
    /// `last_allocated_time = now`. True iff a record matched.
    fn set_status<'a>(
        &'a self,
        email: &'a str,
        status: AccountStatus,
        touch_allocated_time: bool,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Move record `id` to Allocated and stamp `last_allocated_time`, only if
    /// its status still equals `expected` at commit time.
    fn cas_allocate(&self, id: i64, expected: AccountStatus) -> BoxFuture<'_, Result<bool>>;

    fn stats(&self) -> BoxFuture<'_, Result<PoolStats>>;

    /// Every record, in id order.
    fn list_all(&self) -> BoxFuture<'_, Result<Vec<Account>>>;

    /// Mark Invalid every record whose email ends with `suffix` (case
    /// sensitive). An empty suffix matches nothing. Returns the match count.
    fn invalidate_by_suffix<'a>(&'a self, suffix: &'a str) -> BoxFuture<'a, Result<u64>>;

    /// Mark Available every non-Invalid record registered more than
    /// `threshold_days` ago. Returns the match count.
    fn reset_aged(&self, threshold_days: u32) -> BoxFuture<'_, Result<u64>>;
}
