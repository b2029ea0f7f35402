//! Account inventory and allocation engine
//!
//! Keeps a pool of reusable credential records, hands them out under a
//! compare-and-swap allocation policy, guarantees a usable session token on
//! the way out, and runs background jobs that replenish and age the pool.
//!
//! Account lifecycle:
//! 1. `AccountProducer::create()` yields a credential → `Storage::add`, status `Available`
//! 2. `AllocationEngine::allocate_next()` picks the oldest `Available` record (FIFO) → `Allocated`
//! 3. A missing token is obtained through `AccountProducer::login()`, a stale one
//!    through `TokenRefresher::refresh()`, and persisted
//! 4. Admin marks records `Available` again or `Invalid` (soft delete)
//! 5. The daily aging job resets every non-`Invalid` record older than the
//!    threshold back to `Available`

pub mod account;
pub mod clock;
pub mod engine;
pub mod error;
pub mod producer;
pub mod scheduler;
pub mod storage;

pub use account::{Account, AccountStatus, Allocation, Insert, NewAccount, PoolStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::AllocationEngine;
pub use error::{Error, Result};
pub use producer::{AccountProducer, ProducedAccount};
pub use scheduler::{NextRun, Scheduler, SchedulerConfig};
pub use storage::{BoxFuture, FileStore, SqlStore, Storage};

#[cfg(test)]
pub(crate) mod testing;
