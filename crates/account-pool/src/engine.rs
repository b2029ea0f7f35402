//! Allocation engine
//!
//! The single write path into the pool. Selection is FIFO by
//! `register_time`; the Available → Allocated transition is a storage-level
//! compare-and-swap, so concurrent callers never receive the same record.
//! A lost CAS sends the caller back to selection; "pool empty" is only
//! reported once selection itself finds nothing.
//!
//! Before an allocation is returned the engine makes sure it carries a usable
//! token: a missing token is obtained through the producer's login, and on
//! administrative allocation an existing token is run through the
//! `TokenRefresher`. A token failure after the transition leaves the record
//! Allocated and surfaces the error to the caller.

use std::sync::Arc;

use token_exchange::TokenRefresher;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStatus, Allocation, Insert, NewAccount, PoolStats};
use crate::error::Result;
use crate::producer::AccountProducer;
use crate::storage::Storage;

/// Default age after which non-Invalid records return to Available.
pub const DEFAULT_AGING_THRESHOLD_DAYS: u32 = 30;

fn record_allocation(outcome: &'static str) {
    metrics::counter!("pool_allocations_total", "outcome" => outcome).increment(1);
}

fn record_refresh(outcome: &'static str) {
    metrics::counter!("pool_token_refresh_total", "outcome" => outcome).increment(1);
}

pub struct AllocationEngine {
    storage: Arc<dyn Storage>,
    refresher: TokenRefresher,
    producer: Arc<dyn AccountProducer>,
}

impl AllocationEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        refresher: TokenRefresher,
        producer: Arc<dyn AccountProducer>,
    ) -> Self {
        info!(backend = storage.backend(), "allocation engine initialized");
        Self {
            storage,
            refresher,
            producer,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn producer(&self) -> &Arc<dyn AccountProducer> {
        &self.producer
    }

    /// Allocate the oldest Available account.
    ///
    /// Returns `Ok(None)` when no Available record remains. A record lost to
    /// a concurrent caller is skipped and selection runs again.
    pub async fn allocate_next(&self) -> Result<Option<Allocation>> {
        loop {
            let Some(candidate) = self.storage.oldest_available().await? else {
                debug!("no available account");
                record_allocation("empty");
                return Ok(None);
            };

            if !self
                .storage
                .cas_allocate(candidate.id, AccountStatus::Available)
                .await?
            {
                debug!(account_id = candidate.id, "lost allocation race, reselecting");
                record_allocation("contended");
                continue;
            }

            info!(account_id = candidate.id, email = %candidate.email, "allocated account");
            let token = match &candidate.token {
                Some(token) => Some(token.expose().clone()),
                None => self.login(&candidate).await?,
            };
            record_allocation("allocated");
            return Ok(Some(Allocation::new(candidate, token)));
        }
    }

    /// Allocate a specific account regardless of its current status.
    ///
    /// This is an administrative override: Invalid and already-Allocated
    /// records are forced to Allocated too. Returns `Ok(None)` for an unknown
    /// id. An existing token goes through the refresher; a renewed one is
    /// persisted.
    pub async fn allocate_by_id(&self, id: i64) -> Result<Option<Allocation>> {
        let Some(account) = self.storage.get_by_id(id).await? else {
            debug!(account_id = id, "allocate_by_id: unknown account");
            return Ok(None);
        };

        if account.status != AccountStatus::Available {
            warn!(
                account_id = id,
                status = %account.status,
                "forcing allocation of non-available account"
            );
        }
        self.storage
            .set_status(&account.email, AccountStatus::Allocated, true)
            .await?;
        info!(account_id = id, email = %account.email, "allocated account by id");

        let token = match &account.token {
            None => self.login(&account).await?,
            Some(current) => Some(self.refresh(&account, current.expose()).await?),
        };
        record_allocation("allocated");
        Ok(Some(Allocation::new(account, token)))
    }

    /// Set an account's status. `touch_allocated_time` only takes effect when
    /// moving to Allocated. Returns false for an unknown email.
    pub async fn mark_status(
        &self,
        email: &str,
        status: AccountStatus,
        touch_allocated_time: bool,
    ) -> Result<bool> {
        let touch = touch_allocated_time && status == AccountStatus::Allocated;
        if touch_allocated_time && !touch {
            debug!(email, %status, "ignoring allocation timestamp for non-allocated status");
        }
        let updated = self.storage.set_status(email, status, touch).await?;
        if updated {
            info!(email, %status, "account status updated");
        } else {
            debug!(email, "mark_status: unknown account");
        }
        Ok(updated)
    }

    /// Invalidate every account whose email ends with `suffix`.
    pub async fn batch_invalidate(&self, suffix: &str) -> Result<u64> {
        let updated = self.storage.invalidate_by_suffix(suffix).await?;
        info!(suffix, updated, "batch invalidated accounts");
        Ok(updated)
    }

    /// Return every non-Invalid account older than `threshold_days` to the
    /// Available state.
    pub async fn reset_aged(&self, threshold_days: u32) -> Result<u64> {
        let reset = self.storage.reset_aged(threshold_days).await?;
        metrics::counter!("pool_aging_reset_accounts_total").increment(reset);
        info!(threshold_days, reset, "aged accounts reset to available");
        Ok(reset)
    }

    pub async fn add_account(&self, account: NewAccount) -> Result<Insert> {
        let email = account.email.clone();
        let inserted = self.storage.add(account).await?;
        match inserted {
            Insert::Added { id } => info!(account_id = id, email = %email, "account added"),
            Insert::Duplicate => warn!(email = %email, "account already exists, skipped"),
        }
        Ok(inserted)
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.storage.stats().await
    }

    pub async fn list_all(&self) -> Result<Vec<Account>> {
        self.storage.list_all().await
    }

    /// Obtain a first token through the producer and persist it.
    async fn login(&self, account: &Account) -> Result<Option<String>> {
        let token = self
            .producer
            .login(&account.email, account.password.expose())
            .await
            .inspect_err(|e| warn!(account_id = account.id, error = %e, "login failed"))?;
        match &token {
            Some(token) => {
                self.storage.update_token(&account.email, token).await?;
                info!(account_id = account.id, "stored token from login");
            }
            None => warn!(account_id = account.id, "login returned no token"),
        }
        Ok(token)
    }

    /// Run `current` through the refresher, persisting a renewed token.
    async fn refresh(&self, account: &Account, current: &str) -> Result<String> {
        let renewed = match self.refresher.refresh(current).await {
            Ok(token) => token,
            Err(e) => {
                record_refresh("failed");
                warn!(account_id = account.id, error = %e, "token refresh failed");
                return Err(e.into());
            }
        };
        if renewed == current {
            record_refresh("unchanged");
        } else {
            self.storage.update_token(&account.email, &renewed).await?;
            record_refresh("renewed");
            info!(account_id = account.id, "stored refreshed token");
        }
        Ok(renewed)
    }
}
