//! JSON file backend
//!
//! The whole table lives in memory behind a tokio Mutex and is rewritten to
//! disk on every change using an atomic temp-file + rename. A mutation is
//! applied to a copy first and only becomes visible once the write succeeds,
//! so a failed write leaves both disk and memory on the previous state.
//!
//! Suited to small pools and single-process deployments; the Mutex is what
//! makes `cas_allocate` atomic here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BoxFuture, Storage};
use crate::account::{Account, AccountStatus, Insert, NewAccount, PoolStats};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// On-disk layout. `accounts` is kept in id order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    /// Highest id ever assigned; ids are never reused
    last_id: i64,
    accounts: Vec<Account>,
}

impl Document {
    fn find_mut(&mut self, email: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.email == email)
    }
}

/// File-backed account table.
pub struct FileStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<Document>,
}

impl FileStore {
    /// Load the table from `path`, creating an empty file on cold start.
    pub async fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading account file: {e}")))?;
            let document: Document = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing account file: {e}")))?;
            info!(path = %path.display(), accounts = document.accounts.len(), "loaded accounts");
            document
        } else {
            info!(path = %path.display(), "account file not found, starting with empty store");
            let document = Document::default();
            write_atomic(&path, &document).await?;
            document
        };

        Ok(Self {
            path,
            clock,
            state: Mutex::new(state),
        })
    }

    /// Apply `f` to a copy of the table and persist it if `f` reports a
    /// change. The copy replaces the in-memory state only after the write.
    async fn update<T>(&self, f: impl FnOnce(&mut Document) -> (T, bool)) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let (out, changed) = f(&mut next);
        if changed {
            write_atomic(&self.path, &next).await?;
            *state = next;
        }
        Ok(out)
    }
}

impl Storage for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn add(&self, account: NewAccount) -> BoxFuture<'_, Result<Insert>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update(|doc| {
                if doc.accounts.iter().any(|a| a.email == account.email) {
                    return (Insert::Duplicate, false);
                }
                doc.last_id += 1;
                let id = doc.last_id;
                doc.accounts.push(Account {
                    id,
                    email: account.email,
                    password: account.password,
                    first_name: account.first_name,
                    last_name: account.last_name,
                    status: AccountStatus::Available,
                    register_time: now,
                    last_allocated_time: None,
                    metadata: account.metadata,
                    token: account.token,
                    created_at: now,
                });
                debug!(account_id = id, "added account");
                (Insert::Added { id }, true)
            })
            .await
        })
    }

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.accounts.iter().find(|a| a.id == id).cloned())
        })
    }

    fn oldest_available(&self) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .accounts
                .iter()
                .filter(|a| a.status == AccountStatus::Available)
                .min_by_key(|a| (a.register_time, a.id))
                .cloned())
        })
    }

    fn update_token<'a>(
        &'a self,
        email: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.update(|doc| match doc.find_mut(email) {
                Some(account) => {
                    account.token = Some(token.to_string().into());
                    (true, true)
                }
                None => (false, false),
            })
            .await
        })
    }

    fn set_status<'a>(
        &'a self,
        email: &'a str,
        status: AccountStatus,
        touch_allocated_time: bool,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update(|doc| match doc.find_mut(email) {
                Some(account) => {
                    account.status = status;
                    if touch_allocated_time {
                        account.last_allocated_time = Some(now);
                    }
                    (true, true)
                }
                None => (false, false),
            })
            .await
        })
    }

    fn cas_allocate(&self, id: i64, expected: AccountStatus) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update(|doc| {
                match doc
                    .accounts
                    .iter_mut()
                    .find(|a| a.id == id && a.status == expected)
                {
                    Some(account) => {
                        account.status = AccountStatus::Allocated;
                        account.last_allocated_time = Some(now);
                        (true, true)
                    }
                    None => (false, false),
                }
            })
            .await
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<PoolStats>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut stats = PoolStats::default();
            for account in &state.accounts {
                stats.record(account.status, 1);
            }
            Ok(stats)
        })
    }

    fn list_all(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.accounts.clone())
        })
    }

    fn invalidate_by_suffix<'a>(&'a self, suffix: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            if suffix.is_empty() {
                return Ok(0);
            }
            self.update(|doc| {
                let mut matched = 0u64;
                for account in doc.accounts.iter_mut() {
                    if account.email.ends_with(suffix) {
                        account.status = AccountStatus::Invalid;
                        matched += 1;
                    }
                }
                (matched, matched > 0)
            })
            .await
        })
    }

    fn reset_aged(&self, threshold_days: u32) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let cutoff = self.clock.now() - TimeDelta::days(i64::from(threshold_days));
            self.update(|doc| {
                let mut matched = 0u64;
                for account in doc.accounts.iter_mut() {
                    if account.status != AccountStatus::Invalid && account.register_time < cutoff
                    {
                        account.status = AccountStatus::Available;
                        matched += 1;
                    }
                }
                (matched, matched > 0)
            })
            .await
        })
    }
}

/// Write the table to `path` atomically, owner read/write only.
async fn write_atomic(path: &Path, document: &Document) -> Result<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| Error::Storage(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("account file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
