//! Account records and the values that flow around them

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle status of an account.
///
/// Transitions:
/// - Available → Allocated (allocate_next / allocate_by_id)
/// - Allocated → Available (manual release or aging reset)
/// - any → Invalid (manual, or bulk by email suffix)
/// - Invalid → (never leaves on its own; aging skips it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Available,
    Allocated,
    Invalid,
}

impl AccountStatus {
    /// Storage and wire label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Available => "available",
            AccountStatus::Allocated => "allocated",
            AccountStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(AccountStatus::Available),
            "allocated" => Ok(AccountStatus::Allocated),
            "invalid" => Ok(AccountStatus::Invalid),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// A stored credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Natural key, unique across the pool
    pub email: String,
    pub password: Secret<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub status: AccountStatus,
    /// Set once at insert; orders FIFO selection and drives aging
    pub register_time: DateTime<Utc>,
    /// Set on every transition to Allocated, never cleared
    pub last_allocated_time: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    /// Absent until the account is first allocated
    pub token: Option<Secret<String>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for `Storage::add`.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: Secret<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub token: Option<Secret<String>>,
}

impl NewAccount {
    /// Minimal record: just the login pair.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: Secret::new(password.into()),
            first_name: None,
            last_name: None,
            metadata: None,
            token: None,
        }
    }
}

/// Outcome of `Storage::add`. A duplicate email is an expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Added { id: i64 },
    Duplicate,
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
    pub invalid: u64,
}

impl PoolStats {
    /// Add `count` records of `status`.
    pub fn record(&mut self, status: AccountStatus, count: u64) {
        self.total += count;
        match status {
            AccountStatus::Available => self.available += count,
            AccountStatus::Allocated => self.allocated += count,
            AccountStatus::Invalid => self.invalid += count,
        }
    }
}

/// An account handed out to a caller, ready to use.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: i64,
    pub email: String,
    pub password: Secret<String>,
    pub token: Option<Secret<String>>,
}

impl Allocation {
    pub(crate) fn new(account: Account, token: Option<String>) -> Self {
        Self {
            id: account.id,
            email: account.email,
            password: account.password,
            token: token.map(Secret::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_label() {
        for status in [
            AccountStatus::Available,
            AccountStatus::Allocated,
            AccountStatus::Invalid,
        ] {
            assert_eq!(status.as_str().parse::<AccountStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_label_rejected() {
        let err = "deleted".parse::<AccountStatus>().unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(ref s) if s == "deleted"));
        assert!("AVAILABLE".parse::<AccountStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&AccountStatus::Allocated).unwrap();
        assert_eq!(json, "\"allocated\"");
    }

    #[test]
    fn stats_record_counts() {
        let mut stats = PoolStats::default();
        stats.record(AccountStatus::Available, 3);
        stats.record(AccountStatus::Invalid, 1);
        assert_eq!(
            stats,
            PoolStats {
                total: 4,
                available: 3,
                allocated: 0,
                invalid: 1
            }
        );
    }

    #[test]
    fn allocation_debug_redacts_secrets() {
        let allocation = Allocation {
            id: 1,
            email: "a@example.com".into(),
            password: Secret::new("hunter2".into()),
            token: Some(Secret::new("eyJtoken".into())),
        };
        let debug = format!("{allocation:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("eyJtoken"));
    }
}
