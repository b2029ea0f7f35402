//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `DATABASE_URL` replaces the SQLite URL and `ENABLE_REPLENISH` toggles the
//! replenishment job, so deployments can flip both without editing the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_pool::SchedulerConfig;
use chrono::NaiveTime;
use serde::Deserialize;
use token_exchange::{ExchangeConfig, MAX_VERIFIER_LENGTH, MIN_VERIFIER_LENGTH};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    File,
}

/// Where accounts are persisted
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub backend: Backend,
    /// SQLite connection URL, `sqlite` backend only
    #[serde(default)]
    pub url: Option<String>,
    /// JSON document path, `file` backend only
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Remote token exchange endpoints
#[derive(Debug, Deserialize)]
pub struct ExchangeSection {
    pub associate_url: String,
    pub poll_url: String,
    /// Cookie name for the `<sub>%3A%3A<token>` session cookie
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_verifier_length")]
    pub verifier_length: usize,
}

/// Background job settings
#[derive(Debug, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub enable_replenish: bool,
    #[serde(default = "default_true")]
    pub enable_aging: bool,
    /// Local time of the daily aging run, `HH:MM`
    #[serde(default = "default_aging_time")]
    pub aging_time: String,
    #[serde(default = "default_aging_threshold_days")]
    pub aging_threshold_days: u32,
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enable_replenish: false,
            enable_aging: true,
            aging_time: default_aging_time(),
            aging_threshold_days: default_aging_threshold_days(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
        }
    }
}

/// External commands backing the account producer
#[derive(Debug, Default, Deserialize)]
pub struct ProducerConfig {
    /// argv of the registration command; prints one JSON account on stdout
    #[serde(default)]
    pub create_command: Vec<String>,
    /// argv of the login command; prints the token on stdout
    #[serde(default)]
    pub login_command: Option<Vec<String>>,
}

/// Admin HTTP API settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_polls() -> u32 {
    token_exchange::DEFAULT_MAX_POLLS
}

fn default_poll_interval_ms() -> u64 {
    token_exchange::DEFAULT_POLL_INTERVAL_MS
}

fn default_verifier_length() -> usize {
    token_exchange::DEFAULT_VERIFIER_LENGTH
}

fn default_aging_time() -> String {
    "02:00".into()
}

fn default_aging_threshold_days() -> u32 {
    account_pool::engine::DEFAULT_AGING_THRESHOLD_DAYS
}

fn default_jitter_min_secs() -> u64 {
    3600
}

fn default_jitter_max_secs() -> u64 {
    3 * 3600
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5007))
}

fn default_max_connections() -> usize {
    100
}

fn parse_aging_time(s: &str) -> common::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| common::Error::Config(format!("aging_time must be HH:MM, got: {s}")))
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.storage.url = Some(url);
        }
        if let Ok(value) = std::env::var("ENABLE_REPLENISH") {
            config.scheduler.enable_replenish = match value.trim().to_ascii_lowercase().as_str()
            {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(common::Error::Env {
                        name: "ENABLE_REPLENISH",
                        value,
                    });
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        match self.storage.backend {
            Backend::Sqlite if self.storage.url.is_none() => {
                return Err(common::Error::Config(
                    "storage.url (or DATABASE_URL) is required for the sqlite backend".into(),
                ));
            }
            Backend::File if self.storage.path.is_none() => {
                return Err(common::Error::Config(
                    "storage.path is required for the file backend".into(),
                ));
            }
            _ => {}
        }

        for (name, url) in [
            ("associate_url", &self.exchange.associate_url),
            ("poll_url", &self.exchange.poll_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&self.exchange.verifier_length) {
            return Err(common::Error::Config(format!(
                "verifier_length must be within {MIN_VERIFIER_LENGTH}..={MAX_VERIFIER_LENGTH}, got: {}",
                self.exchange.verifier_length
            )));
        }

        let scheduler = &self.scheduler;
        if scheduler.jitter_min_secs >= scheduler.jitter_max_secs {
            return Err(common::Error::Config(format!(
                "jitter_min_secs ({}) must be less than jitter_max_secs ({})",
                scheduler.jitter_min_secs, scheduler.jitter_max_secs
            )));
        }
        if scheduler.aging_threshold_days == 0 {
            return Err(common::Error::Config(
                "aging_threshold_days must be greater than 0".into(),
            ));
        }
        parse_aging_time(&scheduler.aging_time)?;

        if scheduler.enable_replenish && self.producer.create_command.is_empty() {
            return Err(common::Error::Config(
                "producer.create_command is required when replenishment is enabled".into(),
            ));
        }

        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        let section = &self.exchange;
        let mut config = ExchangeConfig::new(&section.associate_url, &section.poll_url);
        config.session_cookie = section.session_cookie.clone();
        config.max_polls = section.max_polls;
        config.poll_interval = Duration::from_millis(section.poll_interval_ms);
        config.verifier_length = section.verifier_length;
        config
    }

    pub fn scheduler_config(&self) -> common::Result<SchedulerConfig> {
        let section = &self.scheduler;
        Ok(SchedulerConfig {
            enable_replenish: section.enable_replenish,
            enable_aging: section.enable_aging,
            jitter_min: Duration::from_secs(section.jitter_min_secs),
            jitter_max: Duration::from_secs(section.jitter_max_secs),
            aging_time: parse_aging_time(&section.aging_time)?,
            aging_threshold_days: section.aging_threshold_days,
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("account-pool.toml")
    }
}
