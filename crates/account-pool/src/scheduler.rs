//! Background jobs: pool replenishment and daily aging
//!
//! Each job runs on its own tokio task. Replenishment sleeps a jittered delay,
//! asks the producer for one account and adds it, then schedules the next run.
//! Aging sleeps until the configured local wall-clock time and resets aged
//! accounts, once a day. Job failures are logged and counted, never fatal to
//! the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone, Utc};
use rand::RngExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::account::Insert;
use crate::engine::{AllocationEngine, DEFAULT_AGING_THRESHOLD_DAYS};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enable_replenish: bool,
    pub enable_aging: bool,
    /// Replenishment delay is drawn uniformly from `[jitter_min, jitter_max)`
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Local wall-clock time of the daily aging run
    pub aging_time: NaiveTime,
    pub aging_threshold_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_replenish: true,
            enable_aging: true,
            jitter_min: Duration::from_secs(60 * 60),
            jitter_max: Duration::from_secs(3 * 60 * 60),
            aging_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN),
            aging_threshold_days: DEFAULT_AGING_THRESHOLD_DAYS,
        }
    }
}

/// When the next replenishment fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NextRun {
    pub at: DateTime<Utc>,
    pub remaining: Duration,
}

pub struct Scheduler {
    engine: Arc<AllocationEngine>,
    config: SchedulerConfig,
    next_replenish: Arc<RwLock<Option<DateTime<Utc>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<AllocationEngine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            next_replenish: Arc::new(RwLock::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the enabled jobs. Calling `start` on a running scheduler is a
    /// no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("scheduler already running");
            return;
        }

        if self.config.enable_replenish {
            tasks.push(spawn_replenish_task(
                self.engine.clone(),
                self.config.jitter_min,
                self.config.jitter_max,
                self.next_replenish.clone(),
            ));
        }
        if self.config.enable_aging {
            tasks.push(spawn_aging_task(
                self.engine.clone(),
                self.config.aging_time,
                self.config.aging_threshold_days,
            ));
        }
        info!(
            replenish = self.config.enable_replenish,
            aging = self.config.enable_aging,
            "scheduler started"
        );
    }

    /// Abort every job. An in-flight manual trigger is left to finish.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.next_replenish.write().await = None;
        info!("scheduler stopped");
    }

    /// Run one replenishment now on a detached task. The pending timer is
    /// left as it is.
    pub fn trigger_now(&self) -> JoinHandle<()> {
        info!("manual replenishment triggered");
        let engine = self.engine.clone();
        tokio::spawn(async move { replenish_once(&engine).await })
    }

    /// `None` while replenishment is disabled or stopped.
    pub async fn next_replenishment(&self) -> Option<NextRun> {
        let at = (*self.next_replenish.read().await)?;
        let remaining = (at - Utc::now()).to_std().unwrap_or_default();
        Some(NextRun { at, remaining })
    }
}

/// Uniform delay in `[min, max)`; `min` when the range is empty.
pub fn jittered_delay(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(lo..hi))
}

/// The first occurrence of wall-clock `at` strictly after `now`, in `now`'s
/// time zone.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    // A DST gap can swallow the wall-clock time on one day
    for _ in 0..3 {
        if let Some(run) = tz.from_local_datetime(&date.and_time(at)).earliest()
            && run > *now
        {
            return run;
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now.clone() + TimeDelta::days(1)
}

fn spawn_replenish_task(
    engine: Arc<AllocationEngine>,
    jitter_min: Duration,
    jitter_max: Duration,
    next_run: Arc<RwLock<Option<DateTime<Utc>>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = jittered_delay(jitter_min, jitter_max);
            let at = Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
            *next_run.write().await = Some(at);
            info!(next_run = %at, delay_secs = delay.as_secs(), "next replenishment scheduled");

            tokio::time::sleep(delay).await;
            replenish_once(&engine).await;
        }
    })
}

fn spawn_aging_task(
    engine: Arc<AllocationEngine>,
    at: NaiveTime,
    threshold_days: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let run = next_daily_run(&now, at);
            let wait = (run.clone() - now).to_std().unwrap_or_default();
            info!(next_run = %run, "next aging reset scheduled");

            tokio::time::sleep(wait).await;
            if let Err(e) = engine.reset_aged(threshold_days).await {
                warn!(error = %e, "aging reset failed");
            }
        }
    })
}

/// Produce one account and add it to the pool.
async fn replenish_once(engine: &AllocationEngine) {
    let outcome = match engine.producer().create().await {
        Ok(produced) => {
            debug!(email = %produced.email, "producer returned account");
            match engine.add_account(produced.into()).await {
                Ok(Insert::Added { .. }) => "added",
                Ok(Insert::Duplicate) => "duplicate",
                Err(e) => {
                    warn!(error = %e, "failed to store produced account");
                    "failed"
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "account production failed");
            "failed"
        }
    };
    metrics::counter!("pool_replenish_runs_total", "outcome" => outcome).increment(1);
}
