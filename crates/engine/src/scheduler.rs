//! Per-user poll scheduling.
//!
//! One ticker drives every watch. Each tick sweeps the registry for watches
//! that are due, reschedules them, and spawns one poll task per due watch.
//! A global semaphore caps how many polls run at once; permits are taken
//! inside the task so a tick never waits.

use crate::{Notifier, PollJob, PollOutcome, PollReport, Poller, WatchEntry, WatchRegistry, WatchStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use slotwatch_core::{PollingInterval, StoredWatch, UserId, WatchConfig};
use slotwatch_feeds::{CacheStatsSummary, RetryPolicy, SnapshotCache};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Upper bound on polls running at the same time.
    pub max_concurrent_polls: usize,
    /// How long shutdown waits for running polls before aborting them.
    pub shutdown_grace_secs: u64,
    /// Restored watches are spread over at most this window.
    pub startup_spread_secs: u64,
    pub retry_initial_delay_ms: u64,
    /// Retries that would wait longer than this are not attempted.
    pub max_retry_delay_ms: u64,
    /// Expired cache entries are dropped every this many ticks.
    pub prune_every_ticks: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn startup_spread(&self) -> Duration {
        Duration::from_secs(self.startup_spread_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_concurrent_polls: 32,
            shutdown_grace_secs: 10,
            startup_spread_secs: 60,
            retry_initial_delay_ms: 1_000,
            max_retry_delay_ms: 10_000,
            prune_every_ticks: 60,
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub ticks: AtomicU64,
    pub dispatched: AtomicU64,
    /// Due watches skipped because their previous poll was still running.
    pub skipped_in_flight: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub delivery_failures: AtomicU64,
}

impl SchedulerStats {
    pub fn record_tick(&self, dispatched: usize, skipped: usize) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.dispatched.fetch_add(dispatched as u64, Ordering::Relaxed);
        self.skipped_in_flight
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn record_success(&self, report: PollReport) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.notifications_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add((report.events - report.delivered) as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SchedulerStatsSummary {
        SchedulerStatsSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStatsSummary {
    pub ticks: u64,
    pub dispatched: u64,
    pub skipped_in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub notifications_sent: u64,
    pub delivery_failures: u64,
}

/// Drives polling for every registered watch.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<WatchRegistry>,
    poller: Arc<Poller>,
    permits: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        cache: SnapshotCache,
        store: Arc<dyn WatchStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let stats = Arc::new(SchedulerStats::default());
        let retry = RetryPolicy::new(config.retry_initial_delay_ms, config.max_retry_delay_ms, 1);
        let poller = Poller::new(
            cache,
            store,
            notifier,
            retry,
            Duration::from_millis(config.max_retry_delay_ms),
            Arc::clone(&stats),
        );

        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_polls.max(1))),
            config,
            registry: Arc::new(WatchRegistry::new()),
            poller: Arc::new(poller),
            stats,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> SchedulerStatsSummary {
        self.stats.summary()
    }

    pub fn cache_stats(&self) -> CacheStatsSummary {
        self.poller.cache().stats()
    }

    /// Add a watch. The first poll is one interval from now, never sooner.
    ///
    /// Registering an existing user replaces its configuration and keeps its
    /// state and schedule.
    pub fn register(&self, config: WatchConfig) -> Arc<WatchEntry> {
        let now = Instant::now();
        if let Some(entry) = self.registry.get(config.user) {
            entry.apply_config(config, now);
            return entry;
        }
        let next_due = now + config.interval.as_duration();
        debug!(user = %config.user, interval = %config.interval, "Watch registered");
        self.registry.insert(config, Default::default(), next_due)
    }

    /// Add a watch loaded from storage at startup.
    ///
    /// The first poll is jittered over `[0, min(interval, startup_spread))`
    /// so a restart does not poll everybody in the same tick.
    pub fn restore(&self, stored: StoredWatch) -> Arc<WatchEntry> {
        let spread = stored
            .config
            .interval
            .as_duration()
            .min(self.config.startup_spread());
        let jitter = if spread.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..spread.as_millis() as u64))
        };
        self.registry
            .insert(stored.config, stored.states, Instant::now() + jitter)
    }

    pub fn unregister(&self, user: UserId) -> bool {
        let removed = self.registry.remove(user).is_some();
        if removed {
            debug!(user = %user, "Watch unregistered");
        }
        removed
    }

    /// Change a watch's polling interval. Takes effect from the next tick.
    pub fn update_cadence(&self, user: UserId, interval: PollingInterval) -> bool {
        let Some(entry) = self.registry.get(user) else {
            return false;
        };
        let mut config = entry.config();
        config.interval = interval;
        entry.apply_config(config, Instant::now());
        true
    }

    /// Sweep once and spawn a task for every due watch. Returns how many
    /// were dispatched.
    pub fn tick(&self, tasks: &mut JoinSet<PollOutcome>) -> usize {
        let sweep = self.registry.sweep(Instant::now());
        self.stats.record_tick(sweep.jobs.len(), sweep.skipped.len());

        for user in &sweep.skipped {
            warn!(user = %user, "Previous poll still running, skipping this cycle");
        }

        let dispatched = sweep.jobs.len();
        for job in sweep.jobs {
            self.spawn(tasks, job);
        }
        dispatched
    }

    fn spawn(&self, tasks: &mut JoinSet<PollOutcome>, job: PollJob) {
        let poller = Arc::clone(&self.poller);
        let permits = Arc::clone(&self.permits);
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return PollOutcome::Failed;
            };
            poller.execute(job).await
        });
    }

    /// Run until `shutdown` flips to true or its sender is dropped, then
    /// wait for running polls up to the grace period and abort the rest.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        let mut ticks: u64 = 0;

        info!(
            watches = self.registry.len(),
            tick_ms = self.config.tick_interval_ms,
            max_concurrent = self.config.max_concurrent_polls,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut tasks);
                    ticks += 1;
                    if self.config.prune_every_ticks > 0 && ticks % self.config.prune_every_ticks == 0 {
                        let pruned = self.poller.cache().prune();
                        if pruned > 0 {
                            debug!(pruned, "Pruned expired snapshots");
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Poll task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await;
    }

    async fn drain(&self, mut tasks: JoinSet<PollOutcome>) {
        if tasks.is_empty() {
            info!("Scheduler stopped");
            return;
        }

        info!(in_flight = tasks.len(), "Scheduler stopping, waiting for running polls");
        let grace = self.config.shutdown_grace();
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(aborted = tasks.len(), "Grace period elapsed, aborting remaining polls");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Scheduler stopped");
    }
}
