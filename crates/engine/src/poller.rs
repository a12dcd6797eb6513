//! One poll of one watch: fetch, evaluate, persist, commit, notify.

use crate::{evaluate, Notifier, PollJob, SchedulerStats, StoreError, WatchStore};
use slotwatch_core::CoefficientSnapshot;
use slotwatch_feeds::{RetryPolicy, SnapshotCache, SourceError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a completed poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Warehouses with a usable reading.
    pub readings: usize,
    pub events: usize,
    pub delivered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(PollReport),
    /// Credential rejected; the watch is paused until it changes.
    CredentialRejected,
    /// Nothing committed this cycle.
    Failed,
    /// The watch was removed while the poll ran.
    Discarded,
}

/// Runs poll jobs against the shared snapshot cache.
pub struct Poller {
    cache: SnapshotCache,
    store: Arc<dyn WatchStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    max_retry_delay: Duration,
    stats: Arc<SchedulerStats>,
}

impl Poller {
    pub fn new(
        cache: SnapshotCache,
        store: Arc<dyn WatchStore>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        max_retry_delay: Duration,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            cache,
            store,
            notifier,
            retry,
            max_retry_delay,
            stats,
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Run `job` and account for the result. Never fails; every error is
    /// logged and counted against the watch.
    pub async fn execute(&self, job: PollJob) -> PollOutcome {
        let user = job.user();
        let entry = Arc::clone(job.entry());

        match self.poll(&job).await {
            Ok(Some(report)) => {
                entry.reset_failures();
                self.stats.record_success(report);
                debug!(
                    user = %user,
                    readings = report.readings,
                    events = report.events,
                    "Poll completed"
                );
                PollOutcome::Completed(report)
            }
            Ok(None) => {
                debug!(user = %user, "Watch removed during poll, result discarded");
                PollOutcome::Discarded
            }
            Err(PollError::Source(SourceError::Auth(reason))) => {
                let failures = entry.record_failure();
                self.stats.record_failure();
                let key = job.credential.key();
                self.cache.invalidate(&key);
                if entry.pause_if_credential(&key) {
                    warn!(user = %user, credential = %key, failures, reason = %reason, "Credential rejected, pausing watch");
                    if let Err(e) = self.notifier.credential_rejected(user).await {
                        warn!(user = %user, error = %e, "Failed to report rejected credential");
                    }
                }
                PollOutcome::CredentialRejected
            }
            Err(PollError::Source(SourceError::MalformedResponse(reason))) => {
                let failures = entry.record_failure();
                self.stats.record_failure();
                error!(user = %user, failures, reason = %reason, "Malformed coefficient payload, skipping cycle");
                PollOutcome::Failed
            }
            Err(e) => {
                let failures = entry.record_failure();
                self.stats.record_failure();
                warn!(user = %user, failures, error = %e, "Poll failed, skipping cycle");
                PollOutcome::Failed
            }
        }
    }

    /// Returns `None` when the watch was removed before anything was written.
    async fn poll(&self, job: &PollJob) -> Result<Option<PollReport>, PollError> {
        let entry = job.entry();
        let snapshot = self.fetch(job).await?;

        let previous = entry.states();
        let evaluation = evaluate(
            job.user(),
            job.threshold,
            &previous,
            &snapshot,
            &job.warehouses,
        );

        if entry.is_retired() {
            return Ok(None);
        }
        if !evaluation.states.is_empty() {
            self.store.save_states(job.user(), &evaluation.states).await?;
        }
        entry.commit(&evaluation.states);

        let mut report = PollReport {
            readings: evaluation.states.len(),
            events: evaluation.events.len(),
            delivered: 0,
        };

        for event in &evaluation.events {
            info!(
                user = %event.user,
                warehouse = %event.warehouse,
                old = ?event.old_value,
                new = event.new_value,
                threshold = %event.threshold,
                "Coefficient crossed threshold"
            );
            match self.notifier.notify(event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(user = %event.user, warehouse = %event.warehouse, error = %e, "Notification delivery failed");
                }
            }
        }

        Ok(Some(report))
    }

    /// Fetch through the cache, retrying transient failures per the policy.
    async fn fetch(&self, job: &PollJob) -> Result<Arc<CoefficientSnapshot>, SourceError> {
        let mut attempt = 0;
        loop {
            match self.cache.get(&job.credential, &job.scope).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if !self.retry.should_retry(attempt) {
                        return Err(e);
                    }
                    let backoff = self.retry.calculate_delay_duration(attempt);
                    let delay = e.suggested_retry_delay().map_or(backoff, |hint| hint.max(backoff));
                    if delay > self.max_retry_delay {
                        return Err(e);
                    }
                    debug!(user = %job.user(), attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying fetch");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
