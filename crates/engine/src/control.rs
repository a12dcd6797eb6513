//! Configuration boundary.
//!
//! Every change to a watch goes through [`WatchControl`]: input is validated,
//! persisted, and only then applied to the running registry. Changes take
//! effect from the next scheduler tick.

use crate::{Scheduler, StoreError, WatchStore, WatchView};
use slotwatch_core::{
    ConfigError, Credential, CredentialRecord, PollingInterval, Threshold, UserId, Warehouse,
    WarehouseId, WatchConfig,
};
use slotwatch_feeds::{CoefficientSource, SourceError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("User {0} is not registered")]
    UnknownUser(UserId),

    #[error("Credential rejected: {0}")]
    CredentialRejected(String),

    #[error("No credential set for user {0}")]
    MissingCredential(UserId),

    #[error("Source unavailable: {0}")]
    Source(SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SourceError> for WatchError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Auth(reason) => WatchError::CredentialRejected(reason),
            other => WatchError::Source(other),
        }
    }
}

/// Validated, persisted configuration changes.
pub struct WatchControl {
    scheduler: Arc<Scheduler>,
    store: Arc<dyn WatchStore>,
    source: Arc<dyn CoefficientSource>,
}

impl WatchControl {
    pub fn new(
        scheduler: Arc<Scheduler>,
        store: Arc<dyn WatchStore>,
        source: Arc<dyn CoefficientSource>,
    ) -> Self {
        Self {
            scheduler,
            store,
            source,
        }
    }

    /// Register `user` with default settings. Registering twice is a no-op
    /// that returns the current configuration.
    pub async fn register(&self, user: UserId) -> Result<WatchConfig, WatchError> {
        if let Some(entry) = self.scheduler.registry().get(user) {
            return Ok(entry.config());
        }
        let config = WatchConfig::new(user);
        self.store.save_watch(&config).await?;
        self.scheduler.register(config.clone());
        info!(user = %user, "User registered");
        Ok(config)
    }

    /// Validate `raw` against the source and store it as the user's
    /// credential. A paused watch resumes.
    pub async fn set_credential(&self, user: UserId, raw: &str) -> Result<(), WatchError> {
        let credential = Credential::new(raw.trim());
        if credential.is_empty() {
            return Err(ConfigError::EmptyCredential.into());
        }
        let mut config = self.current(user)?;

        self.source.validate(&credential).await?;

        let key = credential.key();
        config.credential = Some(CredentialRecord::new(credential));
        self.apply(config).await?;
        info!(user = %user, credential = %key, "Credential updated");
        Ok(())
    }

    /// Replace the watched warehouse set. State for dropped warehouses is
    /// discarded.
    pub async fn set_warehouses(
        &self,
        user: UserId,
        warehouses: impl IntoIterator<Item = WarehouseId>,
    ) -> Result<BTreeSet<WarehouseId>, WatchError> {
        let mut config = self.current(user)?;
        config.warehouses = warehouses.into_iter().collect();
        let selected = config.warehouses.clone();
        self.apply(config).await?;
        debug!(user = %user, count = selected.len(), "Warehouses updated");
        Ok(selected)
    }

    /// Set the polling interval in minutes, within [1, 1440].
    pub async fn set_polling_frequency(
        &self,
        user: UserId,
        minutes: i64,
    ) -> Result<PollingInterval, WatchError> {
        let interval = PollingInterval::from_minutes(minutes)?;
        let mut config = self.current(user)?;
        config.interval = interval;
        self.store.save_watch(&config).await?;
        self.scheduler.update_cadence(user, interval);
        debug!(user = %user, interval = %interval, "Polling frequency updated");
        Ok(interval)
    }

    /// Set the alert threshold, within [0, 20].
    pub async fn set_threshold(&self, user: UserId, value: f64) -> Result<Threshold, WatchError> {
        let threshold = Threshold::new(value)?;
        let mut config = self.current(user)?;
        config.threshold = threshold;
        self.apply(config).await?;
        debug!(user = %user, threshold = %threshold, "Threshold updated");
        Ok(threshold)
    }

    /// Remove the user and everything stored for them.
    pub async fn unregister(&self, user: UserId) -> Result<(), WatchError> {
        if !self.scheduler.registry().contains(user) {
            return Err(WatchError::UnknownUser(user));
        }
        self.store.delete_watch(user).await?;
        self.scheduler.unregister(user);
        info!(user = %user, "User unregistered");
        Ok(())
    }

    pub fn describe(&self, user: UserId) -> Option<WatchView> {
        self.scheduler.registry().get(user).map(|entry| entry.view())
    }

    /// Fetch the warehouse catalog with the user's credential and store it.
    ///
    /// Falls back to the stored catalog when the source is unreachable.
    pub async fn refresh_warehouses(&self, user: UserId) -> Result<Vec<Warehouse>, WatchError> {
        let config = self.current(user)?;
        let record = config
            .credential
            .ok_or(WatchError::MissingCredential(user))?;

        match self.source.warehouses(&record.credential).await {
            Ok(catalog) => {
                self.store.save_warehouses(&catalog).await?;
                Ok(catalog)
            }
            Err(e) if e.is_transient() => {
                warn!(user = %user, error = %e, "Catalog fetch failed, using stored catalog");
                Ok(self.store.list_warehouses().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The last stored warehouse catalog.
    pub async fn warehouses(&self) -> Result<Vec<Warehouse>, WatchError> {
        Ok(self.store.list_warehouses().await?)
    }

    fn current(&self, user: UserId) -> Result<WatchConfig, WatchError> {
        self.scheduler
            .registry()
            .get(user)
            .map(|entry| entry.config())
            .ok_or(WatchError::UnknownUser(user))
    }

    async fn apply(&self, config: WatchConfig) -> Result<(), WatchError> {
        self.store.save_watch(&config).await?;
        match self.scheduler.registry().get(config.user) {
            Some(entry) => entry.apply_config(config, Instant::now()),
            None => return Err(WatchError::UnknownUser(config.user)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNotifier, ScriptedSource};
    use crate::{MemoryStore, PollOutcome, SchedulerConfig};
    use pretty_assertions::assert_eq;
    use slotwatch_feeds::{CacheConfig, CredentialRateLimiter, RateLimitConfig, SnapshotCache};
    use std::time::Duration;
    use tokio::task::JoinSet;

    struct Fixture {
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        scheduler: Arc<Scheduler>,
        control: WatchControl,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ScriptedSource::new().series(1, &[7.0]).series(2, &[1.0]));
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(CredentialRateLimiter::new(RateLimitConfig::new(100, 60_000, 0)));
        let cache = SnapshotCache::new(source.clone(), limiter, CacheConfig::default());
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            cache,
            store.clone(),
            Arc::new(RecordingNotifier::new()),
        ));
        let control = WatchControl::new(scheduler.clone(), store.clone(), source.clone());
        Fixture {
            source,
            store,
            scheduler,
            control,
        }
    }

    async fn ready(f: &Fixture, user: i64) {
        f.control.register(UserId(user)).await.unwrap();
        f.control.set_credential(UserId(user), "key").await.unwrap();
        f.control
            .set_warehouses(UserId(user), [WarehouseId(1)])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_settings_are_rejected() {
        let f = fixture();
        f.control.register(UserId(1)).await.unwrap();

        for minutes in [0, 1500, -5] {
            let err = f.control.set_polling_frequency(UserId(1), minutes).await.unwrap_err();
            assert!(matches!(err, WatchError::InvalidConfig(_)), "{minutes}: {err}");
        }
        for value in [-1.0, 25.0, f64::NAN] {
            let err = f.control.set_threshold(UserId(1), value).await.unwrap_err();
            assert!(matches!(err, WatchError::InvalidConfig(_)), "{value}: {err}");
        }

        let view = f.control.describe(UserId(1)).unwrap();
        assert_eq!(view.config, WatchConfig::new(UserId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_are_inclusive() {
        let f = fixture();
        f.control.register(UserId(1)).await.unwrap();

        assert_eq!(f.control.set_polling_frequency(UserId(1), 1).await.unwrap().minutes(), 1);
        assert_eq!(f.control.set_polling_frequency(UserId(1), 1440).await.unwrap().minutes(), 1440);
        assert_eq!(f.control.set_threshold(UserId(1), 0.0).await.unwrap().value(), 0.0);
        assert_eq!(f.control.set_threshold(UserId(1), 20.0).await.unwrap().value(), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user_is_reported() {
        let f = fixture();
        let err = f.control.set_threshold(UserId(9), 3.0).await.unwrap_err();
        assert!(matches!(err, WatchError::UnknownUser(UserId(9))));
        assert!(matches!(
            f.control.unregister(UserId(9)).await,
            Err(WatchError::UnknownUser(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_is_not_stored() {
        let f = fixture();
        f.control.register(UserId(1)).await.unwrap();
        f.source.reject("bad");

        let err = f.control.set_credential(UserId(1), "bad").await.unwrap_err();
        assert!(matches!(err, WatchError::CredentialRejected(_)));
        assert!(f.control.describe(UserId(1)).unwrap().config.credential.is_none());

        let err = f.control.set_credential(UserId(1), "   ").await.unwrap_err();
        assert!(matches!(err, WatchError::InvalidConfig(ConfigError::EmptyCredential)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_are_persisted() {
        let f = fixture();
        ready(&f, 1).await;
        f.control.set_threshold(UserId(1), 2.5).await.unwrap();
        f.control.set_polling_frequency(UserId(1), 15).await.unwrap();

        let stored = f.store.watch(UserId(1)).unwrap();
        assert_eq!(stored.threshold.value(), 2.5);
        assert_eq!(stored.interval.minutes(), 15);
        assert_eq!(stored.warehouses, [WarehouseId(1)].into_iter().collect());
        assert_eq!(stored.credential.unwrap().credential.expose(), "key");
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_watch_resumes_after_new_credential() {
        let f = fixture();
        ready(&f, 1).await;
        f.control.set_polling_frequency(UserId(1), 1).await.unwrap();
        f.source.reject("key");

        let mut tasks = JoinSet::new();
        tokio::time::advance(Duration::from_secs(60)).await;
        f.scheduler.tick(&mut tasks);
        while let Some(outcome) = tasks.join_next().await {
            assert_eq!(outcome.unwrap(), PollOutcome::CredentialRejected);
        }
        assert!(f.control.describe(UserId(1)).unwrap().paused);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.tick(&mut tasks), 0);

        f.control.set_credential(UserId(1), "fresh").await.unwrap();
        let view = f.control.describe(UserId(1)).unwrap();
        assert!(!view.paused);
        assert_eq!(view.failures, 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.tick(&mut tasks), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_removes_everything() {
        let f = fixture();
        ready(&f, 1).await;
        f.control.unregister(UserId(1)).await.unwrap();

        assert!(f.control.describe(UserId(1)).is_none());
        assert!(f.store.watch(UserId(1)).is_none());
        assert!(f.scheduler.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_warehouses_stores_catalog() {
        let f = fixture();
        f.control.register(UserId(1)).await.unwrap();
        assert!(matches!(
            f.control.refresh_warehouses(UserId(1)).await,
            Err(WatchError::MissingCredential(_))
        ));

        f.control.set_credential(UserId(1), "key").await.unwrap();
        let catalog = f.control.refresh_warehouses(UserId(1)).await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(f.control.warehouses().await.unwrap(), catalog);
    }
}
