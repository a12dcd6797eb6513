//! Single-flight snapshot cache keyed by credential.
//!
//! Users that share an API key are served from one fetch: a fresh cached
//! snapshot is reused, and concurrent requests join the fetch already in
//! flight instead of issuing their own. Every outbound call first takes a
//! token from the [`CredentialRateLimiter`].

use crate::{CoefficientSource, CredentialRateLimiter, SourceError};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use slotwatch_core::{CoefficientSnapshot, Credential, CredentialKey, WarehouseId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Result shared by every waiter of one fetch.
pub type FetchResult = Result<Arc<CoefficientSnapshot>, SourceError>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a snapshot may be reused. Clamped below the one-minute
    /// minimum polling interval so no user ever sees the same snapshot twice.
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub const MAX_TTL_SECS: u64 = 59;

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.min(Self::MAX_TTL_SECS))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 45 }
    }
}

/// Counters for cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// External fetches actually issued.
    pub fetches: AtomicU64,
    /// Requests answered from a fresh cached snapshot.
    pub hits: AtomicU64,
    /// Requests that joined a fetch already in flight.
    pub joins: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSummary {
    pub fetches: u64,
    pub hits: u64,
    pub joins: u64,
}

struct InFlight {
    id: u64,
    scope: BTreeSet<WarehouseId>,
    future: SharedFetch,
}

#[derive(Default)]
struct Slot {
    cached: Option<(Arc<CoefficientSnapshot>, Instant)>,
    in_flight: Option<InFlight>,
}

struct CacheInner {
    source: Arc<dyn CoefficientSource>,
    limiter: Arc<CredentialRateLimiter>,
    ttl: Duration,
    slots: Mutex<HashMap<CredentialKey, Slot>>,
    next_flight: AtomicU64,
    stats: CacheStats,
}

impl CacheInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<CredentialKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, key: &CredentialKey, flight: u64, result: &FetchResult) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if slot.in_flight.as_ref().map(|f| f.id) == Some(flight) {
            slot.in_flight = None;
        }
        if let Ok(snapshot) = result {
            slot.cached = Some((Arc::clone(snapshot), Instant::now()));
        }
    }
}

enum Step {
    Join(SharedFetch),
    WaitThenRetry(SharedFetch),
}

/// Deduplicating front of a [`CoefficientSource`].
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

impl SnapshotCache {
    pub fn new(
        source: Arc<dyn CoefficientSource>,
        limiter: Arc<CredentialRateLimiter>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                limiter,
                ttl: config.ttl(),
                slots: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(1),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Snapshot covering `scope` for `credential`.
    ///
    /// `scope` should be every warehouse watched under this credential so
    /// one fetch serves all of its users.
    pub async fn get(
        &self,
        credential: &Credential,
        scope: &BTreeSet<WarehouseId>,
    ) -> FetchResult {
        let key = credential.key();

        loop {
            let step = {
                let mut slots = self.inner.slots();
                let slot = slots.entry(key.clone()).or_default();

                if let Some((snapshot, stored_at)) = &slot.cached {
                    if stored_at.elapsed() < self.inner.ttl && snapshot.covers(scope) {
                        self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                        trace!(credential = %key, "Serving cached snapshot");
                        return Ok(Arc::clone(snapshot));
                    }
                }

                match &slot.in_flight {
                    Some(flight) if flight.scope.is_superset(scope) => {
                        self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
                        trace!(credential = %key, flight = flight.id, "Joining in-flight fetch");
                        Step::Join(flight.future.clone())
                    }
                    Some(flight) => Step::WaitThenRetry(flight.future.clone()),
                    None => {
                        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                        let future = self.start_fetch(id, credential.clone(), scope.clone());
                        slot.in_flight = Some(InFlight {
                            id,
                            scope: scope.clone(),
                            future: future.clone(),
                        });
                        Step::Join(future)
                    }
                }
            };

            match step {
                Step::Join(future) => return future.await,
                Step::WaitThenRetry(future) => {
                    let _ = future.await;
                }
            }
        }
    }

    fn start_fetch(
        &self,
        id: u64,
        credential: Credential,
        scope: BTreeSet<WarehouseId>,
    ) -> SharedFetch {
        let inner = Arc::clone(&self.inner);

        async move {
            let key = credential.key();
            let result: FetchResult = async {
                inner
                    .limiter
                    .acquire_within(&key, inner.limiter.config().max_wait())
                    .await?;
                inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(credential = %key, flight = id, warehouses = scope.len(), "Fetching coefficients");
                inner.source.fetch(&credential, &scope).await.map(Arc::new)
            }
            .await;

            inner.complete(&key, id, &result);
            result
        }
        .boxed()
        .shared()
    }

    /// Remove expired snapshots with no fetch in flight, and the rate
    /// limiter buckets of credentials that went quiet.
    ///
    /// Returns the number of snapshot slots removed.
    pub fn prune(&self) -> usize {
        let ttl = self.inner.ttl;
        let pruned = {
            let mut slots = self.inner.slots();
            let before = slots.len();
            slots.retain(|_, slot| {
                slot.in_flight.is_some()
                    || slot
                        .cached
                        .as_ref()
                        .is_some_and(|(_, stored_at)| stored_at.elapsed() < ttl)
            });
            before - slots.len()
        };

        let evicted = self.inner.limiter.evict_idle();
        if evicted > 0 {
            debug!(
                evicted,
                tracked = self.inner.limiter.tracked_credentials(),
                "Evicted idle rate limit buckets"
            );
        }
        pruned
    }

    /// Drop anything cached for `key` (e.g. after the credential was rejected).
    pub fn invalidate(&self, key: &CredentialKey) {
        if let Some(slot) = self.inner.slots().get_mut(key) {
            slot.cached = None;
        }
    }

    pub fn stats(&self) -> CacheStatsSummary {
        let stats = &self.inner.stats;
        CacheStatsSummary {
            fetches: stats.fetches.load(Ordering::Relaxed),
            hits: stats.hits.load(Ordering::Relaxed),
            joins: stats.joins.load(Ordering::Relaxed),
        }
    }
}
