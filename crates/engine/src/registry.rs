//! In-memory registry of user watches.
//!
//! Every watch lives behind its own lock so that a sweep, a poll commit and a
//! configuration change for different users never contend. The registry map
//! itself is a [`DashMap`] and is never locked as a whole.

use dashmap::DashMap;
use slotwatch_core::{
    Credential, CredentialKey, Threshold, UserId, WarehouseId, WarehouseState, WatchConfig,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct EntryState {
    config: WatchConfig,
    next_due: Instant,
    states: HashMap<WarehouseId, WarehouseState>,
    /// Set when the source rejected the credential; cleared when it changes.
    paused: bool,
}

/// One user's watch.
pub struct WatchEntry {
    user: UserId,
    state: Mutex<EntryState>,
    in_flight: AtomicBool,
    failures: AtomicU32,
    retired: AtomicBool,
}

/// Point-in-time copy of a watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchView {
    pub config: WatchConfig,
    pub states: HashMap<WarehouseId, WarehouseState>,
    pub paused: bool,
    pub in_flight: bool,
    pub failures: u32,
    /// Time until the next poll is due, zero if overdue.
    pub next_due_in: Duration,
}

impl WatchEntry {
    fn new(config: WatchConfig, states: HashMap<WarehouseId, WarehouseState>, next_due: Instant) -> Self {
        Self {
            user: config.user,
            state: Mutex::new(EntryState {
                config,
                next_due,
                states,
                paused: false,
            }),
            in_flight: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn view(&self) -> WatchView {
        let state = self.lock();
        WatchView {
            config: state.config.clone(),
            states: state.states.clone(),
            paused: state.paused,
            in_flight: self.is_in_flight(),
            failures: self.failures(),
            next_due_in: state.next_due.saturating_duration_since(Instant::now()),
        }
    }

    pub fn config(&self) -> WatchConfig {
        self.lock().config.clone()
    }

    pub fn states(&self) -> HashMap<WarehouseId, WarehouseState> {
        self.lock().states.clone()
    }

    pub fn next_due(&self) -> Instant {
        self.lock().next_due
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// True once the watch has been removed from the registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Count one more consecutive failure and return the new count.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Replace the configuration.
    ///
    /// State for warehouses no longer watched is dropped. A new credential
    /// lifts the pause and resets the failure count. A changed interval
    /// takes effect from now if that is sooner than the current schedule.
    pub fn apply_config(&self, config: WatchConfig, now: Instant) {
        let mut state = self.lock();

        let credential_changed = match (&state.config.credential, &config.credential) {
            (Some(old), Some(new)) => old.credential != new.credential,
            (None, Some(_)) => true,
            _ => false,
        };
        if credential_changed {
            state.paused = false;
            self.reset_failures();
        }

        if config.interval != state.config.interval {
            let candidate = now + config.interval.as_duration();
            if candidate < state.next_due {
                state.next_due = candidate;
            }
        }

        state
            .states
            .retain(|warehouse, _| config.warehouses.contains(warehouse));
        state.config = config;
    }

    /// Pause polling if `key` is still the active credential.
    ///
    /// Returns false when the credential was replaced while the failing poll
    /// was running, or the watch was already paused.
    pub fn pause_if_credential(&self, key: &CredentialKey) -> bool {
        let mut state = self.lock();
        let current = state
            .config
            .credential
            .as_ref()
            .map(|record| record.credential.key());
        if state.paused || current.as_ref() != Some(key) {
            return false;
        }
        state.paused = true;
        true
    }

    /// Record evaluated states.
    ///
    /// Warehouses dropped from the watch meanwhile are ignored, and a state
    /// never replaces a newer one.
    pub fn commit(&self, states: &[(WarehouseId, WarehouseState)]) {
        let mut state = self.lock();
        for &(warehouse, new) in states {
            if !state.config.warehouses.contains(&warehouse) {
                continue;
            }
            match state.states.get(&warehouse) {
                Some(current) if current.observed_at > new.observed_at => {}
                _ => {
                    state.states.insert(warehouse, new);
                }
            }
        }
    }

    fn begin_poll(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                entry: Arc::clone(self),
            })
    }
}

/// Marks a watch as being polled until dropped.
pub struct InFlightGuard {
    entry: Arc<WatchEntry>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entry.in_flight.store(false, Ordering::Release);
    }
}

/// Everything a poll task needs, captured at dispatch.
pub struct PollJob {
    guard: InFlightGuard,
    pub credential: Credential,
    pub warehouses: BTreeSet<WarehouseId>,
    pub threshold: Threshold,
    /// Union of warehouses watched under the same credential.
    pub scope: Arc<BTreeSet<WarehouseId>>,
}

impl PollJob {
    pub fn entry(&self) -> &Arc<WatchEntry> {
        &self.guard.entry
    }

    pub fn user(&self) -> UserId {
        self.guard.entry.user
    }
}

/// Result of one registry sweep.
#[derive(Default)]
pub struct Sweep {
    pub jobs: Vec<PollJob>,
    /// Due watches whose previous poll had not finished.
    pub skipped: Vec<UserId>,
}

struct Pending {
    guard: InFlightGuard,
    credential: Credential,
    key: CredentialKey,
    warehouses: BTreeSet<WarehouseId>,
    threshold: Threshold,
}

/// All watches, keyed by user.
#[derive(Default)]
pub struct WatchRegistry {
    watches: DashMap<UserId, Arc<WatchEntry>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a watch, replacing any existing one for the same user.
    pub fn insert(
        &self,
        config: WatchConfig,
        states: HashMap<WarehouseId, WarehouseState>,
        next_due: Instant,
    ) -> Arc<WatchEntry> {
        let user = config.user;
        let entry = Arc::new(WatchEntry::new(config, states, next_due));
        if let Some(previous) = self.watches.insert(user, Arc::clone(&entry)) {
            previous.retired.store(true, Ordering::Release);
        }
        entry
    }

    pub fn remove(&self, user: UserId) -> Option<Arc<WatchEntry>> {
        let (_, entry) = self.watches.remove(&user)?;
        entry.retired.store(true, Ordering::Release);
        Some(entry)
    }

    pub fn get(&self, user: UserId) -> Option<Arc<WatchEntry>> {
        self.watches.get(&user).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.watches.contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Collect the watches due at `now` and reschedule them.
    ///
    /// Every due watch gets `next_due = now + interval` whether it is
    /// dispatched or skipped because a poll is still running. Paused watches
    /// and watches without a credential or warehouses are neither due nor
    /// part of any credential scope.
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut scopes: HashMap<CredentialKey, BTreeSet<WarehouseId>> = HashMap::new();
        let mut pending = Vec::new();
        let mut sweep = Sweep::default();

        for item in self.watches.iter() {
            let entry = item.value();
            let mut state = entry.lock();
            if state.paused || !state.config.is_pollable() {
                continue;
            }
            let Some(record) = state.config.credential.clone() else {
                continue;
            };
            let key = record.credential.key();

            scopes
                .entry(key.clone())
                .or_default()
                .extend(state.config.warehouses.iter().copied());

            if state.next_due > now {
                continue;
            }
            state.next_due = now + state.config.interval.as_duration();

            match entry.begin_poll() {
                Some(guard) => pending.push(Pending {
                    guard,
                    credential: record.credential,
                    key,
                    warehouses: state.config.warehouses.clone(),
                    threshold: state.config.threshold,
                }),
                None => sweep.skipped.push(entry.user),
            }
        }

        let scopes: HashMap<CredentialKey, Arc<BTreeSet<WarehouseId>>> = scopes
            .into_iter()
            .map(|(key, scope)| (key, Arc::new(scope)))
            .collect();

        sweep.jobs = pending
            .into_iter()
            .map(|p| {
                let scope = scopes
                    .get(&p.key)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(p.warehouses.clone()));
                PollJob {
                    guard: p.guard,
                    credential: p.credential,
                    warehouses: p.warehouses,
                    threshold: p.threshold,
                    scope,
                }
            })
            .collect();

        sweep
    }
}
