//! Scripted collaborators for engine tests.

use crate::{DeliveryError, Notifier};
use async_trait::async_trait;
use chrono::Utc;
use slotwatch_core::{
    CoefficientSnapshot, Credential, NotificationEvent, Reading, UserId, Warehouse, WarehouseId,
};
use slotwatch_feeds::{CoefficientSource, SourceError};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Source that replays a scripted coefficient series per warehouse.
///
/// Each fetch consumes the next value of every requested warehouse; the last
/// value repeats once the series is exhausted.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    series: Mutex<HashMap<WarehouseId, VecDeque<f64>>>,
    rejected: Mutex<HashSet<String>>,
    queued_errors: Mutex<VecDeque<SourceError>>,
    pub fetches: AtomicUsize,
    pub latency: Option<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn series(self, warehouse: u64, values: &[f64]) -> Self {
        self.series
            .lock()
            .unwrap()
            .insert(WarehouseId(warehouse), values.iter().copied().collect());
        self
    }

    /// Reject `key` with an auth error on every call.
    pub fn reject(&self, key: &str) {
        self.rejected.lock().unwrap().insert(key.to_string());
    }

    /// Fail the next fetch (any credential) with `error`.
    pub fn fail_next(&self, error: SourceError) {
        self.queued_errors.lock().unwrap().push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoefficientSource for ScriptedSource {
    async fn fetch(
        &self,
        credential: &Credential,
        warehouses: &BTreeSet<WarehouseId>,
    ) -> Result<CoefficientSnapshot, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.rejected.lock().unwrap().contains(credential.expose()) {
            return Err(SourceError::Auth("unauthorized".into()));
        }
        if let Some(error) = self.queued_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut snapshot = CoefficientSnapshot::new(warehouses.clone(), Utc::now());
        let mut series = self.series.lock().unwrap();
        for warehouse in warehouses {
            let Some(values) = series.get_mut(warehouse) else {
                continue;
            };
            let value = if values.len() > 1 {
                values.pop_front()
            } else {
                values.front().copied()
            };
            if let Some(value) = value {
                snapshot = snapshot.with_reading(
                    *warehouse,
                    Reading::new(value, format!("Склад {warehouse}")),
                );
            }
        }
        Ok(snapshot)
    }

    async fn validate(&self, credential: &Credential) -> Result<(), SourceError> {
        if self.rejected.lock().unwrap().contains(credential.expose()) {
            return Err(SourceError::Auth("unauthorized".into()));
        }
        Ok(())
    }

    async fn warehouses(&self, _credential: &Credential) -> Result<Vec<Warehouse>, SourceError> {
        let series = self.series.lock().unwrap();
        let mut catalog: Vec<Warehouse> = series
            .keys()
            .map(|id| Warehouse {
                id: *id,
                name: format!("Склад {id}").into(),
            })
            .collect();
        catalog.sort_by_key(|w| w.id);
        Ok(catalog)
    }
}

/// Notifier that records what it was asked to deliver.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub events: Mutex<Vec<NotificationEvent>>,
    pub rejected: Mutex<Vec<UserId>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, user: UserId) -> Vec<NotificationEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.user == user)
            .collect()
    }

    pub fn rejected(&self) -> Vec<UserId> {
        self.rejected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Failed("chat unavailable".into()));
        }
        Ok(())
    }

    async fn credential_rejected(&self, user: UserId) -> Result<(), DeliveryError> {
        self.rejected.lock().unwrap().push(user);
        Ok(())
    }
}
