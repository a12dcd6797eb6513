//! Persistence seam for watches, warehouse state and the warehouse catalog.

use async_trait::async_trait;
use slotwatch_core::{StoredWatch, UserId, Warehouse, WarehouseId, WarehouseState, WatchConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored data is invalid: {0}")]
    Corrupt(String),
}

/// Durable storage for everything that must survive a restart.
///
/// `save_states` must be atomic: either every state of one poll is written
/// or none is.
#[async_trait]
pub trait WatchStore: Send + Sync {
    async fn load_watches(&self) -> Result<Vec<StoredWatch>, StoreError>;

    /// Upsert the user row and replace its warehouse memberships.
    async fn save_watch(&self, config: &WatchConfig) -> Result<(), StoreError>;

    async fn delete_watch(&self, user: UserId) -> Result<(), StoreError>;

    async fn save_states(
        &self,
        user: UserId,
        states: &[(WarehouseId, WarehouseState)],
    ) -> Result<(), StoreError>;

    async fn save_warehouses(&self, warehouses: &[Warehouse]) -> Result<(), StoreError>;

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    watches: HashMap<UserId, WatchConfig>,
    states: HashMap<UserId, HashMap<WarehouseId, WarehouseState>>,
    warehouses: BTreeMap<WarehouseId, Warehouse>,
    fail_writes: bool,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating an unavailable backend.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Persisted state for `user`.
    pub fn states(&self, user: UserId) -> HashMap<WarehouseId, WarehouseState> {
        self.lock().states.get(&user).cloned().unwrap_or_default()
    }

    pub fn watch(&self, user: UserId) -> Option<WatchConfig> {
        self.lock().watches.get(&user).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Backend("memory store is failing writes".into()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl WatchStore for MemoryStore {
    async fn load_watches(&self) -> Result<Vec<StoredWatch>, StoreError> {
        let inner = self.lock();
        let mut watches: Vec<StoredWatch> = inner
            .watches
            .values()
            .map(|config| StoredWatch {
                config: config.clone(),
                states: inner.states.get(&config.user).cloned().unwrap_or_default(),
            })
            .collect();
        watches.sort_by_key(|w| w.config.user);
        Ok(watches)
    }

    async fn save_watch(&self, config: &WatchConfig) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        if let Some(states) = inner.states.get_mut(&config.user) {
            states.retain(|warehouse, _| config.warehouses.contains(warehouse));
        }
        inner.watches.insert(config.user, config.clone());
        Ok(())
    }

    async fn delete_watch(&self, user: UserId) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        inner.watches.remove(&user);
        inner.states.remove(&user);
        Ok(())
    }

    async fn save_states(
        &self,
        user: UserId,
        states: &[(WarehouseId, WarehouseState)],
    ) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        let entry = inner.states.entry(user).or_default();
        for &(warehouse, state) in states {
            entry.insert(warehouse, state);
        }
        Ok(())
    }

    async fn save_warehouses(&self, warehouses: &[Warehouse]) -> Result<(), StoreError> {
        let mut inner = self.writable()?;
        for warehouse in warehouses {
            inner.warehouses.insert(warehouse.id, warehouse.clone());
        }
        Ok(())
    }

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        Ok(self.lock().warehouses.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_and_load_watch_with_states() {
        let store = MemoryStore::new();
        let mut config = WatchConfig::new(UserId(42));
        config.warehouses = [WarehouseId(1), WarehouseId(2)].into_iter().collect();
        store.save_watch(&config).await.unwrap();

        let state = WarehouseState::new(3.0, Utc::now());
        store
            .save_states(UserId(42), &[(WarehouseId(1), state)])
            .await
            .unwrap();

        let loaded = store.load_watches().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config, config);
        assert_eq!(loaded[0].states.get(&WarehouseId(1)), Some(&state));
    }

    #[tokio::test]
    async fn test_dropping_warehouse_drops_its_state() {
        let store = MemoryStore::new();
        let mut config = WatchConfig::new(UserId(1));
        config.warehouses = [WarehouseId(1), WarehouseId(2)].into_iter().collect();
        store.save_watch(&config).await.unwrap();
        let state = WarehouseState::new(1.0, Utc::now());
        store
            .save_states(UserId(1), &[(WarehouseId(1), state), (WarehouseId(2), state)])
            .await
            .unwrap();

        config.warehouses.remove(&WarehouseId(2));
        store.save_watch(&config).await.unwrap();

        let states = store.states(UserId(1));
        assert_eq!(states.len(), 1);
        assert!(states.contains_key(&WarehouseId(1)));
    }

    #[tokio::test]
    async fn test_failing_writes_leave_nothing_behind() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let state = WarehouseState::new(1.0, Utc::now());
        let result = store.save_states(UserId(1), &[(WarehouseId(1), state)]).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(store.states(UserId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_watch_and_states() {
        let store = MemoryStore::new();
        store.save_watch(&WatchConfig::new(UserId(5))).await.unwrap();
        store
            .save_states(UserId(5), &[(WarehouseId(1), WarehouseState::new(1.0, Utc::now()))])
            .await
            .unwrap();

        store.delete_watch(UserId(5)).await.unwrap();
        assert!(store.load_watches().await.unwrap().is_empty());
        assert!(store.states(UserId(5)).is_empty());
    }

    #[tokio::test]
    async fn test_catalog_is_sorted_and_deduplicated() {
        let store = MemoryStore::new();
        let catalog = [
            Warehouse { id: WarehouseId(9), name: "Тула".into() },
            Warehouse { id: WarehouseId(3), name: "Казань".into() },
        ];
        store.save_warehouses(&catalog).await.unwrap();
        store.save_warehouses(&catalog[..1]).await.unwrap();

        let listed = store.list_warehouses().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![WarehouseId(3), WarehouseId(9)]);
    }
}
