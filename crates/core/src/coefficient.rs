//! Coefficient readings, snapshots and the state derived from them.

use crate::{Threshold, UserId, WarehouseId};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Warehouse catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub name: CompactString,
}

/// Best available acceptance coefficient for one warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Coefficient value (lower is cheaper).
    pub coefficient: f64,
    /// Warehouse display name as reported by the source.
    pub warehouse_name: CompactString,
    /// Date the coefficient applies to, if reported.
    pub date: Option<CompactString>,
    /// Box type the coefficient applies to, if reported.
    pub box_type: Option<CompactString>,
}

impl Reading {
    pub fn new(coefficient: f64, warehouse_name: impl Into<CompactString>) -> Self {
        Self {
            coefficient,
            warehouse_name: warehouse_name.into(),
            date: None,
            box_type: None,
        }
    }
}

/// Result of one external fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSnapshot {
    pub readings: HashMap<WarehouseId, Reading>,
    pub fetched_at: DateTime<Utc>,
    /// Warehouses the fetch was asked for. Used to decide whether a cached
    /// snapshot can serve a later request.
    pub requested: BTreeSet<WarehouseId>,
}

impl CoefficientSnapshot {
    pub fn new(requested: BTreeSet<WarehouseId>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            readings: HashMap::new(),
            fetched_at,
            requested,
        }
    }

    pub fn with_reading(mut self, warehouse: WarehouseId, reading: Reading) -> Self {
        self.readings.insert(warehouse, reading);
        self
    }

    pub fn get(&self, warehouse: WarehouseId) -> Option<&Reading> {
        self.readings.get(&warehouse)
    }

    /// True if this snapshot was fetched for every warehouse in `warehouses`.
    pub fn covers(&self, warehouses: &BTreeSet<WarehouseId>) -> bool {
        warehouses.is_subset(&self.requested)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Last observed coefficient for a (user, warehouse) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarehouseState {
    pub coefficient: f64,
    pub observed_at: DateTime<Utc>,
}

impl WarehouseState {
    pub fn new(coefficient: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            coefficient,
            observed_at,
        }
    }
}

/// A downward threshold crossing to deliver to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub user: UserId,
    pub warehouse: WarehouseId,
    pub warehouse_name: CompactString,
    pub old_value: Option<f64>,
    pub new_value: f64,
    pub threshold: Threshold,
    pub date: Option<CompactString>,
    pub box_type: Option<CompactString>,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_covers_subset() {
        let requested: BTreeSet<WarehouseId> =
            [WarehouseId(1), WarehouseId(2), WarehouseId(3)].into_iter().collect();
        let snapshot = CoefficientSnapshot::new(requested, Utc::now());

        let subset: BTreeSet<WarehouseId> = [WarehouseId(1), WarehouseId(3)].into_iter().collect();
        let other: BTreeSet<WarehouseId> = [WarehouseId(1), WarehouseId(4)].into_iter().collect();
        assert!(snapshot.covers(&subset));
        assert!(!snapshot.covers(&other));
    }

    #[test]
    fn test_snapshot_with_reading() {
        let snapshot = CoefficientSnapshot::new(BTreeSet::new(), Utc::now())
            .with_reading(WarehouseId(507), Reading::new(3.0, "Коледино"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(WarehouseId(507)).unwrap().coefficient, 3.0);
        assert!(snapshot.get(WarehouseId(1)).is_none());
    }
}
