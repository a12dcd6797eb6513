//! Threshold evaluation.
//!
//! Pure: given the previous per-warehouse state and a fresh snapshot, decide
//! which warehouses crossed down into the alerting zone and what state to
//! record. Alerts are edge-triggered: a value that stays at or below the
//! threshold alerts once, when it first gets there.

use slotwatch_core::{
    CoefficientSnapshot, NotificationEvent, Threshold, UserId, WarehouseId, WarehouseState,
};
use std::collections::{BTreeSet, HashMap};

/// Outcome of evaluating one snapshot for one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// New state per warehouse that had a usable reading.
    pub states: Vec<(WarehouseId, WarehouseState)>,
    /// Downward crossings, in warehouse id order.
    pub events: Vec<NotificationEvent>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.events.is_empty()
    }
}

/// Evaluate `snapshot` against `previous` for every warehouse in `watched`.
///
/// Warehouses missing from the snapshot keep their state. Readings older
/// than the recorded state are ignored so state never moves back in time.
pub fn evaluate(
    user: UserId,
    threshold: Threshold,
    previous: &HashMap<WarehouseId, WarehouseState>,
    snapshot: &CoefficientSnapshot,
    watched: &BTreeSet<WarehouseId>,
) -> Evaluation {
    let mut evaluation = Evaluation::default();
    let observed_at = snapshot.fetched_at;

    for &warehouse in watched {
        let Some(reading) = snapshot.get(warehouse) else {
            continue;
        };
        let new_value = reading.coefficient;

        let old = previous.get(&warehouse);
        if let Some(old) = old {
            if observed_at < old.observed_at {
                continue;
            }
        }

        let crossed = match old {
            None => false,
            Some(old) => !threshold.admits(old.coefficient) && threshold.admits(new_value),
        };

        if crossed {
            evaluation.events.push(NotificationEvent {
                user,
                warehouse,
                warehouse_name: reading.warehouse_name.clone(),
                old_value: old.map(|s| s.coefficient),
                new_value,
                threshold,
                date: reading.date.clone(),
                box_type: reading.box_type.clone(),
                observed_at,
            });
        }

        evaluation
            .states
            .push((warehouse, WarehouseState::new(new_value, observed_at)));
    }

    evaluation
}
