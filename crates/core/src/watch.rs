//! Persisted per-user watch configuration.

use crate::{CredentialRecord, PollingInterval, Threshold, UserId, WarehouseId, WarehouseState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A user's monitoring settings as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub user: UserId,
    pub credential: Option<CredentialRecord>,
    pub warehouses: BTreeSet<WarehouseId>,
    pub interval: PollingInterval,
    pub threshold: Threshold,
}

impl WatchConfig {
    /// Fresh registration with default cadence and threshold.
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            credential: None,
            warehouses: BTreeSet::new(),
            interval: PollingInterval::default(),
            threshold: Threshold::default(),
        }
    }

    /// True once there is something to poll.
    pub fn is_pollable(&self) -> bool {
        self.credential.is_some() && !self.warehouses.is_empty()
    }
}

/// A watch loaded at startup together with its last known states.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWatch {
    pub config: WatchConfig,
    pub states: HashMap<WarehouseId, WarehouseState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Credential;

    #[test]
    fn test_new_watch_is_not_pollable() {
        let mut config = WatchConfig::new(UserId(42));
        assert!(!config.is_pollable());

        config.credential = Some(CredentialRecord::new(Credential::new("key")));
        assert!(!config.is_pollable());

        config.warehouses.insert(WarehouseId(117986));
        assert!(config.is_pollable());
    }

    #[test]
    fn test_defaults_are_in_bounds() {
        let config = WatchConfig::new(UserId(1));
        assert_eq!(config.interval.minutes(), 5);
        assert_eq!(config.threshold.value(), 1.0);
    }
}
