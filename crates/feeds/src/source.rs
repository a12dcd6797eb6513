//! The coefficient source interface.

use crate::SourceError;
use async_trait::async_trait;
use slotwatch_core::{CoefficientSnapshot, Credential, Warehouse, WarehouseId};
use std::collections::BTreeSet;

/// Something that can report current acceptance coefficients.
#[async_trait]
pub trait CoefficientSource: Send + Sync {
    /// Fetch current coefficients for `warehouses` using `credential`.
    async fn fetch(
        &self,
        credential: &Credential,
        warehouses: &BTreeSet<WarehouseId>,
    ) -> Result<CoefficientSnapshot, SourceError>;

    /// Check that `credential` is accepted by the source.
    async fn validate(&self, _credential: &Credential) -> Result<(), SourceError> {
        Ok(())
    }

    /// List warehouses selectable for monitoring.
    async fn warehouses(&self, _credential: &Credential) -> Result<Vec<Warehouse>, SourceError> {
        Ok(Vec::new())
    }
}
