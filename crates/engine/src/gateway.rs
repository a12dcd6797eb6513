//! Outbound notification seam.

use async_trait::async_trait;
use slotwatch_core::{NotificationEvent, UserId};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Recipient unreachable: {0}")]
    Unreachable(String),
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Delivers notifications to users.
///
/// A delivery failure is reported but never undoes the state change that
/// produced the event.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;

    /// Tell `user` that their credential was rejected and polling is paused.
    async fn credential_rejected(&self, _user: UserId) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Notifier that only logs. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        info!(
            user = %event.user,
            warehouse = %event.warehouse,
            name = %event.warehouse_name,
            old = ?event.old_value,
            new = event.new_value,
            threshold = %event.threshold,
            "Coefficient dropped to threshold"
        );
        Ok(())
    }

    async fn credential_rejected(&self, user: UserId) -> Result<(), DeliveryError> {
        warn!(user = %user, "Credential rejected, polling paused");
        Ok(())
    }
}
