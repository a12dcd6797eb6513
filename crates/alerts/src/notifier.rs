//! Telegram delivery of threshold alerts.

use crate::telegram::{format_alert_message, format_credential_rejected};
use async_trait::async_trait;
use slotwatch_core::{NotificationEvent, UserId};
use slotwatch_engine::{DeliveryError, Notifier};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::{ApiError, RequestError};
use tracing::debug;

/// Sends alerts as HTML messages to the user's chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send(&self, user: UserId, text: String) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(user.0), text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(delivery_error)?;
        debug!(user = %user, "Alert delivered");
        Ok(())
    }
}

fn delivery_error(err: RequestError) -> DeliveryError {
    match err {
        RequestError::Api(
            api @ (ApiError::BotBlocked | ApiError::ChatNotFound | ApiError::UserDeactivated),
        ) => DeliveryError::Unreachable(api.to_string()),
        other => DeliveryError::Failed(other.to_string()),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        self.send(event.user, format_alert_message(event)).await
    }

    async fn credential_rejected(&self, user: UserId) -> Result<(), DeliveryError> {
        self.send(user, format_credential_rejected()).await
    }
}
