//! Telegram bot handlers.

use chrono::DateTime;
use slotwatch_core::{NotificationEvent, Threshold, UserId, Warehouse, WarehouseId};
use slotwatch_engine::{WatchControl, WatchError, WatchView};
use std::collections::BTreeSet;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Telegram caps messages at 4096 characters.
const MESSAGE_LIMIT: usize = 4000;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Telegram API error: {0}")]
    Api(#[from] teloxide::RequestError),
}

/// Bot commands.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Register for coefficient alerts")]
    Start,
    #[command(description = "Set your supplies API key. Usage: /key <api key>")]
    Key(String),
    #[command(description = "Set warehouses to watch. Usage: /warehouses 507,117986")]
    Warehouses(String),
    #[command(description = "Set polling frequency in minutes (1-1440). Usage: /frequency 5")]
    Frequency(String),
    #[command(description = "Alert when a coefficient drops to this value (0-20). Usage: /threshold 1")]
    Threshold(String),
    #[command(description = "List warehouses available for monitoring")]
    List,
    #[command(description = "Show current configuration")]
    Config,
    #[command(description = "Stop monitoring and delete your data")]
    Stop,
    #[command(description = "Show help")]
    Help,
}

/// Telegram bot wrapper.
pub struct TelegramBot {
    bot: Bot,
    control: Arc<WatchControl>,
}

impl TelegramBot {
    pub fn new(bot: Bot, control: Arc<WatchControl>) -> Self {
        Self { bot, control }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Run the command handler until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let bot = self.bot.clone();
        let handler = Update::filter_message().filter_command::<Command>().endpoint(
            move |bot: Bot, msg: Message, cmd: Command| {
                let this = Arc::clone(&self);
                async move { this.handle_command(bot, msg, cmd).await }
            },
        );

        let mut dispatcher = Dispatcher::builder(bot, handler).build();
        let token = dispatcher.shutdown_token();
        tokio::spawn(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => debug!(error = %e, "Dispatcher was not running"),
            }
        });

        info!("Telegram bot started");
        dispatcher.dispatch().await;
        info!("Telegram bot stopped");
    }

    async fn handle_command(
        &self,
        bot: Bot,
        msg: Message,
        cmd: Command,
    ) -> Result<(), TelegramError> {
        let user = UserId(msg.chat.id.0);
        let carries_key = matches!(cmd, Command::Key(_));

        for text in self.respond(user, cmd).await {
            bot.send_message(msg.chat.id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }

        // The key should not linger in the chat history.
        if carries_key {
            if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
                debug!(user = %user, error = %e, "Could not delete key message");
            }
        }
        Ok(())
    }

    /// Execute `cmd` for `user` and return the reply messages.
    pub async fn respond(&self, user: UserId, cmd: Command) -> Vec<String> {
        let result = match cmd {
            Command::Start => self.control.register(user).await.map(|_| {
                vec![String::from(
                    "👋 <b>Welcome to slotwatch!</b>\n\n\
                     I watch Wildberries acceptance coefficients and tell you when \
                     a warehouse gets cheap enough.\n\n\
                     1. /key &lt;api key&gt; to connect your account\n\
                     2. /list to see warehouses\n\
                     3. /warehouses 507,117986 to pick them\n\
                     4. /threshold and /frequency to tune alerts\n\n\
                     Use /help to see all commands."
                )]
            }),

            Command::Key(value) => {
                let value = value.trim();
                if value.is_empty() {
                    Ok(vec!["Usage: /key &lt;api key&gt;".to_string()])
                } else {
                    self.control
                        .set_credential(user, value)
                        .await
                        .map(|_| vec!["✅ API key accepted. Monitoring will use it from the next check.".to_string()])
                }
            }

            Command::Warehouses(value) => match parse_warehouse_ids(&value) {
                Ok(ids) => self.control.set_warehouses(user, ids).await.map(|selected| {
                    let list: Vec<String> = selected.iter().map(|id| id.to_string()).collect();
                    vec![format!("Watching warehouses: {}", list.join(", "))]
                }),
                Err(reason) => Ok(vec![format!(
                    "{reason}\nUsage: /warehouses 507,117986"
                )]),
            },

            Command::Frequency(value) => match value.trim().parse::<i64>() {
                Ok(minutes) => self
                    .control
                    .set_polling_frequency(user, minutes)
                    .await
                    .map(|interval| vec![format!("Checking every {} min", interval.minutes())]),
                Err(_) => Ok(vec!["Usage: /frequency &lt;minutes&gt;\nExample: /frequency 5".to_string()]),
            },

            Command::Threshold(value) => match Threshold::parse(&value) {
                Ok(threshold) => self
                    .control
                    .set_threshold(user, threshold.value())
                    .await
                    .map(|t| vec![format!("Alerting when a coefficient drops to {t} or lower")]),
                Err(e) => Err(WatchError::InvalidConfig(e)),
            },

            Command::List => self
                .control
                .refresh_warehouses(user)
                .await
                .map(|catalog| format_catalog(&catalog)),

            Command::Config => match self.control.describe(user) {
                Some(view) => Ok(vec![format_config(&view)]),
                None => Err(WatchError::UnknownUser(user)),
            },

            Command::Stop => self
                .control
                .unregister(user)
                .await
                .map(|_| vec!["Monitoring stopped and your data deleted. /start to come back.".to_string()]),

            Command::Help => Ok(vec![html::escape(&Command::descriptions().to_string())]),
        };

        result.unwrap_or_else(|e| vec![error_reply(user, &e)])
    }
}

fn error_reply(user: UserId, err: &WatchError) -> String {
    match err {
        WatchError::InvalidConfig(e) => format!("⚠️ {}", html::escape(&e.to_string())),
        WatchError::UnknownUser(_) => "Send /start first.".to_string(),
        WatchError::CredentialRejected(_) => {
            "❌ Wildberries rejected this API key. Check it and send /key again.".to_string()
        }
        WatchError::MissingCredential(_) => "Set your API key first: /key &lt;api key&gt;".to_string(),
        WatchError::Source(e) => {
            warn!(user = %user, error = %e, "Source unavailable while handling command");
            "Wildberries is not responding right now, try again later.".to_string()
        }
        WatchError::Store(e) => {
            error!(user = %user, error = %e, "Storage failure while handling command");
            "Something went wrong on our side, try again later.".to_string()
        }
    }
}

/// Parse a comma or whitespace separated list of warehouse ids.
pub fn parse_warehouse_ids(input: &str) -> Result<BTreeSet<WarehouseId>, String> {
    let mut ids = BTreeSet::new();
    for part in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        let id = part
            .parse::<u64>()
            .map_err(|_| format!("Not a warehouse id: {}", html::escape(part)))?;
        ids.insert(WarehouseId(id));
    }
    if ids.is_empty() {
        return Err("No warehouse ids given.".to_string());
    }
    Ok(ids)
}

fn format_catalog(catalog: &[Warehouse]) -> Vec<String> {
    if catalog.is_empty() {
        return vec!["No warehouses available.".to_string()];
    }

    let mut messages = Vec::new();
    let mut current = String::from("<b>Warehouses</b>\n");
    for warehouse in catalog {
        let line = format!(
            "<code>{}</code> {}\n",
            warehouse.id,
            html::escape(&warehouse.name)
        );
        if current.len() + line.len() > MESSAGE_LIMIT {
            messages.push(std::mem::take(&mut current));
        }
        current.push_str(&line);
    }
    messages.push(current);
    messages
}

fn format_config(view: &WatchView) -> String {
    let config = &view.config;
    let key = match &config.credential {
        Some(record) => format!(
            "set (<code>{}</code>, {})",
            record.credential.key(),
            record.updated_at.format("%d.%m.%Y %H:%M UTC")
        ),
        None => "not set".to_string(),
    };
    let warehouses = if config.warehouses.is_empty() {
        "none".to_string()
    } else {
        config
            .warehouses
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let status = if view.paused {
        "⏸ Paused: API key rejected"
    } else if config.is_pollable() {
        "Active"
    } else {
        "Waiting for setup"
    };

    format!(
        "<b>Current Configuration</b>\n\n\
         Status: {}\n\
         API key: {}\n\
         Warehouses: {}\n\
         Frequency: every {}\n\
         Threshold: {}",
        status, key, warehouses, config.interval, config.threshold
    )
}

/// Render the delivery date of a reading as `dd.mm.yyyy`, falling back to
/// the raw value.
fn format_date(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|date| date.format("%d.%m.%Y").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Format a threshold crossing as an HTML alert message.
pub fn format_alert_message(event: &NotificationEvent) -> String {
    let mut msg = format!(
        "📦 <b>Acceptance coefficient alert</b>\n\n\
         <b>Warehouse:</b> {} (<code>{}</code>)\n\
         <b>Coefficient:</b> {}",
        html::escape(&event.warehouse_name),
        event.warehouse,
        event.new_value
    );
    if let Some(old) = event.old_value {
        msg.push_str(&format!(" (was {old})"));
    }
    msg.push_str(&format!("\n<b>Your threshold:</b> {}", event.threshold));

    if let Some(date) = &event.date {
        msg.push_str(&format!("\n<b>Date:</b> {}", format_date(date)));
    }
    if let Some(box_type) = &event.box_type {
        msg.push_str(&format!("\n<b>Box type:</b> {}", html::escape(box_type)));
    }
    msg
}

pub fn format_credential_rejected() -> String {
    "🔑 <b>API key rejected</b>\n\n\
     Wildberries no longer accepts your API key, so monitoring is paused. \
     Send a new one with /key to resume."
        .to_string()
}
