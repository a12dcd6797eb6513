//! Telegram front end and SQLite storage for slotwatch.
//!
//! This crate provides:
//! - SQLite persistence implementing the engine's `WatchStore`
//! - Telegram delivery implementing the engine's `Notifier`
//! - The command bot users configure their watches with

pub mod db;
pub mod notifier;
pub mod telegram;

pub use db::{Database, DbError};
pub use notifier::TelegramNotifier;
pub use telegram::{Command, TelegramBot, TelegramError};
