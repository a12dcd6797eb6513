//! slotwatch - Wildberries acceptance coefficient monitor
//!
//! Polls the supplies API for every registered Telegram user at their own
//! cadence and alerts them when a watched warehouse becomes cheap enough.

mod config;

use clap::Parser;
use config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use slotwatch_alerts::{Database, DbError, TelegramBot, TelegramNotifier};
use slotwatch_engine::{
    LogNotifier, MemoryStore, Notifier, Scheduler, SchedulerStatsSummary, StoreError,
    WatchControl, WatchStore,
};
use slotwatch_feeds::{
    CoefficientSource, CredentialRateLimiter, SnapshotCache, SourceError, WildberriesClient,
};

const STATS_INTERVAL: Duration = Duration::from_secs(300);

/// slotwatch CLI
#[derive(Parser, Debug)]
#[command(name = "slotwatch")]
#[command(about = "Wildberries acceptance coefficient alerts over Telegram", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log alerts instead of sending them
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Keep everything in memory instead of the database
    #[arg(long, default_value_t = false)]
    ephemeral: bool,
}

#[derive(Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("Failed to load watches: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to build source client: {0}")]
    Source(#[from] SourceError),
    #[error("TELEGRAM_BOT_TOKEN is not set (use --dry-run to run without Telegram)")]
    MissingToken,
}

fn init_logging(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn bot_token() -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty())
}

fn log_stats(summary: &SchedulerStatsSummary) {
    info!(
        ticks = summary.ticks,
        dispatched = summary.dispatched,
        skipped = summary.skipped_in_flight,
        succeeded = summary.succeeded,
        failed = summary.failed,
        notifications = summary.notifications_sent,
        delivery_failures = summary.delivery_failures,
        "Scheduler stats"
    );
}

async fn run_stats_reporter(scheduler: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_stats(&scheduler.stats());
                let cache = scheduler.cache_stats();
                info!(
                    watches = scheduler.registry().len(),
                    fetches = cache.fetches,
                    hits = cache.hits,
                    joins = cache.joins,
                    "Cache stats"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = AppConfig::load(&args.config)?.with_env_overrides();

    let token = bot_token();
    if token.is_none() && !args.dry_run {
        return Err(StartupError::MissingToken);
    }
    let bot = token.map(Bot::new);

    let store: Arc<dyn WatchStore> = if args.ephemeral {
        warn!("Running with in-memory storage, nothing will survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        info!(url = %config.database_url, "Connecting to database");
        Arc::new(Database::connect(&config.database_url).await?)
    };

    let limiter = Arc::new(CredentialRateLimiter::new(config.rate_limit));
    let source: Arc<dyn CoefficientSource> = Arc::new(
        WildberriesClient::new(config.source.clone())?.with_limiter(Arc::clone(&limiter)),
    );
    let cache = SnapshotCache::new(Arc::clone(&source), limiter, config.cache);

    let notifier: Arc<dyn Notifier> = match (&bot, args.dry_run) {
        (Some(bot), false) => Arc::new(TelegramNotifier::new(bot.clone())),
        _ => {
            info!("Dry run: alerts are logged, not sent");
            Arc::new(LogNotifier)
        }
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        cache,
        Arc::clone(&store),
        notifier,
    ));

    let watches = store.load_watches().await?;
    let restored = watches.len();
    for stored in watches {
        scheduler.restore(stored);
    }
    info!(restored, "Watches restored");

    let control = Arc::new(WatchControl::new(Arc::clone(&scheduler), store, source));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });

    let stats_handle = tokio::spawn(run_stats_reporter(Arc::clone(&scheduler), shutdown_rx.clone()));

    let bot_handle = bot.map(|bot| {
        let telegram = Arc::new(TelegramBot::new(bot, control));
        tokio::spawn(telegram.run(shutdown_rx))
    });
    if bot_handle.is_none() {
        info!("No bot token, command bot disabled");
    }

    info!("Press Ctrl+C to stop...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
    }

    warn!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let grace = config.scheduler.shutdown_grace() + Duration::from_secs(2);
    if tokio::time::timeout(grace, scheduler_handle).await.is_err() {
        warn!("Scheduler did not stop in time");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), stats_handle).await;
    if let Some(handle) = bot_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Telegram bot did not stop in time");
        }
    }

    info!("Final stats:");
    log_stats(&scheduler.stats());
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);
    let _ = dotenvy::dotenv();

    info!("Starting slotwatch");
    info!(config = %args.config, dry_run = args.dry_run, "Arguments");

    if let Err(e) = run(args).await {
        error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}
