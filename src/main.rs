mod config;
mod forwarder;
mod platform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::platform::telegram::{self, TelegramTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,groupfwd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let settings = config.settings();
    info!("Configuration loaded successfully");
    info!("  Rules: {}", config.rules.len());
    info!("  Show sender: {}", settings.show_sender);
    info!(
        "  Retries: {} x {:?}",
        settings.retry.max_retries, settings.retry.retry_delay
    );
    info!("  Workers: {}", settings.workers);
    info!("  Admins: {:?}", config.telegram.admin_user_ids);

    let bot = teloxide::Bot::new(&config.telegram.bot_token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let (forwarder, workers) = Forwarder::start(config.rule_set(), settings, transport);
    let forwarder = Arc::new(forwarder);

    info!("Forwarder is starting...");
    telegram::run(
        bot,
        forwarder.clone(),
        config_path,
        config.telegram.admin_user_ids.clone(),
    )
    .await?;

    // Let in-flight forwards finish before exiting
    drop(forwarder);
    workers.join().await;
    info!("Forwarder stopped");

    Ok(())
}
