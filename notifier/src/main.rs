use std::path::PathBuf;
use std::sync::Arc;

use notifier::config::EngineConfig;
use notifier::database::{self, repositories::{SqlxNotificationRepository, SqlxPreferenceStore}};
use notifier::logging;
use notifier::notification::channels::{EmailChannel, PushChannel, SmsChannel};
use notifier::notification::{NotificationEngine, ProviderRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").ok().map(PathBuf::from);
    let (_logging, _guard) = logging::init_logging(log_dir.as_deref())?;

    let config = EngineConfig::from_env()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:notifier.db?mode=rwc".to_string());
    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(EmailChannel::logging(config.channels.email.clone())));
    registry.register(Arc::new(PushChannel::logging(config.channels.push.clone())));
    registry.register(Arc::new(SmsChannel::logging(config.channels.sms.clone())));

    let engine = NotificationEngine::new(
        config,
        registry,
        Arc::new(SqlxNotificationRepository::new(pool.clone())),
        Arc::new(SqlxPreferenceStore::new(pool.clone())),
    )?;
    engine.start()?;

    tracing::info!(database_url = %database_url, "notifier initialized successfully");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    engine.stop().await;
    pool.close().await;

    Ok(())
}
