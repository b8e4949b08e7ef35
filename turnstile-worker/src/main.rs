use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_core::{EventSku, KeySpace, RetryPolicy};
use turnstile_inventory::HoldManager;
use turnstile_store::app_config::Config;
use turnstile_store::{RedisStore, SystemClock};

mod sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile_worker=debug,turnstile_inventory=info,turnstile_order=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(redis = %config.redis.url, events = config.worker.events.len(), "Configuration loaded");

    let store = Arc::new(RedisStore::new(&config.redis.url).await?);
    let keys = KeySpace::from(&config.keys);
    let holds = HoldManager::new(
        store,
        keys,
        Arc::new(SystemClock),
        &config.business_rules,
        RetryPolicy::from(&config.retry),
    );

    let events: Vec<EventSku> = config.worker.events.iter().map(|sku| EventSku::new(sku.as_str())).collect();
    if events.is_empty() {
        tracing::warn!("No events configured, the sweeper has nothing to do");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.worker.sweep_interval_seconds.max(1));
    let handle = tokio::spawn(sweeper::run_sweeper(holds, events, interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    let swept = handle.await?;
    tracing::info!(swept, "Sweeper stopped");
    Ok(())
}
