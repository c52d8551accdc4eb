use std::path::Path;

use driftnet::DriftnetError;
use driftnet::collector::Collector;
use driftnet::config::{AppConfig, fetch_config};
use driftnet::venue::VenueRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DriftnetError> {
    // Log level from RUST_LOG, defaulting to info.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // An optional JSON config file path; environment variables override it.
    let app_config = match std::env::args_os().nth(1) {
        Some(path) => AppConfig::load(Path::new(&path))?,
        None => fetch_config()?,
    };

    let storage = app_config.storage.build()?;
    storage.connect().await?;
    info!(backend = storage.name(), "Storage ready");

    let registry = VenueRegistry::with_defaults();
    let collector = Collector::from_registry(app_config.collector, &registry, storage.clone())?;
    collector.start().await?;

    let mut status = collector.watch_status();
    let gave_up = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            false
        }
        terminal = status.wait_for(|s| s.terminal) => terminal.is_ok(),
    };

    let last_error = collector.status().last_error;
    collector.stop().await;
    storage.disconnect().await?;

    if gave_up {
        let cause = last_error.unwrap_or_else(|| "retries exhausted".to_string());
        error!(cause = %cause, "Collector gave up");
        return Err(DriftnetError::Connection(cause));
    }
    Ok(())
}
