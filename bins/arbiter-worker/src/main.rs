mod engine;
mod executor;
mod limiter;
mod manager;
mod registry;
mod session;
mod task;

#[cfg(test)]
mod testing;

use arbiter_common::{Config, LogFormat};
use manager::Manager;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!("Arbiter worker booting...");

    let manager = Manager::initialize(&config).await?;
    tracing::info!(
        worker_id = manager.worker_id(),
        rate_limit = config.rate_limit,
        slot_denied_policy = %config.slot_denied_policy,
        "Worker initialized"
    );

    // Setup graceful shutdown: stop polling, let the running session drain
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            // Keep the sender alive; dropping it would stop dispatch
            std::future::pending::<()>().await;
        }
        tracing::info!("Received shutdown signal, draining current session...");
        let _ = stop.send(true);

        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second shutdown signal; exiting without cleanup");
            std::process::exit(130);
        }
    });

    manager.start(shutdown).await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}
