use std::time::Duration;

use swapboard_domain::util::now_ms;
use swapboard_infra::observability::{init_metrics, register_sweep, set_realtime_stats};
use swapboard_infra::services::AppServices;
use swapboard_infra::{config::AppConfig, logging::init_tracing};
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    if config.metrics_enabled {
        init_metrics()?;
    }

    let services = AppServices::in_memory(&config)?;
    let poll = Duration::from_millis(config.worker_poll_interval_ms.max(1_000));
    info!(poll_ms = poll.as_millis() as u64, backend = %config.data_backend, "worker starting");

    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => sweep(&services).await,
        }
    }

    services.realtime.cleanup();
    info!("worker shutdown");
    Ok(())
}

async fn sweep(services: &AppServices) {
    match services.sweep_overdue_trades(now_ms()).await.into_result() {
        Ok(completed) => register_sweep("ok", completed.len()),
        Err(_) => register_sweep("error", 0),
    }
    set_realtime_stats(&services.realtime.stats());
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
