use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use fleetbook::clock::SystemClock;
use fleetbook::config::Config;
use fleetbook::notify::{Dispatcher, Fanout, NotifyHub};
use fleetbook::scheduler::{self, Reconciler};
use fleetbook::store::WalStore;
use fleetbook::webhook::WebhookDispatcher;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    fleetbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(config.data_dir.join("bookings.wal"))?);

    let hub = Arc::new(NotifyHub::new());
    let mut sinks: Vec<Arc<dyn Dispatcher>> = vec![hub.clone() as Arc<dyn Dispatcher>];
    if let Some(url) = &config.webhook_url {
        sinks.push(Arc::new(WebhookDispatcher::spawn(
            url.clone(),
            config.webhook_timeout,
            config.webhook_queue,
        )?));
    }
    let dispatcher = Arc::new(Fanout::new(sinks));
    tokio::spawn(log_notifications(hub.subscribe_all()));

    info!("fleetbook starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  scheduler: {}", if config.scheduler_enabled { "enabled" } else { "disabled" });
    info!("  webhook: {}", config.webhook_url.as_deref().unwrap_or("disabled"));
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.scheduler_enabled {
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            dispatcher,
            Arc::new(SystemClock::new(config.timezone)),
            &config.scheduler,
        ));
        tasks.push(tokio::spawn(scheduler::run_scheduler(
            reconciler,
            config.scheduler.interval,
            shutdown_rx.clone(),
        )));
    }
    tasks.push(tokio::spawn(scheduler::run_compactor(
        store,
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
        shutdown_rx,
    )));

    // Graceful shutdown: stop ticking on SIGTERM/ctrl-c, let the in-flight pass finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        task.await?;
    }

    info!("fleetbook stopped");
    Ok(())
}

async fn log_notifications(mut rx: broadcast::Receiver<fleetbook::notify::Notification>) {
    loop {
        match rx.recv().await {
            Ok(n) => match serde_json::to_string(&n) {
                Ok(json) => debug!(kind = %n.kind, "notification {json}"),
                Err(e) => debug!(kind = %n.kind, "notification not serializable: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "notification log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
