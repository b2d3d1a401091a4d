// signal-hunt binary - boot, wire, run, shut down cleanly

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use signal_hunt::core::config::ConfigManager;
use signal_hunt::core::logger::setup_logging;
use signal_hunt::dashboard::{DashboardServer, DashboardState};
use signal_hunt::engine::{Engine, SignalPipeline};
use signal_hunt::storage::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").ok();
    let json_logs = std::env::var("LOG_JSON").map(|v| v == "1" || v == "true").ok();
    setup_logging(log_level.as_deref(), json_logs);

    let config_path = std::env::args().nth(1);
    let config = Arc::new(ConfigManager::new(config_path.as_deref())?);
    if !config.validate()? {
        error!("Configuration incomplete; see warnings above");
    }
    info!(summary = ?config.get_summary(), "Starting signal-hunt");

    // Fatal at boot: database must open
    let storage_cfg = config.storage();
    let db = Arc::new(Database::connect(&storage_cfg.db_path).await?);

    let pipeline = Arc::new(SignalPipeline::new(&config));

    // Configured pairs plus any coins added through the dashboard last run
    let mut monitored = config.pairs().all();
    if let Ok(Some(blob)) = db.load_state_blob(signal_hunt::engine::DASHBOARD_COINS_KEY).await {
        if let Ok(saved) = serde_json::from_str::<Vec<String>>(&blob) {
            for symbol in saved {
                if !monitored.contains(&symbol) {
                    monitored.push(symbol);
                }
            }
        }
    }

    let (coin_tx, coin_rx) = mpsc::unbounded_channel();
    let dashboard = DashboardState::new(config.dashboard(), db.clone(), monitored, coin_tx);

    // Fatal at boot: dashboard port must bind
    let dashboard_cfg = config.dashboard();
    let server = DashboardServer::new(dashboard.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(&dashboard_cfg.bind_addr).await {
            error!(error = %e, "Dashboard server exited");
            std::process::exit(1);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Engine::new(pipeline, config.clone(), db, dashboard, coin_rx);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    match engine_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Engine error during shutdown"),
        Err(e) => error!(error = %e, "Engine task panicked"),
    }
    server_handle.abort();

    info!("Goodbye");
    Ok(())
}
