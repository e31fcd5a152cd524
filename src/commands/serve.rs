use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

use gatefleet::config::Config;
use gatefleet::metrics;
use gatefleet::server::FleetServer;

use super::{build_alerts, build_orchestrator, open_store, print_json};

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to wait for Ctrl+C"),
    }
}

/// Run the REST API together with the reconciliation loop
pub async fn serve(config: Config, without_reconcile: bool) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let store = open_store(&config)?;
    let orchestrator = Arc::new(build_orchestrator(&config, store).await?);
    let alerts = Arc::new(build_alerts(&config)?);

    let reconciler = if without_reconcile {
        tracing::warn!("Reconciliation loop disabled");
        None
    } else {
        Some(Arc::new(orchestrator.reconciler(Arc::clone(&alerts))).spawn())
    };

    let server = FleetServer::new(Arc::clone(&orchestrator), alerts, &config.server)
        .context("Failed to create API server")?;

    println!("gatefleet API listening on http://{}", server.addr());
    println!("Press Ctrl+C to stop.\n");

    let served = server.start_with_shutdown(shutdown_signal()).await;

    if let Some(handle) = reconciler {
        handle.stop().await;
    }

    served?;
    println!("gatefleet stopped.");
    Ok(())
}

/// Run reconciliation without the API, once or until interrupted
pub async fn reconcile(config: Config, once: bool) -> Result<()> {
    let store = open_store(&config)?;
    let orchestrator = build_orchestrator(&config, store).await?;
    let alerts = Arc::new(build_alerts(&config)?);
    let reconciler = Arc::new(orchestrator.reconciler(alerts));

    if once {
        let report = reconciler.run_cycle(Utc::now()).await;
        print_json(&report)?;
        if !report.is_clean() {
            anyhow::bail!("reconciliation finished with {} error(s)", report.errors.len());
        }
        return Ok(());
    }

    let handle = reconciler.spawn();
    shutdown_signal().await;
    handle.stop().await;
    Ok(())
}
