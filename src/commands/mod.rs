pub mod admin;
pub mod serve;

use anyhow::{Context, Result};
use std::sync::Arc;

use gatefleet::config::Config;
use gatefleet::notifications::{AlertManager, LogChannel};
use gatefleet::orchestrator::{Orchestrator, OrchestratorSettings};
use gatefleet::remote::{ClientConfig, HttpConnector};
use gatefleet::storage::Store;

pub use admin::{node_add, node_list, node_retire, stats, tariff_add, tariff_list, user_add, user_role};
pub use serve::{reconcile, serve};

/// Open the SQLite store named by the configuration
pub fn open_store(config: &Config) -> Result<Arc<Store>> {
    let store = Store::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.database.path.display()
        )
    })?;
    Ok(Arc::new(store))
}

/// Bootstrap an orchestrator over HTTP node clients
pub async fn build_orchestrator(config: &Config, store: Arc<Store>) -> Result<Orchestrator> {
    let connector = HttpConnector::new(ClientConfig::from(&config.remote))
        .context("Failed to build node HTTP client")?;

    let orchestrator =
        Orchestrator::bootstrap(store, Arc::new(connector), OrchestratorSettings::from(config))
            .await
            .context("Failed to load fleet state")?;
    Ok(orchestrator)
}

/// Alert manager with the log channel and, when configured, a webhook
pub fn build_alerts(config: &Config) -> Result<AlertManager> {
    let mut alerts = AlertManager::new(config.alert_cooldown());
    alerts.add_channel(Arc::new(LogChannel));

    if let Some(url) = config.alerts.webhook_url.as_deref() {
        alerts
            .add_webhook_channel(url, config.alerts.webhook_token.as_deref())
            .context("Invalid alert webhook configuration")?;
        tracing::info!(url = %url, "Webhook alert channel enabled");
    }

    Ok(alerts)
}

/// Print a value as pretty JSON
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
