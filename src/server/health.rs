//! Health and metrics endpoints
//!
//! - `/health/live` always answers 200 while the process runs
//! - `/health` reports fleet reachability and ledger access
//! - `/metrics` serves the Prometheus text exposition

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::time::Instant;

use super::AppState;
use crate::metrics;

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Keep the worse of two statuses
    fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

/// Comprehensive health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

/// Create health check router
pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn liveness_probe() -> impl IntoResponse {
    let response = LivenessResponse {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = Vec::new();
    let mut overall = HealthStatus::Healthy;

    // Ledger
    let started = Instant::now();
    let ledger = state.orchestrator.store().count_active();
    let latency = started.elapsed().as_millis() as u64;
    let ledger_check = match ledger {
        Ok(count) => ComponentHealth {
            name: "ledger".to_string(),
            status: HealthStatus::Healthy,
            message: Some(format!("{count} active credentials")),
            latency_ms: Some(latency),
        },
        Err(e) => ComponentHealth {
            name: "ledger".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.category().as_str().to_string()),
            latency_ms: Some(latency),
        },
    };
    overall = overall.worst(ledger_check.status);
    checks.push(ledger_check);

    // Fleet
    let stats = state.orchestrator.registry().stats().await;
    let fleet_status = if stats.reachable_nodes == 0 || stats.reachable_nodes < stats.active_nodes {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    overall = overall.worst(fleet_status);
    checks.push(ComponentHealth {
        name: "fleet".to_string(),
        status: fleet_status,
        message: Some(format!(
            "{}/{} active nodes reachable",
            stats.reachable_nodes, stats.active_nodes
        )),
        latency_ms: None,
    });

    // Alerts
    let firing = state.alerts.active_alerts().len();
    let alert_status = if firing == 0 {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    overall = overall.worst(alert_status);
    checks.push(ComponentHealth {
        name: "alerts".to_string(),
        status: alert_status,
        message: Some(format!("{firing} firing")),
        latency_ms: None,
    });

    let response = HealthResponse {
        status: overall,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };

    (overall.status_code(), Json(response))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_codes() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Degraded.status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_worst_status() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.worst(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Healthy),
            HealthStatus::Healthy
        );
        assert_eq!(HealthStatus::Unhealthy.as_str(), "unhealthy");
    }
}
