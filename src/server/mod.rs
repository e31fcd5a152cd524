//! HTTP front for the chat and admin front ends
//!
//! Exposes the orchestrator operations as JSON routes, plus `/health` and
//! `/metrics`. When `server.api_key` is configured every `/api` route
//! requires a matching `x-api-key` header.

pub mod api;
pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::notifications::AlertManager;
use crate::orchestrator::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub alerts: Arc<AlertManager>,

    /// Expected `x-api-key` value; `None` disables the check
    pub api_key: Option<Arc<str>>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, alerts: Arc<AlertManager>) -> Self {
        Self {
            orchestrator,
            alerts,
            api_key: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<Arc<str>>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// REST server over one orchestrator
pub struct FleetServer {
    addr: SocketAddr,
    state: AppState,
}

impl FleetServer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        alerts: Arc<AlertManager>,
        config: &ServerConfig,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ServerError::Config(format!("invalid bind address '{}': {e}", config.bind_address))
        })?;

        let mut state = AppState::new(orchestrator, alerts);
        if let Some(key) = config.api_key.as_deref() {
            state = state.with_api_key(key);
        }

        Ok(Self { addr, state })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown_signal` completes
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(ServerError::Bind)?;
        tracing::info!(addr = %self.addr, auth = self.state.api_key.is_some(), "Fleet API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(ServerError::Serve)?;

        tracing::info!("Fleet API shutdown complete");
        Ok(())
    }
}

/// Full router: API, health and metrics
pub fn build_router(state: AppState) -> Router {
    api::create_router(state.clone())
        .merge(health::create_health_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
