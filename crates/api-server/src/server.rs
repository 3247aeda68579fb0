//! API server: REST surface over the rule engine plus the Prometheus exporter.

use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use adrules_core::config::AppConfig;
use adrules_engine::RuleEngine;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

pub struct ApiServer {
    config: AppConfig,
    engine: RuleEngine,
}

/// Build the application router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Action log
        .route("/v1/logs", get(rest::list_logs))
        .route("/v1/logs/:id/revert", post(rest::revert_log))
        .route("/v1/logs/reconciliation", get(rest::pending_reconciliation))
        // Passes
        .route("/v1/passes", post(rest::run_pass))
        // Rules
        .route("/v1/rules", get(rest::list_rules).post(rest::create_rule))
        .route(
            "/v1/rules/:id",
            put(rest::update_rule).delete(rest::delete_rule),
        )
        .route("/v1/rules/:id/toggle", post(rest::toggle_rule))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: RuleEngine) -> Self {
        Self { config, engine }
    }

    /// Start the HTTP REST server. Runs until the listener fails.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            operator_token: self.config.api.operator_token.clone(),
        };
        let app = router(state);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Install the global metrics recorder and serve it on the metrics port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
