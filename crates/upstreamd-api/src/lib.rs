//! HTTP surface for the upstreamd control plane.
//!
//! Thin axum handlers over the control components: backends POST their
//! metrics here, operators manage per-server policy, weight factors and pool
//! membership, and dashboards read weights, config and cluster state.

pub mod admin;
pub mod metrics;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::info;

use upstreamd_common::error::{ControlError, Result};
use upstreamd_common::model::WeightFactors;
use upstreamd_control::{
    DriftReconciler, MetricsIngestor, NginxMaterializer, PolicyStore, RecomputeReason,
    ServerRegistry,
};
use upstreamd_store::{MetricsArchive, SharedState};

/// Everything the handlers need, shared behind one `Arc`.
pub struct ApiContext {
    pub ingestor: Arc<MetricsIngestor>,
    pub registry: Arc<ServerRegistry>,
    pub policies: Arc<PolicyStore>,
    pub factors: Arc<RwLock<WeightFactors>>,
    pub shared: Arc<SharedState>,
    pub archive: Arc<MetricsArchive>,
    pub materializer: Arc<NginxMaterializer>,
    pub reconciler: Arc<DriftReconciler>,
    pub recompute_tx: mpsc::Sender<RecomputeReason>,
}

pub struct ApiServer {
    context: Arc<ApiContext>,
}

impl ApiServer {
    pub fn new(context: Arc<ApiContext>) -> Self {
        Self { context }
    }

    pub fn router(context: Arc<ApiContext>) -> Router {
        Router::new()
            // Metric ingestion + dashboards
            .route("/api/metrics/server/{server_id}", post(metrics::submit))
            .route("/api/metrics/server/{server_id}", get(metrics::latest_for_server))
            .route(
                "/api/metrics/server/{server_id}/history",
                get(metrics::history_for_server),
            )
            .route("/api/metrics/latest", get(metrics::latest_all))
            // Load balancer state
            .route("/api/loadbalancer/weights", get(admin::current_weights))
            .route("/api/loadbalancer/config", get(admin::current_config))
            .route("/api/loadbalancer/recalculate", post(admin::force_recalculate))
            .route("/api/loadbalancer/sync", post(admin::force_sync))
            // Per-server policy
            .route("/api/config/servers", get(admin::all_policies))
            .route("/api/config/server/{server_id}", get(admin::get_policy))
            .route("/api/config/server/{server_id}", put(admin::update_policy))
            .route(
                "/api/config/server/{server_id}/fixed-weight",
                post(admin::set_fixed_weight),
            )
            .route(
                "/api/config/server/{server_id}/dynamic-weight",
                post(admin::enable_dynamic_weight),
            )
            .route(
                "/api/config/server/{server_id}/thresholds",
                post(admin::set_thresholds),
            )
            .route(
                "/api/config/server/{server_id}/auto-removal/enable",
                post(admin::enable_auto_removal),
            )
            .route(
                "/api/config/server/{server_id}/auto-removal/disable",
                post(admin::disable_auto_removal),
            )
            .route("/api/config/server/{server_id}/remove", post(admin::remove_server))
            .route(
                "/api/config/server/{server_id}/reenable",
                post(admin::reenable_server),
            )
            .route("/api/config/reset-all", post(admin::reset_all_policies))
            // Weight factors
            .route("/api/weight-factors", get(admin::get_factors))
            .route("/api/weight-factors", put(admin::update_factors))
            .route("/api/weight-factors/normalize", post(admin::normalize_factors))
            .route("/api/weight-factors/reset", post(admin::reset_factors))
            .route("/api/weight-factors/validate", get(admin::validate_factors))
            .route("/api/weight-factors/preset/{name}", post(admin::apply_preset))
            // Pool membership
            .route("/api/servers", get(admin::list_servers))
            .route("/api/servers/{pool}", post(admin::add_server))
            .route("/api/servers/{pool}/{server_id}", delete(admin::delete_server))
            .route(
                "/api/servers/{pool}/{server_id}/toggle",
                post(admin::toggle_server),
            )
            // Cluster visibility
            .route("/api/cluster/instances", get(admin::cluster_instances))
            .route("/api/cluster/state", get(admin::cluster_state))
            .route("/__health", get(health_check))
            .layer(CorsLayer::permissive())
            .with_state(context)
    }

    /// Binds and serves until the shutdown signal fires.
    pub async fn run(self, addr: SocketAddr, shutdown: broadcast::Sender<()>) -> Result<()> {
        let app = Self::router(self.context);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind {addr}: {e}")))?;
        info!(
            addr = %listener
                .local_addr()
                .map_err(|e| ControlError::Config(e.to_string()))?,
            "API server listening"
        );

        let mut rx = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
            })
            .await
            .map_err(|e| ControlError::Config(format!("server error: {e}")))?;
        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Standard mutation envelope.
fn status_ok(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "status": "success",
        "message": message.into(),
    })
}

fn status_error(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "status": "error",
        "message": message.into(),
    })
}
