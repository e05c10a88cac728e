//! Metric submission and read endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use upstreamd_common::error::ControlError;
use upstreamd_common::model::MetricSample;
use upstreamd_control::IngestOutcome;

use crate::{status_error, ApiContext};

/// `POST /api/metrics/server/{server_id}`: the inbound metric contract.
pub async fn submit(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Json(sample): Json<MetricSample>,
) -> (StatusCode, Json<Value>) {
    info!(server_id, "received metrics");
    match context.ingestor.ingest(&server_id, sample).await {
        Ok(IngestOutcome::Accepted {
            instant_latency,
            ewma_latency,
        }) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "Metrics received and processed",
                "serverId": server_id,
                "timestamp": Utc::now(),
                "instantLatency": instant_latency,
                "ewmaLatency": ewma_latency,
            })),
        ),
        Ok(IngestOutcome::UnknownServer) => (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "message": "Metrics received for unknown server",
                "serverId": server_id,
                "timestamp": Utc::now(),
            })),
        ),
        Err(ControlError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": format!("Failed to process metrics: {message}"),
                "serverId": server_id,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(status_error(format!("Failed to process metrics: {e}"))),
        ),
    }
}

/// `GET /api/metrics/latest`: newest sample per server.
pub async fn latest_all(State(context): State<Arc<ApiContext>>) -> Json<Vec<MetricSample>> {
    let mut hot = context.shared.all_metrics().await;
    if hot.is_empty() {
        hot = context.archive.latest_per_server().unwrap_or_default();
    }
    let mut samples: Vec<MetricSample> = hot.into_values().collect();
    samples.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    Json(samples)
}

/// `GET /api/metrics/server/{server_id}`: newest sample for one server.
pub async fn latest_for_server(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Result<Json<MetricSample>, StatusCode> {
    let sample = match context.shared.get_metric(&server_id).await {
        Some(sample) => Some(sample),
        None => context.archive.latest(&server_id).ok().flatten(),
    };
    sample.map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

/// `GET /api/metrics/server/{server_id}/history`: archived samples, newest
/// first.
pub async fn history_for_server(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MetricSample>>, (StatusCode, Json<Value>)> {
    context
        .archive
        .history(&server_id, query.limit)
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(status_error(e.to_string())),
            )
        })
}
