//! Admin endpoints: load-balancer state, per-server policy, weight factors,
//! pool membership and cluster visibility.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use upstreamd_common::model::{
    Pool, PolicyPatch, ServerDescriptor, ServerPolicy, WeightAllocation, WeightFactors,
};
use upstreamd_control::{RecomputeReason, SyncOutcome};

use crate::{status_error, status_ok, ApiContext};

// ----- load balancer state -----

pub async fn current_weights(
    State(context): State<Arc<ApiContext>>,
) -> Json<Vec<WeightAllocation>> {
    Json(context.shared.get_weights().await.unwrap_or_default())
}

pub async fn current_config(
    State(context): State<Arc<ApiContext>>,
) -> Result<String, StatusCode> {
    if let Some(config) = context.materializer.current().await {
        return Ok(config);
    }
    context
        .shared
        .get_proxy_config()
        .await
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn force_recalculate(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    info!("weight recalculation forced via admin surface");
    match context.recompute_tx.try_send(RecomputeReason::Forced) {
        Ok(()) => Json(status_ok("Weight recalculation requested")),
        Err(_) => Json(status_ok("Weight recalculation already pending")),
    }
}

pub async fn force_sync(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let outcome = context.reconciler.sync_once().await;
    let message = match outcome {
        SyncOutcome::UpToDate => "Local config already up to date",
        SyncOutcome::StampOnly => "Local config matched, timestamp advanced",
        SyncOutcome::Applied => "Adopted newer config from shared state",
        SyncOutcome::Failed => "Failed to apply config from shared state",
    };
    match outcome {
        SyncOutcome::Failed => Json(status_error(message)),
        _ => Json(status_ok(message)),
    }
}

// ----- per-server policy -----

pub async fn all_policies(State(context): State<Arc<ApiContext>>) -> Json<Vec<ServerPolicy>> {
    Json(context.policies.all())
}

pub async fn get_policy(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerPolicy>, StatusCode> {
    context
        .policies
        .get(&server_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn update_policy(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Json(patch): Json<PolicyPatch>,
) -> Result<Json<ServerPolicy>, (StatusCode, Json<Value>)> {
    if let Some(weight) = patch.fixed_weight {
        if weight > 100 {
            return Err(bad_request("fixed_weight must be within [0, 100]"));
        }
    }
    Ok(Json(context.policies.update(&server_id, patch).await))
}

#[derive(Deserialize)]
pub struct FixedWeightBody {
    pub weight: u32,
}

pub async fn set_fixed_weight(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Json(body): Json<FixedWeightBody>,
) -> Result<Json<ServerPolicy>, (StatusCode, Json<Value>)> {
    if body.weight > 100 {
        return Err(bad_request("weight must be within [0, 100]"));
    }
    Ok(Json(
        context.policies.set_fixed_weight(&server_id, body.weight).await,
    ))
}

pub async fn enable_dynamic_weight(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Json<ServerPolicy> {
    Json(context.policies.enable_dynamic(&server_id).await)
}

#[derive(Deserialize, Default)]
pub struct ThresholdsBody {
    pub max_response_time_ms: Option<f64>,
    pub max_error_rate_percentage: Option<f64>,
    pub min_success_rate_percentage: Option<f64>,
    pub max_timeout_rate_percentage: Option<f64>,
    pub min_uptime_percentage: Option<f64>,
}

pub async fn set_thresholds(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Json(body): Json<ThresholdsBody>,
) -> Json<ServerPolicy> {
    Json(
        context
            .policies
            .set_thresholds(
                &server_id,
                body.max_response_time_ms,
                body.max_error_rate_percentage,
                body.min_success_rate_percentage,
                body.max_timeout_rate_percentage,
                body.min_uptime_percentage,
            )
            .await,
    )
}

#[derive(Deserialize, Default)]
pub struct AutoRemovalBody {
    pub max_violations: Option<u32>,
}

pub async fn enable_auto_removal(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    body: Option<Json<AutoRemovalBody>>,
) -> Json<ServerPolicy> {
    let max_violations = body.and_then(|Json(body)| body.max_violations);
    Json(
        context
            .policies
            .enable_auto_removal(&server_id, max_violations)
            .await,
    )
}

pub async fn disable_auto_removal(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Json<ServerPolicy> {
    Json(context.policies.disable_auto_removal(&server_id).await)
}

pub async fn remove_server(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Json<ServerPolicy> {
    Json(context.policies.manually_remove(&server_id).await)
}

pub async fn reenable_server(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Json<ServerPolicy> {
    Json(context.policies.reenable(&server_id).await)
}

pub async fn reset_all_policies(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    context.policies.reset_all().await;
    Json(status_ok("All server policies reset to defaults"))
}

// ----- weight factors -----

fn factors_json(factors: &WeightFactors) -> Value {
    json!({
        "responseTime": factors.response_time,
        "errorRate": factors.error_rate,
        "timeoutRate": factors.timeout_rate,
        "uptime": factors.uptime,
        "degradation": factors.degradation,
        "sum": factors.sum(),
        "isValid": factors.is_valid(),
    })
}

pub async fn get_factors(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let factors = *context.factors.read().unwrap();
    Json(factors_json(&factors))
}

#[derive(Deserialize, Default)]
pub struct FactorsPatch {
    pub response_time: Option<f64>,
    pub error_rate: Option<f64>,
    pub timeout_rate: Option<f64>,
    pub uptime: Option<f64>,
    pub degradation: Option<f64>,
}

pub async fn update_factors(
    State(context): State<Arc<ApiContext>>,
    Json(patch): Json<FactorsPatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    for value in [
        patch.response_time,
        patch.error_rate,
        patch.timeout_rate,
        patch.uptime,
        patch.degradation,
    ]
    .into_iter()
    .flatten()
    {
        if !(0.0..=1.0).contains(&value) {
            return Err(bad_request("factor values must be within [0, 1]"));
        }
    }

    let (old, new) = {
        let mut factors = context.factors.write().unwrap();
        let old = *factors;
        if let Some(v) = patch.response_time {
            factors.response_time = v;
        }
        if let Some(v) = patch.error_rate {
            factors.error_rate = v;
        }
        if let Some(v) = patch.timeout_rate {
            factors.timeout_rate = v;
        }
        if let Some(v) = patch.uptime {
            factors.uptime = v;
        }
        if let Some(v) = patch.degradation {
            factors.degradation = v;
        }
        (old, *factors)
    };

    let status = if new.is_valid() { "success" } else { "warning" };
    let message = if new.is_valid() {
        "Weight factors updated successfully".to_string()
    } else {
        format!(
            "Warning: weight factors sum to {:.4} instead of 1.0",
            new.sum()
        )
    };
    info!(old_sum = old.sum(), new_sum = new.sum(), "weight factors updated");
    Ok(Json(json!({
        "status": status,
        "message": message,
        "oldFactors": factors_json(&old),
        "newFactors": factors_json(&new),
    })))
}

pub async fn normalize_factors(
    State(context): State<Arc<ApiContext>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (old_sum, new) = {
        let mut factors = context.factors.write().unwrap();
        let old_sum = factors.sum();
        if !factors.normalize() {
            return Err(bad_request("cannot normalize: all factors are zero"));
        }
        (old_sum, *factors)
    };
    info!(old_sum, "weight factors normalized");
    Ok(Json(json!({
        "status": "success",
        "message": "Weight factors normalized to sum to 1.0",
        "oldSum": old_sum,
        "newFactors": factors_json(&new),
    })))
}

pub async fn reset_factors(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let new = {
        let mut factors = context.factors.write().unwrap();
        *factors = WeightFactors::default();
        *factors
    };
    info!("weight factors reset to defaults");
    Json(json!({
        "status": "success",
        "message": "Weight factors reset to default values",
        "factors": factors_json(&new),
    }))
}

pub async fn validate_factors(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let factors = *context.factors.read().unwrap();
    let message = if factors.is_valid() {
        "Weight factors are valid".to_string()
    } else {
        format!(
            "Weight factors sum to {:.4} (expected 1.0 \u{00b1} 0.01)",
            factors.sum()
        )
    };
    Json(json!({
        "isValid": factors.is_valid(),
        "sum": factors.sum(),
        "expectedSum": 1.0,
        "message": message,
        "factors": factors_json(&factors),
    }))
}

pub async fn apply_preset(
    State(context): State<Arc<ApiContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(preset) = WeightFactors::preset(&name) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(status_error(format!("unknown preset: {name}"))),
        ));
    };
    {
        let mut factors = context.factors.write().unwrap();
        *factors = preset;
    }
    info!(preset = name, "weight factor preset applied");
    Ok(Json(json!({
        "status": "success",
        "message": format!("Applied preset: {name}"),
        "factors": factors_json(&preset),
    })))
}

// ----- pool membership -----

pub async fn list_servers(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let (incoming, outgoing) = context.registry.snapshot();
    Json(json!({
        "incoming": incoming,
        "outgoing": outgoing,
    }))
}

fn parse_pool(pool: &str) -> Result<Pool, (StatusCode, Json<Value>)> {
    pool.parse::<Pool>().map_err(|e| bad_request(e))
}

pub async fn add_server(
    State(context): State<Arc<ApiContext>>,
    Path(pool): Path<String>,
    Json(server): Json<ServerDescriptor>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let pool = parse_pool(&pool)?;
    if server.id.is_empty() {
        return Err(bad_request("server id must not be empty"));
    }
    if context.registry.add(pool, server.clone()) {
        info!(server_id = %server.id, %pool, "server added");
        Ok((
            StatusCode::CREATED,
            Json(status_ok(format!("Server {} added to {pool}", server.id))),
        ))
    } else {
        Err(bad_request(format!(
            "server {} already exists or is invalid",
            server.id
        )))
    }
}

pub async fn delete_server(
    State(context): State<Arc<ApiContext>>,
    Path((pool, server_id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pool = parse_pool(&pool)?;
    if context.registry.remove(pool, &server_id) {
        info!(server_id, %pool, "server removed");
        Ok(Json(status_ok(format!(
            "Server {server_id} removed from {pool}"
        ))))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(status_error(format!("server {server_id} not found in {pool}"))),
        ))
    }
}

pub async fn toggle_server(
    State(context): State<Arc<ApiContext>>,
    Path((pool, server_id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pool = parse_pool(&pool)?;
    match context.registry.toggle(pool, &server_id) {
        Some(enabled) => {
            info!(server_id, %pool, enabled, "server toggled");
            Ok(Json(json!({
                "status": "success",
                "serverId": server_id,
                "enabled": enabled,
            })))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(status_error(format!("server {server_id} not found in {pool}"))),
        )),
    }
}

// ----- cluster visibility -----

pub async fn cluster_instances(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let instances = context.shared.active_instances().await;
    Json(json!({
        "instanceId": context.shared.instance_id(),
        "activeInstances": instances,
    }))
}

pub async fn cluster_state(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    Json(json!({
        "instanceId": context.shared.instance_id(),
        "storeHealthy": context.shared.is_healthy().await,
        "activeInstances": context.shared.active_instances().await,
        "lastWeightUpdate": context.shared.last_weight_update().await,
        "lastProxyUpdate": context.shared.last_proxy_update().await,
        "localConfigApplied": context.materializer.last_applied().await,
        "configuredServers": context.registry.count(),
    }))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(status_error(message)))
}
