//! Handler-level tests over an in-memory backed context.

use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use upstreamd_api::{admin, metrics, ApiContext};
use upstreamd_common::config::{KeyLayout, NginxSettings, TtlSettings};
use upstreamd_common::model::{MetricSample, ServerDescriptor, WeightFactors};
use upstreamd_control::{
    Coordinator, DriftReconciler, MetricsIngestor, NginxMaterializer, PolicyStore, RecomputeReason,
    ServerRegistry, WeightEngine,
};
use upstreamd_store::{MemoryStore, MetricsArchive, SharedState};

struct Fixture {
    context: Arc<ApiContext>,
    coordinator: Arc<Coordinator>,
    recompute_rx: mpsc::Receiver<RecomputeReason>,
    _dirs: (TempDir, TempDir),
}

fn fixture() -> Fixture {
    let archive_dir = TempDir::new().unwrap();
    let config_dir = TempDir::new().unwrap();

    let shared = Arc::new(SharedState::new(
        Arc::new(MemoryStore::new()),
        KeyLayout::default(),
        TtlSettings::default(),
        "api-test",
    ));
    let registry = Arc::new(ServerRegistry::new(
        vec![ServerDescriptor::new("in1", "in1.example.com")],
        vec![
            ServerDescriptor::new("out1", "out1.example.com"),
            ServerDescriptor::new("out2", "out2.example.com"),
        ],
    ));
    let policies = Arc::new(PolicyStore::new(shared.clone()));
    let factors = Arc::new(RwLock::new(WeightFactors::default()));
    let archive = Arc::new(MetricsArchive::open(archive_dir.path()).unwrap());
    let (recompute_tx, recompute_rx) = mpsc::channel(4);

    let ingestor = Arc::new(MetricsIngestor::new(
        registry.clone(),
        policies.clone(),
        shared.clone(),
        archive.clone(),
        0.3,
        recompute_tx.clone(),
    ));
    let engine = Arc::new(WeightEngine::new(
        registry.clone(),
        policies.clone(),
        factors.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(engine, shared.clone(), archive.clone()));
    let settings = NginxSettings {
        config_dir: config_dir.path().to_str().unwrap().to_string(),
        config_file: "upstream.conf".to_string(),
        reload_command: "true".to_string(),
        backup_enabled: false,
    };
    let materializer = Arc::new(NginxMaterializer::new(settings, shared.clone()));
    let reconciler = Arc::new(DriftReconciler::new(shared.clone(), materializer.clone()));

    let context = Arc::new(ApiContext {
        ingestor,
        registry,
        policies,
        factors,
        shared,
        archive,
        materializer,
        reconciler,
        recompute_tx,
    });
    Fixture {
        context,
        coordinator,
        recompute_rx,
        _dirs: (archive_dir, config_dir),
    }
}

fn healthy_body(server_id: &str) -> MetricSample {
    let mut sample = MetricSample::new(server_id);
    sample.avg_response_time_ms = Some(150.0);
    sample.error_rate_percentage = Some(0.5);
    sample.success_rate_percentage = Some(99.5);
    sample.timeout_rate_percentage = Some(0.1);
    sample.uptime_percentage = Some(99.9);
    sample
}

#[tokio::test]
async fn test_submit_metrics_success_envelope() {
    let fixture = fixture();
    let (status, Json(body)) = metrics::submit(
        State(fixture.context.clone()),
        Path("out1".to_string()),
        Json(healthy_body("out1")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["serverId"], "out1");
    assert_eq!(body["instantLatency"], 150.0);
    assert_eq!(body["ewmaLatency"], 150.0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_submit_metrics_validation_error() {
    let fixture = fixture();
    let mut bad = healthy_body("out1");
    bad.uptime_percentage = Some(250.0);
    let (status, Json(body)) = metrics::submit(
        State(fixture.context.clone()),
        Path("out1".to_string()),
        Json(bad),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_submit_metrics_unknown_server_is_ignored() {
    let fixture = fixture();
    let (status, Json(body)) = metrics::submit(
        State(fixture.context.clone()),
        Path("ghost".to_string()),
        Json(healthy_body("ghost")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn test_latest_metrics_after_submissions() {
    let fixture = fixture();
    for id in ["out1", "out2"] {
        metrics::submit(
            State(fixture.context.clone()),
            Path(id.to_string()),
            Json(healthy_body(id)),
        )
        .await;
    }
    let Json(samples) = metrics::latest_all(State(fixture.context.clone())).await;
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].server_id, "out1");
    assert_eq!(samples[1].server_id, "out2");
}

#[tokio::test]
async fn test_weights_visible_after_cycle() {
    let mut fixture = fixture();
    for id in ["in1", "out1", "out2"] {
        metrics::submit(
            State(fixture.context.clone()),
            Path(id.to_string()),
            Json(healthy_body(id)),
        )
        .await;
    }
    // All three servers fresh triggers the quorum signal.
    assert!(fixture.recompute_rx.try_recv().is_ok());

    fixture
        .coordinator
        .run_cycle_and_materialize(&fixture.context.materializer)
        .await;

    let Json(weights) = admin::current_weights(State(fixture.context.clone())).await;
    assert_eq!(weights.len(), 3);
    let total: u32 = weights
        .iter()
        .filter(|w| w.server_id.starts_with("out"))
        .map(|w| w.weight)
        .sum();
    assert_eq!(total, 100);

    let config = admin::current_config(State(fixture.context.clone()))
        .await
        .unwrap();
    assert!(config.contains("upstream upstream_incoming"));
    assert!(config.contains("upstream upstream_outgoing"));
}

#[tokio::test]
async fn test_fixed_weight_roundtrip() {
    let fixture = fixture();
    let result = admin::set_fixed_weight(
        State(fixture.context.clone()),
        Path("out1".to_string()),
        Json(admin::FixedWeightBody { weight: 70 }),
    )
    .await
    .unwrap();
    assert_eq!(result.0.fixed_weight, Some(70));
    assert!(!result.0.dynamic_weight_enabled);

    // Out-of-range pins are rejected.
    let error = admin::set_fixed_weight(
        State(fixture.context.clone()),
        Path("out1".to_string()),
        Json(admin::FixedWeightBody { weight: 150 }),
    )
    .await;
    assert!(error.is_err());
}

#[tokio::test]
async fn test_factor_preset_and_validation() {
    let fixture = fixture();
    let Json(result) = admin::apply_preset(
        State(fixture.context.clone()),
        Path("performance".to_string()),
    )
    .await
    .unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(
        *fixture.context.factors.read().unwrap(),
        WeightFactors::PERFORMANCE
    );

    let error = admin::apply_preset(
        State(fixture.context.clone()),
        Path("turbo".to_string()),
    )
    .await;
    assert!(error.is_err());

    let Json(validation) = admin::validate_factors(State(fixture.context.clone())).await;
    assert_eq!(validation["isValid"], true);
}

#[tokio::test]
async fn test_update_factors_warns_on_invalid_sum() {
    let fixture = fixture();
    let Json(result) = admin::update_factors(
        State(fixture.context.clone()),
        Json(admin::FactorsPatch {
            response_time: Some(0.9),
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    assert_eq!(result["status"], "warning");

    let Json(normalized) = admin::normalize_factors(State(fixture.context.clone()))
        .await
        .unwrap();
    assert_eq!(normalized["status"], "success");
    assert!(fixture.context.factors.read().unwrap().is_valid());
}

#[tokio::test]
async fn test_server_membership_lifecycle() {
    let fixture = fixture();

    let added = admin::add_server(
        State(fixture.context.clone()),
        Path("outgoing".to_string()),
        Json(ServerDescriptor::new("out3", "out3.example.com")),
    )
    .await
    .unwrap();
    assert_eq!(added.0, StatusCode::CREATED);

    // A duplicate id is rejected.
    assert!(admin::add_server(
        State(fixture.context.clone()),
        Path("incoming".to_string()),
        Json(ServerDescriptor::new("out3", "elsewhere.example.com")),
    )
    .await
    .is_err());

    let Json(toggled) = admin::toggle_server(
        State(fixture.context.clone()),
        Path(("outgoing".to_string(), "out3".to_string())),
    )
    .await
    .unwrap();
    assert_eq!(toggled["enabled"], false);

    admin::delete_server(
        State(fixture.context.clone()),
        Path(("outgoing".to_string(), "out3".to_string())),
    )
    .await
    .unwrap();
    assert!(!fixture.context.registry.contains("out3"));

    // Unknown pool name is a 400.
    assert!(admin::add_server(
        State(fixture.context.clone()),
        Path("sideways".to_string()),
        Json(ServerDescriptor::new("x", "x.example.com")),
    )
    .await
    .is_err());
}

#[tokio::test]
async fn test_cluster_state_reports_membership() {
    let fixture = fixture();
    fixture.context.shared.heartbeat().await;

    let Json(state) = admin::cluster_state(State(fixture.context.clone())).await;
    assert_eq!(state["instanceId"], "api-test");
    assert_eq!(state["storeHealthy"], true);
    assert_eq!(state["configuredServers"], 3);
    assert_eq!(state["activeInstances"][0], "api-test");
}

#[tokio::test]
async fn test_force_recalculate_signals_coordinator() {
    let mut fixture = fixture();
    let Json(body) = admin::force_recalculate(State(fixture.context.clone())).await;
    assert_eq!(body["status"], "success");
    assert_eq!(
        fixture.recompute_rx.try_recv().unwrap(),
        RecomputeReason::Forced
    );
}
