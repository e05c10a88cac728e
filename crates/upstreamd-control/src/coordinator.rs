//! The per-cycle leader.
//!
//! One instance per cycle wins the `weight-calculation` lock and becomes the
//! writer: it gathers the freshest sample per server, runs the engine over
//! each pool, publishes the combined allocations and materializes the proxy
//! config. Everyone else skips the cycle and converges through the drift
//! reconciler. The lock TTL bounds the damage of a leader crashing
//! mid-cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use upstreamd_common::model::{MetricSample, Pool, WeightAllocation};
use upstreamd_store::{MetricsArchive, SharedState};

use crate::engine::WeightEngine;

const WEIGHT_LOCK: &str = "weight-calculation";
const LOCK_TTL: Duration = Duration::from_secs(30);

/// Samples older than this are excluded from a cycle.
const FRESHNESS_WINDOW_SECS: i64 = 300;

type CycleResult = (
    CycleOutcome,
    Option<(Vec<WeightAllocation>, Vec<WeightAllocation>)>,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another instance holds the lock and is authoritative this cycle.
    NotLeader,
    /// No samples were available anywhere.
    NoMetrics,
    /// Samples exist but all fell outside the freshness window.
    AllStale,
    /// Weights were computed and published.
    Published {
        incoming: usize,
        outgoing: usize,
    },
}

pub struct Coordinator {
    engine: Arc<WeightEngine>,
    shared: Arc<SharedState>,
    archive: Arc<MetricsArchive>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<WeightEngine>,
        shared: Arc<SharedState>,
        archive: Arc<MetricsArchive>,
    ) -> Self {
        Self {
            engine,
            shared,
            archive,
        }
    }

    /// Runs one full calculation cycle. The lock is released on every exit
    /// path, including publish failures.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.shared.try_lock(WEIGHT_LOCK, LOCK_TTL).await {
            debug!("another instance is calculating weights, skipping cycle");
            return CycleOutcome::NotLeader;
        }

        let (outcome, _) = self.locked_cycle().await;
        self.shared.release_lock(WEIGHT_LOCK).await;
        outcome
    }

    /// Runs a cycle and, when it published weights, materializes the proxy
    /// config while still holding the lock.
    pub async fn run_cycle_and_materialize(
        &self,
        materializer: &crate::nginx::NginxMaterializer,
    ) -> CycleOutcome {
        if !self.shared.try_lock(WEIGHT_LOCK, LOCK_TTL).await {
            debug!("another instance is calculating weights, skipping cycle");
            return CycleOutcome::NotLeader;
        }

        let (outcome, pools) = self.locked_cycle().await;
        if let Some((incoming, outgoing)) = pools {
            if let Err(e) = materializer.publish(&incoming, &outgoing).await {
                warn!(error = %e, "failed to materialize proxy config this cycle");
            }
        }
        self.shared.release_lock(WEIGHT_LOCK).await;
        outcome
    }

    async fn locked_cycle(&self) -> CycleResult {
        let latest = self.gather_latest_metrics().await;
        if latest.is_empty() {
            warn!("no metrics available for weight calculation");
            return (CycleOutcome::NoMetrics, None);
        }

        let now = Utc::now();
        let fresh: Vec<MetricSample> = latest
            .values()
            .filter(|m| m.is_fresh(now, FRESHNESS_WINDOW_SECS))
            .cloned()
            .collect();
        if fresh.is_empty() {
            warn!(total = latest.len(), "all metrics are stale, skipping cycle");
            return (CycleOutcome::AllStale, None);
        }
        if fresh.len() < latest.len() {
            warn!(
                fresh = fresh.len(),
                total = latest.len(),
                "some servers have stale metrics"
            );
        }

        let incoming = self.engine.compute(Pool::Incoming, &fresh);
        let outgoing = self.engine.compute(Pool::Outgoing, &fresh);
        info!(
            incoming = incoming.len(),
            outgoing = outgoing.len(),
            "calculated dual upstream weights"
        );

        // Weights publish first; the proxy-config publish that follows is
        // its match. Readers treat a newer config stamp as the sync signal.
        let combined: Vec<WeightAllocation> = incoming
            .iter()
            .chain(outgoing.iter())
            .cloned()
            .collect();
        self.shared.put_weights(&combined).await;

        let outcome = CycleOutcome::Published {
            incoming: incoming.len(),
            outgoing: outgoing.len(),
        };
        (outcome, Some((incoming, outgoing)))
    }

    /// The freshest sample per server: hot store first, archive when the
    /// hot store is empty.
    async fn gather_latest_metrics(&self) -> HashMap<String, MetricSample> {
        let hot = self.shared.all_metrics().await;
        if !hot.is_empty() {
            debug!(count = hot.len(), "using hot-store metrics");
            return hot;
        }
        match self.archive.latest_per_server() {
            Ok(cold) => {
                if !cold.is_empty() {
                    debug!(count = cold.len(), "hot store empty, using archived metrics");
                }
                cold
            }
            Err(e) => {
                warn!(error = %e, "failed to read archived metrics");
                HashMap::new()
            }
        }
    }
}
