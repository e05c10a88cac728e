//! Metric ingestion.
//!
//! One accepted sample flows through validation, EWMA smoothing against the
//! prior sample, persistence to both stores and threshold evaluation. When
//! at least 80% of the configured fleet has reported within the last two
//! minutes, the ingestor signals the coordinator to run a cycle immediately
//! instead of waiting for the periodic tick.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use upstreamd_common::error::{ControlError, Result};
use upstreamd_common::model::MetricSample;
use upstreamd_store::{MetricsArchive, SharedState};

use crate::policy::PolicyStore;
use crate::registry::ServerRegistry;

/// Fraction of the fleet that must have fresh samples to trigger an early
/// recompute.
const QUORUM_FRACTION: f64 = 0.8;

/// Samples newer than this count toward the quorum.
const QUORUM_FRESHNESS_SECS: i64 = 120;

/// Why the coordinator is being asked to run a cycle outside its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeReason {
    /// Enough of the fleet has reported fresh metrics.
    QuorumFresh,
    /// An operator forced a recalculation through the admin surface.
    Forced,
}

/// What happened to an inbound sample.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted {
        instant_latency: Option<f64>,
        ewma_latency: Option<f64>,
    },
    /// The server is not configured in either pool; the sample is dropped.
    UnknownServer,
}

pub struct MetricsIngestor {
    registry: Arc<ServerRegistry>,
    policies: Arc<PolicyStore>,
    shared: Arc<SharedState>,
    archive: Arc<MetricsArchive>,
    ewma_alpha: f64,
    recompute_tx: mpsc::Sender<RecomputeReason>,
}

impl MetricsIngestor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        policies: Arc<PolicyStore>,
        shared: Arc<SharedState>,
        archive: Arc<MetricsArchive>,
        ewma_alpha: f64,
        recompute_tx: mpsc::Sender<RecomputeReason>,
    ) -> Self {
        Self {
            registry,
            policies,
            shared,
            archive,
            ewma_alpha,
            recompute_tx,
        }
    }

    /// Processes one inbound sample for `server_id`.
    ///
    /// Range violations reject the sample with a validation error; an
    /// unknown server is dropped with a warning but no error, since
    /// misconfigured reporters should not see hard failures.
    pub async fn ingest(&self, server_id: &str, mut sample: MetricSample) -> Result<IngestOutcome> {
        if !self.registry.contains(server_id) {
            warn!(server_id, "metrics received for unknown server");
            return Ok(IngestOutcome::UnknownServer);
        }

        sample.validate().map_err(ControlError::Validation)?;

        if !sample.server_id.is_empty() && sample.server_id != server_id {
            warn!(
                url_id = server_id,
                body_id = %sample.server_id,
                "server id mismatch, trusting the URL"
            );
        }
        sample.server_id = server_id.to_string();
        sample.created_at = Some(Utc::now());

        let previous_ewma = self.previous_ewma(server_id).await;
        sample.apply_ewma(previous_ewma, self.ewma_alpha);
        sample.degradation_score = Some(sample.compute_degradation());

        debug!(
            server_id,
            instant = ?sample.avg_response_time_ms,
            ewma = ?sample.ewma_latency_ms,
            previous = ?previous_ewma,
            "sample smoothed"
        );

        // Durable first, hot second; either store failing alone must not
        // block the other.
        if let Err(e) = self.archive.append(&sample) {
            warn!(server_id, error = %e, "failed to archive sample");
        }
        self.shared.put_metric(server_id, &sample).await;

        self.policies.evaluate_thresholds(server_id, &sample).await;

        self.maybe_trigger_recompute().await;

        Ok(IngestOutcome::Accepted {
            instant_latency: sample.avg_response_time_ms,
            ewma_latency: sample.ewma_latency_ms,
        })
    }

    /// The EWMA seed: the latest sample's smoothed latency, preferring the
    /// hot store and falling back to the archive.
    async fn previous_ewma(&self, server_id: &str) -> Option<f64> {
        if let Some(previous) = self.shared.get_metric(server_id).await {
            return previous.ewma_latency_ms;
        }
        match self.archive.latest(server_id) {
            Ok(previous) => previous.and_then(|p| p.ewma_latency_ms),
            Err(e) => {
                warn!(server_id, error = %e, "failed to read archive for EWMA seed");
                None
            }
        }
    }

    /// Signals the coordinator when enough of the fleet has reported
    /// recently. Quorum is checked against every configured server across
    /// both pools.
    async fn maybe_trigger_recompute(&self) {
        let server_ids = self.registry.server_ids();
        if server_ids.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut fresh = 0usize;
        for server_id in &server_ids {
            let sample = match self.shared.get_metric(server_id).await {
                Some(sample) => Some(sample),
                None => self.archive.latest(server_id).ok().flatten(),
            };
            if let Some(sample) = sample {
                if sample.is_fresh(now, QUORUM_FRESHNESS_SECS) {
                    fresh += 1;
                }
            }
        }

        let quorum = (server_ids.len() as f64 * QUORUM_FRACTION).ceil() as usize;
        if fresh >= quorum {
            debug!(fresh, total = server_ids.len(), "metrics quorum reached");
            // A full channel means a recompute is already pending.
            let _ = self.recompute_tx.try_send(RecomputeReason::QuorumFresh);
        }
    }
}
