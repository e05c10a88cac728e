use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-server output of one weight calculation cycle.
///
/// Weights are integers in `[0, 100]`; within a pool the active (`weight >
/// 0`) allocations sum to exactly 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightAllocation {
    pub server_id: String,
    pub address: String,
    pub weight: u32,
    pub health_score: f64,
    pub reason: String,
    pub calculated_at: DateTime<Utc>,
}

impl WeightAllocation {
    pub fn new(
        server_id: impl Into<String>,
        address: impl Into<String>,
        weight: u32,
        health_score: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            address: address.into(),
            weight,
            health_score,
            reason: reason.into(),
            calculated_at: Utc::now(),
        }
    }

    /// Whether this server should receive traffic at all.
    pub fn is_active(&self) -> bool {
        self.weight > 0
    }

    pub fn append_reason(&mut self, extra: &str) {
        self.reason.push_str(extra);
    }
}
