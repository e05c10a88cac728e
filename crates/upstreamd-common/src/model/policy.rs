use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::MetricSample;

/// Per-server policy record: weight pinning, health thresholds and removal
/// state.
///
/// Invariants: pinning a fixed weight disables dynamic weighting; enabling
/// dynamic weighting clears the fixed weight; re-enabling a removed server
/// resets its violation counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPolicy {
    pub server_id: String,

    pub dynamic_weight_enabled: bool,
    pub fixed_weight: Option<u32>,

    pub max_response_time_ms: Option<f64>,
    pub max_error_rate_percentage: Option<f64>,
    pub min_success_rate_percentage: Option<f64>,
    pub max_timeout_rate_percentage: Option<f64>,
    pub min_uptime_percentage: Option<f64>,

    pub violations_count: u32,
    pub max_violations_before_removal: u32,
    pub auto_removal_enabled: bool,
    pub manually_removed: bool,
    pub last_violation_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerPolicy {
    pub fn new(server_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            server_id: server_id.into(),
            dynamic_weight_enabled: true,
            fixed_weight: None,
            max_response_time_ms: None,
            max_error_rate_percentage: None,
            min_success_rate_percentage: None,
            max_timeout_rate_percentage: None,
            min_uptime_percentage: None,
            violations_count: 0,
            max_violations_before_removal: 3,
            auto_removal_enabled: false,
            manually_removed: false,
            last_violation_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the sample violates any configured threshold.
    ///
    /// Only evaluated while auto-removal is enabled. The response-time check
    /// uses the effective (EWMA-preferred) latency.
    pub fn violates_thresholds(&self, sample: &MetricSample) -> bool {
        if !self.auto_removal_enabled {
            return false;
        }
        let mut violated = false;
        if let (Some(limit), Some(latency)) = (self.max_response_time_ms, sample.effective_latency())
        {
            violated |= latency > limit;
        }
        if let (Some(limit), Some(rate)) =
            (self.max_error_rate_percentage, sample.error_rate_percentage)
        {
            violated |= rate > limit;
        }
        if let (Some(limit), Some(rate)) = (
            self.min_success_rate_percentage,
            sample.success_rate_percentage,
        ) {
            violated |= rate < limit;
        }
        if let (Some(limit), Some(rate)) = (
            self.max_timeout_rate_percentage,
            sample.timeout_rate_percentage,
        ) {
            violated |= rate > limit;
        }
        if let (Some(limit), Some(uptime)) = (self.min_uptime_percentage, sample.uptime_percentage)
        {
            violated |= uptime < limit;
        }
        violated
    }

    /// Human-readable list of the thresholds the sample currently breaks.
    pub fn violation_details(&self, sample: &MetricSample) -> String {
        let mut details = String::new();
        if let (Some(limit), Some(latency)) = (self.max_response_time_ms, sample.effective_latency())
        {
            if latency > limit {
                details.push_str(&format!(
                    "Response time {latency:.2}ms exceeds max {limit:.2}ms; "
                ));
            }
        }
        if let (Some(limit), Some(rate)) =
            (self.max_error_rate_percentage, sample.error_rate_percentage)
        {
            if rate > limit {
                details.push_str(&format!("Error rate {rate:.2}% exceeds max {limit:.2}%; "));
            }
        }
        if let (Some(limit), Some(rate)) = (
            self.min_success_rate_percentage,
            sample.success_rate_percentage,
        ) {
            if rate < limit {
                details.push_str(&format!("Success rate {rate:.2}% below min {limit:.2}%; "));
            }
        }
        if let (Some(limit), Some(rate)) = (
            self.max_timeout_rate_percentage,
            sample.timeout_rate_percentage,
        ) {
            if rate > limit {
                details.push_str(&format!("Timeout rate {rate:.2}% exceeds max {limit:.2}%; "));
            }
        }
        if let (Some(limit), Some(uptime)) = (self.min_uptime_percentage, sample.uptime_percentage)
        {
            if uptime < limit {
                details.push_str(&format!("Uptime {uptime:.2}% below min {limit:.2}%; "));
            }
        }
        details
    }

    pub fn record_violation(&mut self) {
        self.violations_count += 1;
        self.last_violation_at = Some(Utc::now());
        self.touch();
    }

    pub fn reset_violations(&mut self) {
        self.violations_count = 0;
        self.last_violation_at = None;
        self.touch();
    }

    pub fn should_be_removed(&self) -> bool {
        self.auto_removal_enabled && self.violations_count >= self.max_violations_before_removal
    }

    /// The weight this server actually gets, given the engine's calculation.
    pub fn effective_weight(&self, calculated: u32) -> u32 {
        if self.manually_removed {
            return 0;
        }
        if !self.dynamic_weight_enabled {
            if let Some(fixed) = self.fixed_weight {
                return fixed;
            }
        }
        calculated
    }
}

/// Partial update applied through the admin surface; absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyPatch {
    pub dynamic_weight_enabled: Option<bool>,
    pub fixed_weight: Option<u32>,
    pub max_response_time_ms: Option<f64>,
    pub max_error_rate_percentage: Option<f64>,
    pub min_success_rate_percentage: Option<f64>,
    pub max_timeout_rate_percentage: Option<f64>,
    pub min_uptime_percentage: Option<f64>,
    pub max_violations_before_removal: Option<u32>,
    pub auto_removal_enabled: Option<bool>,
}
