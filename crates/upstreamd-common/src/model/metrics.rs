use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default smoothing factor for the latency EWMA.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// One health/performance observation self-reported by a backend server.
///
/// Field names match the wire format used by backends when POSTing to
/// `/api/metrics/server/{id}`. Two fields are derived on ingest rather than
/// supplied: `ewma_latency_ms` (smoothed latency) and `degradation_score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default)]
    pub server_id: String,

    /// Instantaneous average latency over the reporting window.
    #[serde(default)]
    pub avg_response_time_ms: Option<f64>,

    /// Smoothed latency, recomputed on every ingest from the prior sample.
    #[serde(default)]
    pub ewma_latency_ms: Option<f64>,

    #[serde(default)]
    pub error_rate_percentage: Option<f64>,

    #[serde(default)]
    pub success_rate_percentage: Option<f64>,

    #[serde(default)]
    pub timeout_rate_percentage: Option<f64>,

    #[serde(default)]
    pub uptime_percentage: Option<f64>,

    #[serde(default)]
    pub latency_p50: Option<i64>,

    #[serde(default)]
    pub latency_p95: Option<i64>,

    #[serde(default)]
    pub latency_p99: Option<i64>,

    #[serde(default)]
    pub requests_per_minute: Option<i64>,

    /// Epoch seconds of the reporting window, as stamped by the source.
    #[serde(default)]
    pub window_timestamp: Option<i64>,

    /// Assigned by the ingestor when the sample is accepted.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub degradation_score: Option<f64>,
}

impl MetricSample {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            avg_response_time_ms: None,
            ewma_latency_ms: None,
            error_rate_percentage: None,
            success_rate_percentage: None,
            timeout_rate_percentage: None,
            uptime_percentage: None,
            latency_p50: None,
            latency_p95: None,
            latency_p99: None,
            requests_per_minute: None,
            window_timestamp: None,
            created_at: None,
            degradation_score: None,
        }
    }

    /// Range-checks the inbound fields. Returns the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(rt) = self.avg_response_time_ms {
            if rt < 0.0 {
                return Err(format!("avg_response_time_ms must be >= 0, got {rt}"));
            }
        }
        for (name, value) in [
            ("error_rate_percentage", self.error_rate_percentage),
            ("success_rate_percentage", self.success_rate_percentage),
            ("timeout_rate_percentage", self.timeout_rate_percentage),
            ("uptime_percentage", self.uptime_percentage),
        ] {
            if let Some(v) = value {
                if !(0.0..=100.0).contains(&v) {
                    return Err(format!("{name} must be within [0, 100], got {v}"));
                }
            }
        }
        for (name, value) in [
            ("latency_p50", self.latency_p50),
            ("latency_p95", self.latency_p95),
            ("latency_p99", self.latency_p99),
            ("requests_per_minute", self.requests_per_minute),
        ] {
            if let Some(v) = value {
                if v < 0 {
                    return Err(format!("{name} must be >= 0, got {v}"));
                }
            }
        }
        Ok(())
    }

    /// Smooths latency against the previous sample: `L = alpha*M + (1-alpha)*L_prev`.
    ///
    /// With no prior EWMA the instantaneous value seeds the series; with no
    /// instantaneous value the prior EWMA is carried forward unchanged.
    pub fn apply_ewma(&mut self, previous_ewma: Option<f64>, alpha: f64) {
        match (self.avg_response_time_ms, previous_ewma) {
            (None, prev) => self.ewma_latency_ms = prev,
            (Some(instant), None) => self.ewma_latency_ms = Some(instant),
            (Some(instant), Some(prev)) => {
                self.ewma_latency_ms = Some(alpha * instant + (1.0 - alpha) * prev);
            }
        }
    }

    /// EWMA latency when available, instantaneous otherwise.
    pub fn effective_latency(&self) -> Option<f64> {
        self.ewma_latency_ms.or(self.avg_response_time_ms)
    }

    /// `min(500, rt) + 20*err + 20*timeout + 2*(100-uptime)`, absent fields as 0.
    pub fn compute_degradation(&self) -> f64 {
        let mut score = 0.0;
        if let Some(rt) = self.avg_response_time_ms {
            score += rt.min(500.0);
        }
        if let Some(err) = self.error_rate_percentage {
            score += err * 20.0;
        }
        if let Some(timeout) = self.timeout_rate_percentage {
            score += timeout * 20.0;
        }
        if let Some(uptime) = self.uptime_percentage {
            score += (100.0 - uptime) * 2.0;
        }
        score
    }

    /// Whether all fields required for scoring are present.
    pub fn is_complete(&self) -> bool {
        self.avg_response_time_ms.is_some()
            && self.error_rate_percentage.is_some()
            && self.success_rate_percentage.is_some()
            && self.timeout_rate_percentage.is_some()
            && self.uptime_percentage.is_some()
    }

    /// Whether `created_at` falls within the last `max_age_secs` seconds.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        match self.created_at {
            Some(at) => (now - at).num_seconds() <= max_age_secs,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_sample() -> MetricSample {
        let mut sample = MetricSample::new("s1");
        sample.avg_response_time_ms = Some(150.0);
        sample.error_rate_percentage = Some(0.5);
        sample.success_rate_percentage = Some(99.5);
        sample.timeout_rate_percentage = Some(0.1);
        sample.uptime_percentage = Some(99.9);
        sample
    }

    #[test]
    fn test_validate_accepts_healthy_sample() {
        assert!(healthy_sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_latency() {
        let mut sample = healthy_sample();
        sample.avg_response_time_ms = Some(-1.0);
        assert!(sample.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_rate_out_of_range() {
        let mut sample = healthy_sample();
        sample.error_rate_percentage = Some(100.1);
        assert!(sample.validate().is_err());

        let mut sample = healthy_sample();
        sample.uptime_percentage = Some(-0.1);
        assert!(sample.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_percentiles_and_rpm() {
        let mut sample = healthy_sample();
        sample.latency_p99 = Some(-5);
        assert!(sample.validate().is_err());

        let mut sample = healthy_sample();
        sample.requests_per_minute = Some(-1);
        assert!(sample.validate().is_err());
    }

    #[test]
    fn test_ewma_first_sample_seeds_from_instant() {
        let mut sample = healthy_sample();
        sample.apply_ewma(None, DEFAULT_EWMA_ALPHA);
        assert_eq!(sample.ewma_latency_ms, Some(150.0));
    }

    #[test]
    fn test_ewma_blends_with_previous() {
        let mut sample = healthy_sample();
        sample.apply_ewma(Some(300.0), DEFAULT_EWMA_ALPHA);
        // 0.3 * 150 + 0.7 * 300 = 255
        let ewma = sample.ewma_latency_ms.unwrap();
        assert!((ewma - 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_ewma_carries_previous_when_instant_missing() {
        let mut sample = MetricSample::new("s1");
        sample.apply_ewma(Some(210.0), DEFAULT_EWMA_ALPHA);
        assert_eq!(sample.ewma_latency_ms, Some(210.0));
    }

    #[test]
    fn test_ewma_converges_to_constant_input() {
        // Feeding the same instantaneous latency repeatedly converges to it.
        let mut ewma = None;
        for _ in 0..40 {
            let mut sample = MetricSample::new("s1");
            sample.avg_response_time_ms = Some(120.0);
            sample.apply_ewma(ewma, DEFAULT_EWMA_ALPHA);
            ewma = sample.ewma_latency_ms;
        }
        assert!((ewma.unwrap() - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_effective_latency_prefers_ewma() {
        let mut sample = healthy_sample();
        sample.ewma_latency_ms = Some(175.0);
        assert_eq!(sample.effective_latency(), Some(175.0));

        sample.ewma_latency_ms = None;
        assert_eq!(sample.effective_latency(), Some(150.0));
    }

    #[test]
    fn test_degradation_score() {
        let sample = healthy_sample();
        // min(500,150) + 0.5*20 + 0.1*20 + 0.1*2 = 150 + 10 + 2 + 0.2
        let score = sample.compute_degradation();
        assert!((score - 162.2).abs() < 1e-9);
    }

    #[test]
    fn test_degradation_score_caps_response_time() {
        let mut sample = MetricSample::new("s1");
        sample.avg_response_time_ms = Some(2_000.0);
        assert_eq!(sample.compute_degradation(), 500.0);
    }

    #[test]
    fn test_serde_wire_names() {
        let json = r#"{
            "avg_response_time_ms": 120.5,
            "error_rate_percentage": 1.0,
            "success_rate_percentage": 99.0,
            "timeout_rate_percentage": 0.2,
            "uptime_percentage": 99.9,
            "latency_p50": 100,
            "requests_per_minute": 420,
            "window_timestamp": 1712000000
        }"#;
        let sample: MetricSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.avg_response_time_ms, Some(120.5));
        assert_eq!(sample.latency_p50, Some(100));
        assert_eq!(sample.window_timestamp, Some(1712000000));
        assert!(sample.is_complete());
    }
}
