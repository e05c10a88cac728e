use serde::{Deserialize, Serialize};

/// Tolerance on the factor sum.
pub const FACTOR_SUM_TOLERANCE: f64 = 0.01;

/// The five tunable coefficients combined into a server's composite score.
///
/// Constrained to sum to 1.0 within [`FACTOR_SUM_TOLERANCE`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightFactors {
    pub response_time: f64,
    pub error_rate: f64,
    pub timeout_rate: f64,
    pub uptime: f64,
    pub degradation: f64,
}

impl Default for WeightFactors {
    fn default() -> Self {
        Self::BALANCED
    }
}

impl WeightFactors {
    pub const BALANCED: Self = Self {
        response_time: 0.25,
        error_rate: 0.25,
        timeout_rate: 0.15,
        uptime: 0.20,
        degradation: 0.15,
    };

    pub const PERFORMANCE: Self = Self {
        response_time: 0.40,
        error_rate: 0.20,
        timeout_rate: 0.10,
        uptime: 0.15,
        degradation: 0.15,
    };

    pub const RELIABILITY: Self = Self {
        response_time: 0.15,
        error_rate: 0.30,
        timeout_rate: 0.20,
        uptime: 0.30,
        degradation: 0.05,
    };

    pub const ERROR_AVOIDANCE: Self = Self {
        response_time: 0.15,
        error_rate: 0.40,
        timeout_rate: 0.25,
        uptime: 0.15,
        degradation: 0.05,
    };

    /// Looks up a preset by its admin-surface name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "balanced" => Some(Self::BALANCED),
            "performance" => Some(Self::PERFORMANCE),
            "reliability" => Some(Self::RELIABILITY),
            "errorAvoidance" => Some(Self::ERROR_AVOIDANCE),
            _ => None,
        }
    }

    pub fn sum(&self) -> f64 {
        self.response_time + self.error_rate + self.timeout_rate + self.uptime + self.degradation
    }

    pub fn is_valid(&self) -> bool {
        (self.sum() - 1.0).abs() <= FACTOR_SUM_TOLERANCE
    }

    /// Scales all factors so they sum to exactly 1.0. No-op on a zero sum.
    pub fn normalize(&mut self) -> bool {
        let sum = self.sum();
        if sum == 0.0 {
            return false;
        }
        self.response_time /= sum;
        self.error_rate /= sum;
        self.timeout_rate /= sum;
        self.uptime /= sum;
        self.degradation /= sum;
        true
    }
}
