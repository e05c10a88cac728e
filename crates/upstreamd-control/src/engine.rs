//! Per-pool weight calculation.
//!
//! The pipeline per pool: select contributing samples, score each on five
//! piecewise-linear signals, normalize scores into integer weights, apply a
//! minimum-traffic safety net, apply per-server policy overrides, then
//! renormalize so active weights sum to exactly 100.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use upstreamd_common::model::{
    MetricSample, Pool, ServerDescriptor, WeightAllocation, WeightFactors,
};

use crate::policy::PolicyStore;
use crate::registry::ServerRegistry;

pub const MIN_WEIGHT: u32 = 1;
pub const MAX_WEIGHT: u32 = 100;
pub const DEFAULT_WEIGHT: u32 = 10;

/// Pool-wide weight budget.
const TARGET_TOTAL: u32 = 100;

/// Raw scores below this are not worth routing to.
const NEGLIGIBLE_SCORE: f64 = 0.1;

pub struct WeightEngine {
    registry: Arc<ServerRegistry>,
    policies: Arc<PolicyStore>,
    factors: Arc<RwLock<WeightFactors>>,
}

impl WeightEngine {
    pub fn new(
        registry: Arc<ServerRegistry>,
        policies: Arc<PolicyStore>,
        factors: Arc<RwLock<WeightFactors>>,
    ) -> Self {
        Self {
            registry,
            policies,
            factors,
        }
    }

    pub fn factors(&self) -> WeightFactors {
        *self.factors.read().unwrap()
    }

    /// Computes the weight allocations for one pool from the latest samples.
    ///
    /// Samples for servers outside the pool are ignored; an empty pool
    /// produces an empty allocation list.
    pub fn compute(&self, pool: Pool, samples: &[MetricSample]) -> Vec<WeightAllocation> {
        let servers = self.registry.servers(pool);
        if servers.is_empty() {
            info!(%pool, "no servers configured");
            return Vec::new();
        }

        // Registry order keeps the output deterministic: repeated runs over
        // the same inputs assign the rounding residue to the same server.
        let pool_samples: Vec<&MetricSample> = servers
            .iter()
            .filter_map(|s| samples.iter().find(|m| m.server_id == s.id))
            .collect();

        let contributors: Vec<&MetricSample> = pool_samples
            .iter()
            .copied()
            .filter(|m| {
                servers
                    .iter()
                    .find(|s| s.id == m.server_id)
                    .map(|s| s.enabled)
                    .unwrap_or(false)
            })
            .collect();

        let mut allocations = if contributors.is_empty() {
            warn!(%pool, "no usable metrics, assigning default weights");
            default_allocations(&servers)
        } else {
            let factors = self.factors();
            let scored: Vec<(&MetricSample, f64, String)> = contributors
                .iter()
                .map(|m| {
                    let (raw, reason) = score_sample(m, &factors);
                    debug!(
                        server_id = %m.server_id,
                        instant = ?m.avg_response_time_ms,
                        ewma = ?m.ewma_latency_ms,
                        raw,
                        "scored server"
                    );
                    (*m, raw, reason)
                })
                .collect();

            let mut allocations = normalize_and_assign(&scored, &servers);

            // Disabled servers that still report show up with zero weight.
            for sample in &pool_samples {
                let contributed = contributors.iter().any(|c| c.server_id == sample.server_id);
                if !contributed {
                    if let Some(server) = servers.iter().find(|s| s.id == sample.server_id) {
                        allocations.push(WeightAllocation::new(
                            &sample.server_id,
                            server.address(),
                            0,
                            0.0,
                            "Server manually disabled",
                        ));
                    }
                }
            }

            ensure_minimum_traffic(&mut allocations);
            allocations
        };

        self.apply_policy_overrides(&mut allocations);
        self.normalize_to_total(&mut allocations, TARGET_TOTAL);

        info!(
            %pool,
            active = allocations.iter().filter(|a| a.is_active()).count(),
            total = allocations.len(),
            "weight calculation completed"
        );
        allocations
    }

    /// Step 5: fixed weights override the calculation, removed servers drop
    /// to zero.
    fn apply_policy_overrides(&self, allocations: &mut [WeightAllocation]) {
        for allocation in allocations.iter_mut() {
            let calculated = allocation.weight;
            let effective = self
                .policies
                .effective_weight(&allocation.server_id, calculated);
            if effective == calculated {
                continue;
            }
            let removed = self
                .policies
                .get(&allocation.server_id)
                .map(|p| p.manually_removed)
                .unwrap_or(false);
            allocation.weight = effective;
            allocation.reason = if removed {
                "Server manually removed".to_string()
            } else {
                format!("Fixed weight: {effective} (Dynamic would be: {calculated})")
            };
            info!(
                server_id = %allocation.server_id,
                effective,
                calculated,
                "policy override applied"
            );
        }
    }

    /// Step 6: renormalize active allocations so the pool sums to the target.
    ///
    /// Pinned servers keep their weight when possible; the remaining budget
    /// is split across dynamic servers proportionally to their current
    /// weights, the last one absorbing the rounding residue.
    fn normalize_to_total(&self, allocations: &mut [WeightAllocation], target: u32) {
        let active: Vec<usize> = (0..allocations.len())
            .filter(|&i| allocations[i].is_active())
            .collect();
        if active.is_empty() {
            warn!("no active allocations to normalize");
            return;
        }

        let is_fixed = |id: &str| {
            self.policies
                .get(id)
                .map(|p| !p.dynamic_weight_enabled && p.fixed_weight.is_some())
                .unwrap_or(false)
        };
        let (fixed, dynamic): (Vec<usize>, Vec<usize>) = active
            .iter()
            .copied()
            .partition(|&i| is_fixed(&allocations[i].server_id));

        let fixed_total: u32 = fixed.iter().map(|&i| allocations[i].weight).sum();
        debug!(
            fixed = fixed.len(),
            fixed_total,
            dynamic = dynamic.len(),
            target,
            "normalizing weights"
        );

        if dynamic.is_empty() {
            if fixed_total != target {
                warn!(
                    fixed_total,
                    target, "fixed weights off target, rescaling proportionally"
                );
                rescale_proportionally(allocations, &fixed, target);
            }
            return;
        }

        if fixed_total >= target {
            warn!(
                fixed_total,
                target, "fixed weights exceed capacity, zeroing dynamic servers"
            );
            for &i in &dynamic {
                allocations[i].weight = 0;
                allocations[i]
                    .append_reason(" [Normalized to 0: fixed weights exceed capacity]");
            }
            rescale_proportionally(allocations, &fixed, target);
            return;
        }

        let remaining = target - fixed_total;
        let dynamic_total: u32 = dynamic.iter().map(|&i| allocations[i].weight).sum();

        if dynamic_total == 0 {
            let per_server = remaining / dynamic.len() as u32;
            let remainder = remaining as usize % dynamic.len();
            for (position, &i) in dynamic.iter().enumerate() {
                let weight = per_server + u32::from(position < remainder);
                allocations[i].weight = weight;
                allocations[i]
                    .append_reason(&format!(" [Normalized: {weight}/{remaining} available]"));
            }
        } else {
            let scale = remaining as f64 / dynamic_total as f64;
            let mut assigned = 0u32;
            for (position, &i) in dynamic.iter().enumerate() {
                let original = allocations[i].weight;
                let weight = if position == dynamic.len() - 1 {
                    remaining.saturating_sub(assigned)
                } else {
                    let scaled = (original as f64 * scale).round() as u32;
                    assigned += scaled;
                    scaled
                };
                allocations[i].weight = weight;
                allocations[i].append_reason(&format!(" [Normalized: {original}\u{2192}{weight}]"));
            }
        }

        let final_total: u32 = allocations
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.weight)
            .sum();
        if final_total != target {
            warn!(final_total, target, "normalized total off target");
        }
    }
}

/// Every server in the pool gets the default weight when no metrics exist.
fn default_allocations(servers: &[ServerDescriptor]) -> Vec<WeightAllocation> {
    servers
        .iter()
        .map(|server| {
            WeightAllocation::new(
                &server.id,
                server.address(),
                DEFAULT_WEIGHT,
                0.5,
                "Default weight - no metrics available",
            )
        })
        .collect()
}

/// Steps 2-3: composite raw score per contributor, normalized into weights.
fn normalize_and_assign(
    scored: &[(&MetricSample, f64, String)],
    servers: &[ServerDescriptor],
) -> Vec<WeightAllocation> {
    let total: f64 = scored.iter().map(|(_, raw, _)| raw).sum();
    let mut allocations = Vec::with_capacity(scored.len());

    for (sample, raw, reason) in scored {
        let Some(server) = servers.iter().find(|s| s.id == sample.server_id) else {
            continue;
        };
        let (weight, reason) = if total <= 0.0 {
            (
                DEFAULT_WEIGHT,
                "Default weight - all servers unhealthy".to_string(),
            )
        } else {
            let normalized = raw / total;
            let mut weight = ((normalized * 100.0).round() as u32).clamp(MIN_WEIGHT, MAX_WEIGHT);
            if *raw < NEGLIGIBLE_SCORE {
                weight = 0;
            }
            (weight, reason.clone())
        };
        allocations.push(WeightAllocation::new(
            &sample.server_id,
            server.address(),
            weight,
            *raw,
            reason,
        ));
    }
    allocations
}

/// Step 4: an all-zero pool routes a trickle to its least unhealthy server.
fn ensure_minimum_traffic(allocations: &mut [WeightAllocation]) {
    if allocations.is_empty() || allocations.iter().any(|a| a.is_active()) {
        return;
    }
    let best = allocations
        .iter_mut()
        .max_by(|a, b| a.health_score.total_cmp(&b.health_score));
    if let Some(best) = best {
        best.weight = MIN_WEIGHT;
        best.reason = "Emergency fallback - no healthy servers".to_string();
        warn!(server_id = %best.server_id, "no healthy servers, assigning minimal traffic");
    }
}

/// Rescales the allocations at `indices` so they sum to `target`, each kept
/// at least 1; the last one absorbs the rounding residue.
fn rescale_proportionally(allocations: &mut [WeightAllocation], indices: &[usize], target: u32) {
    if indices.is_empty() {
        return;
    }
    let current: u32 = indices.iter().map(|&i| allocations[i].weight).sum();

    if current == 0 {
        let per_server = target / indices.len() as u32;
        let remainder = target as usize % indices.len();
        for (position, &i) in indices.iter().enumerate() {
            let weight = per_server + u32::from(position < remainder);
            allocations[i].weight = weight;
            allocations[i].reason = format!("Equal distribution: {weight}");
        }
        return;
    }

    let scale = target as f64 / current as f64;
    let mut assigned = 0u32;
    for (position, &i) in indices.iter().enumerate() {
        let original = allocations[i].weight;
        let weight = if position == indices.len() - 1 {
            target.saturating_sub(assigned).max(1)
        } else {
            let scaled = ((original as f64 * scale).round() as u32).max(1);
            assigned += scaled;
            scaled
        };
        allocations[i].weight = weight;
        allocations[i].append_reason(&format!(
            " [Proportionally normalized: {original}\u{2192}{weight}]"
        ));
    }
}

/// Step 2: factor-weighted composite of the five signal scores.
///
/// The success-rate score is computed for the reason text but does not enter
/// the composite; the five weighted signals are response time, error rate,
/// timeout rate, uptime and degradation.
fn score_sample(sample: &MetricSample, factors: &WeightFactors) -> (f64, String) {
    if !sample.is_complete() {
        return (0.0, "Invalid metrics".to_string());
    }

    let effective_latency = sample.effective_latency();
    let response_time = score_response_time(effective_latency);
    let error_rate = score_error_rate(sample.error_rate_percentage);
    let success_rate = score_success_rate(sample.success_rate_percentage);
    let timeout_rate = score_timeout_rate(sample.timeout_rate_percentage);
    let uptime = score_uptime(sample.uptime_percentage);
    let degradation = score_degradation(sample.degradation_score);

    let raw = response_time * factors.response_time
        + error_rate * factors.error_rate
        + timeout_rate * factors.timeout_rate
        + uptime * factors.uptime
        + degradation * factors.degradation;

    let reason = format!(
        "EWMA:{:.1}ms SR:{success_rate:.2} RT:{response_time:.2} ER:{error_rate:.2} \
         TO:{timeout_rate:.2} UP:{uptime:.2} DEG:{degradation:.2}",
        effective_latency.unwrap_or(0.0)
    );
    (raw, reason)
}

fn score_response_time(response_time_ms: Option<f64>) -> f64 {
    let Some(rt) = response_time_ms else {
        return 0.0;
    };
    if rt <= 0.0 {
        return 0.0;
    }
    if rt <= 200.0 {
        1.0
    } else if rt <= 500.0 {
        1.0 - ((rt - 200.0) / 300.0) * 0.5
    } else if rt <= 1000.0 {
        0.5 - ((rt - 500.0) / 500.0) * 0.4
    } else {
        (0.1 - ((rt - 1000.0) / 2000.0) * 0.1).max(0.0)
    }
}

fn score_error_rate(error_rate: Option<f64>) -> f64 {
    let Some(rate) = error_rate else {
        return 0.0;
    };
    if rate <= 0.0 {
        1.0
    } else if rate >= 10.0 {
        0.0
    } else {
        1.0 - rate / 10.0
    }
}

fn score_success_rate(success_rate: Option<f64>) -> f64 {
    let Some(rate) = success_rate else {
        return 0.0;
    };
    if rate >= 100.0 {
        1.0
    } else if rate <= 90.0 {
        0.0
    } else {
        (rate - 90.0) / 10.0
    }
}

fn score_timeout_rate(timeout_rate: Option<f64>) -> f64 {
    let Some(rate) = timeout_rate else {
        return 0.0;
    };
    if rate <= 0.0 {
        1.0
    } else if rate >= 5.0 {
        0.0
    } else {
        1.0 - rate / 5.0
    }
}

fn score_uptime(uptime: Option<f64>) -> f64 {
    let Some(uptime) = uptime else {
        return 0.0;
    };
    if uptime >= 99.5 {
        1.0
    } else if uptime <= 90.0 {
        0.0
    } else {
        (uptime - 90.0) / 9.5
    }
}

fn score_degradation(degradation: Option<f64>) -> f64 {
    let Some(score) = degradation else {
        return 1.0;
    };
    if score <= 0.0 {
        1.0
    } else if score >= 500.0 {
        0.0
    } else {
        1.0 - score / 500.0
    }
}
