//! Per-server policy store.
//!
//! Holds every [`ServerPolicy`] record in process memory and writes the full
//! set through to the shared store after each mutation so sibling instances
//! converge on the same overrides. Reads are synchronous; mutations are
//! async only because of the write-through.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use upstreamd_common::model::{MetricSample, PolicyPatch, ServerPolicy};
use upstreamd_store::SharedState;

const POLICIES_BLOB: &str = "server-policies";

pub struct PolicyStore {
    policies: RwLock<HashMap<String, ServerPolicy>>,
    shared: Arc<SharedState>,
}

impl PolicyStore {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            shared,
        }
    }

    /// Adopts any policy set a sibling instance has already published.
    pub async fn hydrate(&self) {
        if let Some(stored) = self
            .shared
            .get_config_blob::<HashMap<String, ServerPolicy>>(POLICIES_BLOB)
            .await
        {
            let count = stored.len();
            *self.policies.write().unwrap() = stored;
            info!(count, "hydrated server policies from shared state");
        }
    }

    async fn persist(&self) {
        let snapshot = self.policies.read().unwrap().clone();
        self.shared.put_config_blob(POLICIES_BLOB, &snapshot).await;
    }

    pub fn get(&self, server_id: &str) -> Option<ServerPolicy> {
        self.policies.read().unwrap().get(server_id).cloned()
    }

    pub fn all(&self) -> Vec<ServerPolicy> {
        let mut policies: Vec<ServerPolicy> =
            self.policies.read().unwrap().values().cloned().collect();
        policies.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        policies
    }

    fn with_policy<R>(&self, server_id: &str, apply: impl FnOnce(&mut ServerPolicy) -> R) -> R {
        let mut policies = self.policies.write().unwrap();
        let policy = policies
            .entry(server_id.to_string())
            .or_insert_with(|| ServerPolicy::new(server_id));
        let result = apply(policy);
        policy.touch();
        result
    }

    pub async fn get_or_create(&self, server_id: &str) -> ServerPolicy {
        if let Some(existing) = self.get(server_id) {
            return existing;
        }
        let created = self.with_policy(server_id, |p| p.clone());
        self.persist().await;
        created
    }

    pub async fn update(&self, server_id: &str, patch: PolicyPatch) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            if let Some(enabled) = patch.dynamic_weight_enabled {
                policy.dynamic_weight_enabled = enabled;
            }
            if let Some(weight) = patch.fixed_weight {
                policy.fixed_weight = Some(weight.min(100));
            }
            if let Some(v) = patch.max_response_time_ms {
                policy.max_response_time_ms = Some(v);
            }
            if let Some(v) = patch.max_error_rate_percentage {
                policy.max_error_rate_percentage = Some(v);
            }
            if let Some(v) = patch.min_success_rate_percentage {
                policy.min_success_rate_percentage = Some(v);
            }
            if let Some(v) = patch.max_timeout_rate_percentage {
                policy.max_timeout_rate_percentage = Some(v);
            }
            if let Some(v) = patch.min_uptime_percentage {
                policy.min_uptime_percentage = Some(v);
            }
            if let Some(v) = patch.max_violations_before_removal {
                policy.max_violations_before_removal = v;
            }
            if let Some(v) = patch.auto_removal_enabled {
                policy.auto_removal_enabled = v;
            }
            policy.clone()
        });
        self.persist().await;
        updated
    }

    /// Pins a weight; pinning implies dynamic weighting off.
    pub async fn set_fixed_weight(&self, server_id: &str, weight: u32) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.fixed_weight = Some(weight.min(100));
            policy.dynamic_weight_enabled = false;
            policy.clone()
        });
        info!(server_id, weight, "fixed weight pinned");
        self.persist().await;
        updated
    }

    /// Returns to dynamic weighting; the pin is cleared.
    pub async fn enable_dynamic(&self, server_id: &str) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.dynamic_weight_enabled = true;
            policy.fixed_weight = None;
            policy.clone()
        });
        info!(server_id, "dynamic weighting enabled");
        self.persist().await;
        updated
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn set_thresholds(
        &self,
        server_id: &str,
        max_response_time_ms: Option<f64>,
        max_error_rate: Option<f64>,
        min_success_rate: Option<f64>,
        max_timeout_rate: Option<f64>,
        min_uptime: Option<f64>,
    ) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            if max_response_time_ms.is_some() {
                policy.max_response_time_ms = max_response_time_ms;
            }
            if max_error_rate.is_some() {
                policy.max_error_rate_percentage = max_error_rate;
            }
            if min_success_rate.is_some() {
                policy.min_success_rate_percentage = min_success_rate;
            }
            if max_timeout_rate.is_some() {
                policy.max_timeout_rate_percentage = max_timeout_rate;
            }
            if min_uptime.is_some() {
                policy.min_uptime_percentage = min_uptime;
            }
            policy.clone()
        });
        self.persist().await;
        updated
    }

    pub async fn enable_auto_removal(
        &self,
        server_id: &str,
        max_violations: Option<u32>,
    ) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.auto_removal_enabled = true;
            if let Some(max) = max_violations {
                policy.max_violations_before_removal = max;
            }
            policy.clone()
        });
        self.persist().await;
        updated
    }

    pub async fn disable_auto_removal(&self, server_id: &str) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.auto_removal_enabled = false;
            policy.reset_violations();
            policy.clone()
        });
        self.persist().await;
        updated
    }

    pub async fn manually_remove(&self, server_id: &str) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.manually_removed = true;
            policy.clone()
        });
        warn!(server_id, "server manually removed from rotation");
        self.persist().await;
        updated
    }

    /// Puts a removed server back; its violation history starts clean.
    pub async fn reenable(&self, server_id: &str) -> ServerPolicy {
        let updated = self.with_policy(server_id, |policy| {
            policy.manually_removed = false;
            policy.reset_violations();
            policy.clone()
        });
        info!(server_id, "server re-enabled");
        self.persist().await;
        updated
    }

    pub async fn reset_all(&self) {
        {
            let mut policies = self.policies.write().unwrap();
            for policy in policies.values_mut() {
                policy.dynamic_weight_enabled = true;
                policy.fixed_weight = None;
                policy.auto_removal_enabled = false;
                policy.manually_removed = false;
                policy.reset_violations();
            }
        }
        info!("all server policies reset to defaults");
        self.persist().await;
    }

    /// The weight a server actually gets: 0 when removed, the pin when
    /// pinned, the engine's calculation otherwise.
    pub fn effective_weight(&self, server_id: &str, calculated: u32) -> u32 {
        match self.get(server_id) {
            Some(policy) => policy.effective_weight(calculated),
            None => calculated,
        }
    }

    /// Threshold check driven by each accepted sample.
    ///
    /// A violating sample bumps the counter; enough consecutive violations
    /// flip the server to removed. One clean sample resets the counter.
    pub async fn evaluate_thresholds(&self, server_id: &str, sample: &MetricSample) {
        let Some(policy) = self.get(server_id) else {
            return;
        };
        let mut changed = false;
        if policy.violates_thresholds(sample) {
            let details = policy.violation_details(sample);
            let (count, limit, removed) = self.with_policy(server_id, |policy| {
                policy.record_violation();
                let removed = policy.should_be_removed();
                if removed {
                    policy.manually_removed = true;
                }
                (
                    policy.violations_count,
                    policy.max_violations_before_removal,
                    removed,
                )
            });
            warn!(
                server_id,
                violation = count,
                limit,
                details,
                "server violated thresholds"
            );
            if removed {
                error!(server_id, limit, "violation limit reached, removing server");
            }
            changed = true;
        } else if policy.violations_count > 0 {
            self.with_policy(server_id, |policy| policy.reset_violations());
            info!(server_id, "server recovered, violation count reset");
            changed = true;
        }
        if changed {
            self.persist().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upstreamd_common::config::{KeyLayout, TtlSettings};
    use upstreamd_store::MemoryStore;

    fn store() -> PolicyStore {
        let shared = Arc::new(SharedState::new(
            Arc::new(MemoryStore::new()),
            KeyLayout::default(),
            TtlSettings::default(),
            "test",
        ));
        PolicyStore::new(shared)
    }

    fn violating_sample() -> MetricSample {
        let mut sample = MetricSample::new("s1");
        sample.avg_response_time_ms = Some(900.0);
        sample.error_rate_percentage = Some(0.0);
        sample.success_rate_percentage = Some(100.0);
        sample.timeout_rate_percentage = Some(0.0);
        sample.uptime_percentage = Some(100.0);
        sample
    }

    fn clean_sample() -> MetricSample {
        let mut sample = violating_sample();
        sample.avg_response_time_ms = Some(50.0);
        sample
    }

    #[tokio::test]
    async fn test_fixed_weight_disables_dynamic() {
        let store = store();
        let policy = store.set_fixed_weight("s1", 70).await;
        assert_eq!(policy.fixed_weight, Some(70));
        assert!(!policy.dynamic_weight_enabled);
        assert_eq!(store.effective_weight("s1", 42), 70);
    }

    #[tokio::test]
    async fn test_fixed_weight_clamped_to_100() {
        let store = store();
        let policy = store.set_fixed_weight("s1", 250).await;
        assert_eq!(policy.fixed_weight, Some(100));
    }

    #[tokio::test]
    async fn test_enable_dynamic_clears_fixed() {
        let store = store();
        store.set_fixed_weight("s1", 70).await;
        let policy = store.enable_dynamic("s1").await;
        assert!(policy.dynamic_weight_enabled);
        assert!(policy.fixed_weight.is_none());
        assert_eq!(store.effective_weight("s1", 42), 42);
    }

    #[tokio::test]
    async fn test_effective_weight_without_policy_is_passthrough() {
        let store = store();
        assert_eq!(store.effective_weight("unknown", 33), 33);
    }

    #[tokio::test]
    async fn test_auto_removal_after_violations() {
        let store = store();
        store
            .set_thresholds("s1", Some(200.0), None, None, None, None)
            .await;
        store.enable_auto_removal("s1", Some(3)).await;

        for _ in 0..2 {
            store.evaluate_thresholds("s1", &violating_sample()).await;
        }
        assert!(!store.get("s1").unwrap().manually_removed);

        store.evaluate_thresholds("s1", &violating_sample()).await;
        let policy = store.get("s1").unwrap();
        assert!(policy.manually_removed);
        assert_eq!(policy.violations_count, 3);
        assert_eq!(store.effective_weight("s1", 42), 0);
    }

    #[tokio::test]
    async fn test_clean_sample_resets_violations() {
        let store = store();
        store
            .set_thresholds("s1", Some(200.0), None, None, None, None)
            .await;
        store.enable_auto_removal("s1", Some(5)).await;

        store.evaluate_thresholds("s1", &violating_sample()).await;
        store.evaluate_thresholds("s1", &violating_sample()).await;
        assert_eq!(store.get("s1").unwrap().violations_count, 2);

        store.evaluate_thresholds("s1", &clean_sample()).await;
        assert_eq!(store.get("s1").unwrap().violations_count, 0);
    }

    #[tokio::test]
    async fn test_reenable_clears_removal_and_violations() {
        let store = store();
        store
            .set_thresholds("s1", Some(200.0), None, None, None, None)
            .await;
        store.enable_auto_removal("s1", Some(1)).await;
        store.evaluate_thresholds("s1", &violating_sample()).await;
        assert!(store.get("s1").unwrap().manually_removed);

        let policy = store.reenable("s1").await;
        assert!(!policy.manually_removed);
        assert_eq!(policy.violations_count, 0);
    }

    #[tokio::test]
    async fn test_disable_auto_removal_resets_violations() {
        let store = store();
        store
            .set_thresholds("s1", Some(200.0), None, None, None, None)
            .await;
        store.enable_auto_removal("s1", Some(10)).await;
        store.evaluate_thresholds("s1", &violating_sample()).await;
        assert_eq!(store.get("s1").unwrap().violations_count, 1);

        let policy = store.disable_auto_removal("s1").await;
        assert!(!policy.auto_removal_enabled);
        assert_eq!(policy.violations_count, 0);
    }

    #[tokio::test]
    async fn test_reset_all() {
        let store = store();
        store.set_fixed_weight("a", 50).await;
        store.manually_remove("b").await;
        store.reset_all().await;

        let a = store.get("a").unwrap();
        assert!(a.dynamic_weight_enabled);
        assert!(a.fixed_weight.is_none());
        assert!(!store.get("b").unwrap().manually_removed);
    }

    #[tokio::test]
    async fn test_hydrate_adopts_shared_policies() {
        let shared = Arc::new(SharedState::new(
            Arc::new(MemoryStore::new()),
            KeyLayout::default(),
            TtlSettings::default(),
            "test",
        ));
        let first = PolicyStore::new(shared.clone());
        first.set_fixed_weight("s1", 60).await;

        let second = PolicyStore::new(shared);
        assert!(second.get("s1").is_none());
        second.hydrate().await;
        assert_eq!(second.get("s1").unwrap().fixed_weight, Some(60));
    }

    #[tokio::test]
    async fn test_thresholds_without_policy_do_nothing() {
        let store = store();
        store.evaluate_thresholds("ghost", &violating_sample()).await;
        assert!(store.get("ghost").is_none());
    }
}
