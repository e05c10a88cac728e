//! Typed facade over the shared key-value store.
//!
//! Every method here is infallible from the caller's point of view: backend
//! errors are logged at warn and collapse to absent/false/empty. Store
//! unavailability degrades the control plane (cycles skip, reads fall back
//! to the archive) but never crashes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use upstreamd_common::config::{KeyLayout, TtlSettings};
use upstreamd_common::model::{MetricSample, WeightAllocation};

use crate::state::StateStore;

/// Liveness record one instance publishes about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub instance_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: String,
}

pub struct SharedState {
    store: Arc<dyn StateStore>,
    keys: KeyLayout,
    ttl: TtlSettings,
    instance_id: String,
}

impl SharedState {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: KeyLayout,
        ttl: TtlSettings,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keys,
            ttl,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        let body = match serde_json::to_string(value) {
            Ok(body) => body,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize value for shared store");
                return false;
            }
        };
        match self
            .store
            .put(key, body, Duration::from_secs(ttl_secs))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to write to shared store");
                false
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "failed to read from shared store");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "undecodable value in shared store");
                None
            }
        }
    }

    // ----- metrics -----

    pub async fn put_metric(&self, server_id: &str, sample: &MetricSample) -> bool {
        let key = format!("{}{}", self.keys.metrics_prefix, server_id);
        self.put_json(&key, sample, self.ttl.metrics).await
    }

    pub async fn get_metric(&self, server_id: &str) -> Option<MetricSample> {
        let key = format!("{}{}", self.keys.metrics_prefix, server_id);
        self.get_json(&key).await
    }

    /// Newest sample per server, keyed by server id.
    pub async fn all_metrics(&self) -> std::collections::HashMap<String, MetricSample> {
        let mut result = std::collections::HashMap::new();
        let keys = match self.store.scan(&self.keys.metrics_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to scan metrics from shared store");
                return result;
            }
        };
        for key in keys {
            let server_id = key
                .strip_prefix(&self.keys.metrics_prefix)
                .unwrap_or(&key)
                .to_string();
            if let Some(sample) = self.get_json::<MetricSample>(&key).await {
                result.insert(server_id, sample);
            }
        }
        result
    }

    /// Drops metric keys whose TTL is exhausted. Redis expires keys natively,
    /// so this mostly matters for the in-memory backend.
    pub async fn cleanup_expired_metrics(&self) -> usize {
        let keys = match self.store.scan(&self.keys.metrics_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to scan metrics for cleanup");
                return 0;
            }
        };
        let mut cleaned = 0;
        for key in keys {
            match self.store.ttl_of(&key).await {
                Ok(None) => {
                    if self.store.delete(&key).await.is_ok() {
                        cleaned += 1;
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(key, error = %e, "failed to probe metric TTL"),
            }
        }
        if cleaned > 0 {
            debug!(cleaned, "removed expired metric entries");
        }
        cleaned
    }

    // ----- weights -----

    pub async fn put_weights(&self, weights: &[WeightAllocation]) -> bool {
        let key = format!("{}current", self.keys.weights_prefix);
        if !self.put_json(&key, &weights, self.ttl.weights).await {
            return false;
        }
        let stamp_key = format!("{}last-update", self.keys.weights_prefix);
        self.put_json(&stamp_key, &Utc::now(), self.ttl.weights).await
    }

    pub async fn get_weights(&self) -> Option<Vec<WeightAllocation>> {
        let key = format!("{}current", self.keys.weights_prefix);
        self.get_json(&key).await
    }

    pub async fn last_weight_update(&self) -> Option<DateTime<Utc>> {
        let key = format!("{}last-update", self.keys.weights_prefix);
        self.get_json(&key).await
    }

    // ----- proxy config -----

    pub async fn put_proxy_config(&self, config: &str) -> bool {
        if !self
            .put_json(&self.keys.nginx_config_key, &config, self.ttl.nginx_config)
            .await
        {
            return false;
        }
        self.put_json(&self.keys.last_update_key, &Utc::now(), self.ttl.nginx_config)
            .await
    }

    pub async fn get_proxy_config(&self) -> Option<String> {
        self.get_json(&self.keys.nginx_config_key).await
    }

    pub async fn last_proxy_update(&self) -> Option<DateTime<Utc>> {
        self.get_json(&self.keys.last_update_key).await
    }

    // ----- instance membership -----

    pub async fn heartbeat(&self) -> bool {
        let key = format!("{}{}", self.keys.instance_prefix, self.instance_id);
        let beat = InstanceHeartbeat {
            instance_id: self.instance_id.clone(),
            last_seen: Utc::now(),
            status: "active".to_string(),
        };
        self.put_json(&key, &beat, self.ttl.instance_heartbeat).await
    }

    /// Instance ids with an unexpired heartbeat.
    pub async fn active_instances(&self) -> Vec<String> {
        let keys = match self.store.scan(&self.keys.instance_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to scan instance heartbeats");
                return Vec::new();
            }
        };
        let mut instances = Vec::new();
        for key in keys {
            if let Some(beat) = self.get_json::<InstanceHeartbeat>(&key).await {
                instances.push(beat.instance_id);
            }
        }
        instances.sort();
        instances
    }

    // ----- advisory locks -----

    /// Set-if-absent lock acquisition. Failure means another instance is
    /// authoritative for this cycle.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> bool {
        let key = format!("{}{}", self.keys.lock_prefix, name);
        match self
            .store
            .put_if_absent(&key, self.instance_id.clone(), ttl)
            .await
        {
            Ok(acquired) => {
                debug!(name, acquired, "lock attempt");
                acquired
            }
            Err(e) => {
                warn!(name, error = %e, "failed to acquire lock");
                false
            }
        }
    }

    /// Compare-value-then-delete: only the owner releases; everyone else is
    /// a no-op so a slow writer cannot free somebody else's lock.
    pub async fn release_lock(&self, name: &str) {
        let key = format!("{}{}", self.keys.lock_prefix, name);
        match self.store.get(&key).await {
            Ok(Some(owner)) if owner == self.instance_id => {
                if let Err(e) = self.store.delete(&key).await {
                    warn!(name, error = %e, "failed to release lock");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(name, error = %e, "failed to inspect lock before release"),
        }
    }

    // ----- generic config blobs -----

    pub async fn put_config_blob<T: Serialize>(&self, name: &str, value: &T) -> bool {
        let key = format!("{}{}", self.keys.config_prefix, name);
        self.put_json(&key, value, self.ttl.config).await
    }

    pub async fn get_config_blob<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let key = format!("{}{}", self.keys.config_prefix, name);
        self.get_json(&key).await
    }

    pub async fn is_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn shared(instance: &str) -> (Arc<MemoryStore>, SharedState) {
        let store = Arc::new(MemoryStore::new());
        let shared = SharedState::new(
            store.clone(),
            KeyLayout::default(),
            TtlSettings::default(),
            instance,
        );
        (store, shared)
    }

    fn sample(server_id: &str, latency: f64) -> MetricSample {
        let mut sample = MetricSample::new(server_id);
        sample.avg_response_time_ms = Some(latency);
        sample.created_at = Some(Utc::now());
        sample
    }

    #[tokio::test]
    async fn test_metric_roundtrip() {
        let (_, shared) = shared("i1");
        assert!(shared.put_metric("s1", &sample("s1", 120.0)).await);
        let got = shared.get_metric("s1").await.unwrap();
        assert_eq!(got.server_id, "s1");
        assert_eq!(got.avg_response_time_ms, Some(120.0));
        assert!(shared.get_metric("absent").await.is_none());
    }

    #[tokio::test]
    async fn test_all_metrics_strips_prefix() {
        let (_, shared) = shared("i1");
        shared.put_metric("a", &sample("a", 1.0)).await;
        shared.put_metric("b", &sample("b", 2.0)).await;
        let all = shared.all_metrics().await;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("a"));
        assert!(all.contains_key("b"));
    }

    #[tokio::test]
    async fn test_weights_roundtrip_preserves_order() {
        let (_, shared) = shared("i1");
        let weights = vec![
            WeightAllocation::new("b", "b:1", 70, 0.7, "x"),
            WeightAllocation::new("a", "a:1", 30, 0.3, "y"),
        ];
        assert!(shared.put_weights(&weights).await);
        let got = shared.get_weights().await.unwrap();
        assert_eq!(got, weights);
        assert!(shared.last_weight_update().await.is_some());
    }

    #[tokio::test]
    async fn test_proxy_config_stamp_advances() {
        let (_, shared) = shared("i1");
        assert!(shared.put_proxy_config("upstream a {}").await);
        let first = shared.last_proxy_update().await.unwrap();
        assert_eq!(
            shared.get_proxy_config().await.unwrap(),
            "upstream a {}".to_string()
        );
        shared.put_proxy_config("upstream b {}").await;
        let second = shared.last_proxy_update().await.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_heartbeat_membership() {
        let store = Arc::new(MemoryStore::new());
        let a = SharedState::new(
            store.clone(),
            KeyLayout::default(),
            TtlSettings::default(),
            "a",
        );
        let b = SharedState::new(
            store.clone(),
            KeyLayout::default(),
            TtlSettings::default(),
            "b",
        );
        a.heartbeat().await;
        b.heartbeat().await;
        assert_eq!(a.active_instances().await, vec!["a", "b"]);

        // Expired heartbeats drop out of membership.
        store.force_expire("instance:b");
        assert_eq!(a.active_instances().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion_and_owner_release() {
        let store = Arc::new(MemoryStore::new());
        let a = SharedState::new(
            store.clone(),
            KeyLayout::default(),
            TtlSettings::default(),
            "a",
        );
        let b = SharedState::new(
            store.clone(),
            KeyLayout::default(),
            TtlSettings::default(),
            "b",
        );
        assert!(a.try_lock("weight-calculation", Duration::from_secs(30)).await);
        assert!(!b.try_lock("weight-calculation", Duration::from_secs(30)).await);

        // Non-owner release is a no-op: the key must survive.
        b.release_lock("weight-calculation").await;
        assert!(!b.try_lock("weight-calculation", Duration::from_secs(30)).await);

        a.release_lock("weight-calculation").await;
        assert!(b.try_lock("weight-calculation", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_cleanup_expired_metrics() {
        let (store, shared) = shared("i1");
        shared.put_metric("a", &sample("a", 1.0)).await;
        shared.put_metric("b", &sample("b", 2.0)).await;
        store.force_expire("metrics:b");
        // The expired entry is invisible to scans, so nothing to delete; the
        // live one stays.
        let cleaned = shared.cleanup_expired_metrics().await;
        assert_eq!(cleaned, 0);
        assert!(shared.get_metric("a").await.is_some());
    }

    #[tokio::test]
    async fn test_config_blob_roundtrip() {
        let (_, shared) = shared("i1");
        shared
            .put_config_blob("answer", &serde_json::json!({"value": 42}))
            .await;
        let blob: serde_json::Value = shared.get_config_blob("answer").await.unwrap();
        assert_eq!(blob["value"], 42);
    }
}
