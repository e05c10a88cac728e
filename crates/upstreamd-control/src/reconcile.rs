//! Drift reconciliation.
//!
//! Non-leader instances converge on the leader's proxy config by polling the
//! shared store: a strictly newer update stamp than what is applied locally
//! pulls the blob, and a content difference applies it through the
//! materializer's write+reload path. The operation is idempotent and needs
//! no lock; last writer wins.

use std::sync::Arc;

use tracing::{debug, info, warn};

use upstreamd_store::SharedState;

use crate::nginx::NginxMaterializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing in the shared store, or nothing newer than local.
    UpToDate,
    /// A newer stamp pointed at content identical to what runs locally;
    /// only the local stamp advanced.
    StampOnly,
    /// A newer artifact was applied locally.
    Applied,
    /// A newer artifact was found but applying it failed.
    Failed,
}

pub struct DriftReconciler {
    shared: Arc<SharedState>,
    materializer: Arc<NginxMaterializer>,
}

impl DriftReconciler {
    pub fn new(shared: Arc<SharedState>, materializer: Arc<NginxMaterializer>) -> Self {
        Self {
            shared,
            materializer,
        }
    }

    pub async fn sync_once(&self) -> SyncOutcome {
        let Some(remote_stamp) = self.shared.last_proxy_update().await else {
            debug!("no proxy config stamp in shared store");
            return SyncOutcome::UpToDate;
        };

        if let Some(local_stamp) = self.materializer.last_applied().await {
            if remote_stamp <= local_stamp {
                return SyncOutcome::UpToDate;
            }
        }

        let Some(remote_config) = self.shared.get_proxy_config().await else {
            debug!("proxy config stamp without a blob");
            return SyncOutcome::UpToDate;
        };

        if self.materializer.current().await.as_deref() == Some(remote_config.as_str()) {
            self.materializer
                .note_applied(remote_config, remote_stamp)
                .await;
            return SyncOutcome::StampOnly;
        }

        info!(stamp = %remote_stamp, "adopting newer proxy config from shared state");
        match self.materializer.apply(&remote_config, remote_stamp).await {
            Ok(()) => SyncOutcome::Applied,
            Err(e) => {
                warn!(error = %e, "failed to apply synced proxy config");
                SyncOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use upstreamd_common::config::{KeyLayout, NginxSettings, TtlSettings};
    use upstreamd_common::model::WeightAllocation;
    use upstreamd_store::{MemoryStore, SharedState};

    use crate::nginx::render_dual_upstream;

    struct Fixture {
        reconciler: DriftReconciler,
        shared: Arc<SharedState>,
        materializer: Arc<NginxMaterializer>,
        dir: TempDir,
    }

    fn fixture(store: Arc<MemoryStore>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let shared = Arc::new(SharedState::new(
            store,
            KeyLayout::default(),
            TtlSettings::default(),
            "follower",
        ));
        let settings = NginxSettings {
            config_dir: dir.path().to_str().unwrap().to_string(),
            config_file: "upstream.conf".to_string(),
            reload_command: "true".to_string(),
            backup_enabled: false,
        };
        let materializer = Arc::new(NginxMaterializer::new(settings, shared.clone()));
        let reconciler = DriftReconciler::new(shared.clone(), materializer.clone());
        Fixture {
            reconciler,
            shared,
            materializer,
            dir,
        }
    }

    fn rendered(weight: u32) -> String {
        render_dual_upstream(
            &[],
            &[WeightAllocation::new("out1", "b.example.com", weight, 0.9, "t")],
            "2025-06-01T12:00:00Z".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_sync_with_empty_store_is_noop() {
        let fixture = fixture(Arc::new(MemoryStore::new()));
        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::UpToDate);
        assert!(fixture.materializer.current().await.is_none());
    }

    #[tokio::test]
    async fn test_sync_adopts_newer_config() {
        let fixture = fixture(Arc::new(MemoryStore::new()));
        fixture.shared.put_proxy_config(&rendered(100)).await;

        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::Applied);
        let written =
            std::fs::read_to_string(fixture.dir.path().join("upstream.conf")).unwrap();
        assert_eq!(written, rendered(100));
        assert!(fixture.materializer.last_applied().await.is_some());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let fixture = fixture(Arc::new(MemoryStore::new()));
        fixture.shared.put_proxy_config(&rendered(100)).await;

        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::Applied);
        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_sync_same_content_advances_stamp_only() {
        let fixture = fixture(Arc::new(MemoryStore::new()));
        let config = rendered(100);

        // Locally applied at an old stamp, then republished remotely with a
        // newer stamp but identical content.
        let old_stamp = Utc::now() - chrono::Duration::minutes(5);
        fixture.materializer.apply(&config, old_stamp).await.unwrap();
        fixture.shared.put_proxy_config(&config).await;

        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::StampOnly);
        let local = fixture.materializer.last_applied().await.unwrap();
        assert!(local > old_stamp);
    }

    #[tokio::test]
    async fn test_sync_applies_changed_content() {
        let fixture = fixture(Arc::new(MemoryStore::new()));
        let old_stamp = Utc::now() - chrono::Duration::minutes(5);
        fixture
            .materializer
            .apply(&rendered(50), old_stamp)
            .await
            .unwrap();

        fixture.shared.put_proxy_config(&rendered(100)).await;
        assert_eq!(fixture.reconciler.sync_once().await, SyncOutcome::Applied);
        assert_eq!(fixture.materializer.current().await.unwrap(), rendered(100));
    }
}
