//! Periodic task ownership.
//!
//! Each concern runs as its own spawned task: heartbeat, the weight cycle
//! (which also listens on the ingestor's recompute channel), drift
//! reconciliation, hot-store cleanup and the nightly archive prune. All of
//! them select on a broadcast shutdown signal and exit cleanly; an in-flight
//! cycle finishes (and releases its lock) before its task returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use upstreamd_common::config::IntervalSettings;
use upstreamd_store::{MetricsArchive, SharedState};

use crate::coordinator::Coordinator;
use crate::ingest::RecomputeReason;
use crate::nginx::NginxMaterializer;
use crate::reconcile::DriftReconciler;

/// Local wall-clock time of the nightly archive prune.
const ARCHIVE_PRUNE_TIME: (u32, u32) = (2, 0);

pub struct Scheduler {
    shared: Arc<SharedState>,
    coordinator: Arc<Coordinator>,
    materializer: Arc<NginxMaterializer>,
    reconciler: Arc<DriftReconciler>,
    archive: Arc<MetricsArchive>,
    intervals: IntervalSettings,
    retention_days: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SharedState>,
        coordinator: Arc<Coordinator>,
        materializer: Arc<NginxMaterializer>,
        reconciler: Arc<DriftReconciler>,
        archive: Arc<MetricsArchive>,
        intervals: IntervalSettings,
        retention_days: i64,
    ) -> Self {
        Self {
            shared,
            coordinator,
            materializer,
            reconciler,
            archive,
            intervals,
            retention_days,
        }
    }

    /// Spawns every periodic task. The returned handles complete once the
    /// shutdown sender fires.
    pub fn spawn_all(
        self: Arc<Self>,
        mut recompute_rx: mpsc::Receiver<RecomputeReason>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Heartbeat: membership is heartbeat keys with unexpired TTLs, so a
        // dead instance deregisters itself by going silent.
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(scheduler.intervals.heartbeat_secs));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            scheduler.shared.heartbeat().await;
                            debug!(
                                instance = scheduler.shared.instance_id(),
                                "heartbeat published"
                            );
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                info!("heartbeat task stopped");
            }));
        }

        // Weight cycle: periodic tick plus the ingestor's quorum signal.
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scheduler.intervals.weight_cycle_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            scheduler.run_cycle().await;
                        }
                        reason = recompute_rx.recv() => {
                            match reason {
                                Some(reason) => {
                                    debug!(?reason, "recompute requested");
                                    scheduler.run_cycle().await;
                                }
                                None => break,
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                info!("weight cycle task stopped");
            }));
        }

        // Drift reconcile: every instance pulls newer configs.
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scheduler.intervals.config_sync_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            scheduler.reconciler.sync_once().await;
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                info!("drift reconcile task stopped");
            }));
        }

        // Hot-store cleanup.
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scheduler.intervals.metrics_cleanup_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            scheduler.shared.cleanup_expired_metrics().await;
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                info!("hot-store cleanup task stopped");
            }));
        }

        // Nightly archive prune.
        {
            let scheduler = self.clone();
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let wait = until_next_prune();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            match scheduler.archive.prune_older_than(scheduler.retention_days) {
                                Ok(dropped) => {
                                    info!(dropped, "archive prune completed")
                                }
                                Err(e) => warn!(error = %e, "archive prune failed"),
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                info!("archive prune task stopped");
            }));
        }

        handles
    }

    async fn run_cycle(&self) {
        let outcome = self
            .coordinator
            .run_cycle_and_materialize(&self.materializer)
            .await;
        debug!(?outcome, "weight cycle finished");
    }
}

/// Duration until the next local occurrence of the prune time.
fn until_next_prune() -> Duration {
    let (hour, minute) = ARCHIVE_PRUNE_TIME;
    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap();
    let mut target = now.date_naive().and_time(target_time);
    if target <= now.naive_local() {
        target += chrono::Duration::days(1);
    }
    match Local.from_local_datetime(&target).earliest() {
        Some(next) => (next - now)
            .to_std()
            .unwrap_or(Duration::from_secs(24 * 3600)),
        // A nonexistent local time (DST gap) pushes the prune out a day.
        None => Duration::from_secs(24 * 3600),
    }
}
