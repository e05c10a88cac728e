//! Control-plane logic for upstreamd.
//!
//! The flow through this crate mirrors the life of one metric sample:
//! [`ingest`] validates it, smooths its latency and persists it; when enough
//! of the fleet has reported, the [`coordinator`] takes the cross-instance
//! lock and runs the [`engine`] over each pool, consulting per-server
//! [`policy`] overrides; the [`nginx`] materializer renders, validates,
//! writes and reloads the proxy config and publishes it to the shared store;
//! [`reconcile`] pulls newer configs written by sibling instances; the
//! [`scheduler`] owns every periodic task and the shutdown path.

pub mod coordinator;
pub mod engine;
pub mod ingest;
pub mod nginx;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod scheduler;

pub use coordinator::{Coordinator, CycleOutcome};
pub use engine::WeightEngine;
pub use ingest::{IngestOutcome, MetricsIngestor, RecomputeReason};
pub use nginx::{NginxMaterializer, render_dual_upstream, validate_config};
pub use policy::PolicyStore;
pub use reconcile::{DriftReconciler, SyncOutcome};
pub use registry::ServerRegistry;
pub use scheduler::Scheduler;
