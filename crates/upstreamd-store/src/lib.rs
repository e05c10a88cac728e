//! Storage layer for the upstreamd control plane.
//!
//! Two stores with very different lifetimes live here:
//!
//! - the **shared state** store ([`SharedState`]), a typed facade over a
//!   remote key-value store (Redis in production, [`MemoryStore`] in tests
//!   and degraded single-instance operation) holding the hot metrics,
//!   current weights, the rendered proxy config, instance heartbeats and
//!   advisory locks, each category with its own TTL;
//! - the **metrics archive** ([`MetricsArchive`]), durable per-server JSONL
//!   files with a 7-day retention, consulted when the hot store comes up
//!   empty.

pub mod archive;
pub mod shared;
pub mod state;

pub use archive::MetricsArchive;
pub use shared::{InstanceHeartbeat, SharedState};
pub use state::{MemoryStore, RedisStore, StateStore};
