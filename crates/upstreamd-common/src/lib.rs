//! Shared foundation for the upstreamd control plane.
//!
//! This crate holds everything the other workspace members agree on: the
//! error type, the domain models (metric samples, weight allocations, server
//! descriptors, per-server policies, weight factors) and the deployment
//! configuration. It is deliberately free of I/O so the weight engine and
//! its tests stay pure.

pub mod config;
pub mod error;
pub mod model;

pub use config::DaemonConfig;
pub use error::{ControlError, Result};
