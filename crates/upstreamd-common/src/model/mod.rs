pub mod allocation;
pub mod factors;
pub mod metrics;
pub mod policy;
pub mod server;

pub use allocation::WeightAllocation;
pub use factors::WeightFactors;
pub use metrics::MetricSample;
pub use policy::{PolicyPatch, ServerPolicy};
pub use server::{Pool, ServerDescriptor};
