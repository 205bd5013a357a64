//! Shared error types, identifiers, and observability primitives for VertexFlow crates.
//!
//! Architecture role:
//! - provides the common [`VfError`] / [`Result`] contracts
//! - defines typed execution/worker identifiers used across the control plane
//! - hosts the Prometheus metrics registry

pub mod error;
pub mod ids;
pub mod metrics;

pub use error::{Result, VfError};
pub use ids::{ExecutionId, WorkerId};
pub use metrics::MetricsRegistry;
