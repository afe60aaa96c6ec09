//! Observability: structured logging and Prometheus metrics.
//!
//! Metric recording functions are always callable; without the
//! `prometheus` feature they compile to nothing.

pub mod metrics;
mod tracing_init;

pub use tracing_init::*;
