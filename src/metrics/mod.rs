//! Metrics module
//!
//! Publishes engine statistics into a Prometheus registry for the
//! `/metrics` endpoint.

mod exporter;

pub use exporter::OffloadMetrics;
