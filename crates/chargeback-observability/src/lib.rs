//! Chargeback Archiver Observability
//!
//! Prometheus metrics for the consume-archive-commit pipeline and an HTTP
//! router that exposes them.
//!
//! # Usage
//!
//! ```no_run
//! use chargeback_observability::{exporter, metrics};
//!
//! // Register all metrics with the global registry
//! metrics::init();
//!
//! // Router serving GET /metrics
//! let metrics_router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init();
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
