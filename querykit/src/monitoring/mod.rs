pub mod metrics;

pub use metrics::Metrics;

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    Metrics::gather_metrics()
}
