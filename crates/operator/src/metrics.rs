use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref JOBS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "openfero_jobs_created_total",
        "Total number of remediation jobs observed as created."
    )
    .expect("metric can be created");
    pub static ref JOBS_SUCCEEDED_TOTAL: IntCounter = IntCounter::new(
        "openfero_jobs_succeeded_total",
        "Total number of remediation jobs that completed successfully."
    )
    .expect("metric can be created");
    pub static ref JOBS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "openfero_jobs_failed_total",
        "Total number of remediation jobs that failed or could not be submitted."
    )
    .expect("metric can be created");
}

/// Register the job counters with the exposition registry. Safe to call more
/// than once.
pub fn register_metrics() {
    for counter in [&*JOBS_CREATED_TOTAL, &*JOBS_SUCCEEDED_TOTAL, &*JOBS_FAILED_TOTAL] {
        // AlreadyReg on repeated calls
        let _ = REGISTRY.register(Box::new(counter.clone()));
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
