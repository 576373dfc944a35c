// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, gauge, increment_counter};

// NOTE: When observability feature is disabled, provide stub implementations.
// Stubs still evaluate their values so helper arguments stay used.
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_gauge!("probe_registry_size", "Probes currently held by the registry.");
    describe_counter!("probes_added_total", "Probes added by archive refreshes.");
    describe_counter!("documents_indexed_total", "Documents accepted by the sink.");
    describe_counter!("documents_rejected_total", "Documents rejected item-by-item by the sink.");
    describe_counter!("batches_failed_total", "Batches aborted by a delivery error.");
    describe_counter!("unresolved_probes_total", "Distinct unresolved probe ids per run.");
    describe_counter!("parse_errors_total", "Payloads that failed to parse, by kind.");
}

/// Installs the Prometheus exporter on `addr` (e.g. `0.0.0.0:9000`).
#[cfg(feature = "observability")]
pub fn install_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn set_registry_size(size: usize) {
    gauge!("probe_registry_size", size as f64);
}

pub fn increment_probes_added(count: usize) {
    counter!("probes_added_total", count as u64);
}

pub fn increment_documents_indexed(count: usize) {
    counter!("documents_indexed_total", count as u64);
}

pub fn increment_documents_rejected(count: usize) {
    counter!("documents_rejected_total", count as u64);
}

pub fn increment_batches_failed() {
    increment_counter!("batches_failed_total");
}

pub fn increment_unresolved_probes() {
    increment_counter!("unresolved_probes_total");
}

pub fn increment_parse_errors(kind: &str) {
    increment_counter!("parse_errors_total", "kind" => kind.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_run_with_any_build() {
        describe_metrics();
        set_registry_size(3);
        increment_probes_added(3);
        increment_documents_indexed(2);
        increment_documents_rejected(1);
        increment_batches_failed();
        increment_unresolved_probes();
        increment_parse_errors("dns");
    }
}
