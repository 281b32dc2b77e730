// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_histogram, histogram, increment_counter};

// NOTE: When observability feature is disabled, the macros below compile to nothing
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_histogram, histogram, increment_counter};

use std::time::Duration;

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_counter!("sync_rows_fetched_total", "Source rows fetched by the transfer engine.");
    describe_counter!("sync_rows_inserted_total", "Rows written to the sink.");
    describe_counter!(
        "sync_rows_failed_total",
        "Rows dropped by the transfer (label stage=convert|insert)."
    );
    describe_histogram!("sync_batch_write_ms", "Duration of one sink batch write.");
    describe_histogram!("sync_batch_size", "Rows per sink batch write.");
    describe_counter!("sync_batch_fallbacks_total", "Batches that fell back to row-by-row inserts.");
    describe_counter!("enrich_geocoder_requests_total", "Geocoding requests sent.");
    describe_counter!("enrich_quota_exhausted_total", "Geocoding quota responses per credential rotation.");
    describe_counter!(
        "enrich_records_saved_total",
        "Store characteristic records inserted (label source=geocoder|heuristic)."
    );
}

#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn increment_rows_fetched(count: u64) {
    counter!("sync_rows_fetched_total", count);
}

pub fn increment_rows_inserted(count: u64) {
    counter!("sync_rows_inserted_total", count);
}

pub fn increment_failed_rows(stage: &'static str, count: u64) {
    if count > 0 {
        counter!("sync_rows_failed_total", count, "stage" => stage);
    }
}

pub fn record_batch_write(duration: Duration, rows: usize, fallback: bool) {
    histogram!("sync_batch_write_ms", duration.as_millis() as f64);
    histogram!("sync_batch_size", rows as f64);
    if fallback {
        increment_counter!("sync_batch_fallbacks_total");
    }
}

pub fn increment_geocoder_request() {
    increment_counter!("enrich_geocoder_requests_total");
}

pub fn increment_quota_exhausted(credential: &str) {
    increment_counter!("enrich_quota_exhausted_total", "credential" => credential.to_string());
}

pub fn increment_records_saved(source: &'static str) {
    increment_counter!("enrich_records_saved_total", "source" => source);
}
