// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the stock service, scraped from /metrics.
//
// Counters end in _total, latencies are histograms in seconds. Label values
// are small closed sets (adjustment type, outcome, resource) so cardinality
// stays bounded; product ids never become labels.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/delete)
pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";

/// Labels: adjustment_type (entrada/saida/ajuste/absolute), outcome
pub const STOCK_ADJUSTMENTS_TOTAL: &str = "stock_adjustments_total";

/// Labels: resource, outcome (ok/failed)
pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";

/// Labels: result (hit/miss)
pub const CACHE_LOOKUPS_TOTAL: &str = "cache_lookups_total";

pub const INVENTORY_LOW_STOCK_PRODUCTS: &str = "inventory_low_stock_products";

// =============================================================================
// SETUP
// =============================================================================
/// Install the global Prometheus recorder and return the handle `/metrics`
/// renders from.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(CACHE_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(
        CACHE_OPERATION_DURATION_SECONDS,
        "Cache backend operation latency in seconds"
    );
    describe_counter!(
        STOCK_ADJUSTMENTS_TOTAL,
        "Stock adjustment attempts by type and outcome"
    );
    describe_counter!(
        CACHE_INVALIDATIONS_TOTAL,
        "Cache keys invalidated after stock changes, by resource"
    );
    describe_counter!(CACHE_LOOKUPS_TOTAL, "Read-through cache lookups by result");
    describe_gauge!(
        INVENTORY_LOW_STOCK_PRODUCTS,
        "Products at or below their minimum stock at the last alert read"
    );

    Ok(handle)
}

// =============================================================================
// HELPERS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_cache_operation(operation: &str, duration_secs: f64) {
    histogram!(
        CACHE_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// `outcome` is "applied" or the error kind that ended the attempt.
pub fn record_adjustment(adjustment_type: &str, outcome: &str) {
    counter!(
        STOCK_ADJUSTMENTS_TOTAL,
        "adjustment_type" => adjustment_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_invalidation(resource: &str, outcome: &str) {
    counter!(
        CACHE_INVALIDATIONS_TOTAL,
        "resource" => resource.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_cache_lookup(result: &str) {
    counter!(CACHE_LOOKUPS_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn set_low_stock_count(count: usize) {
    gauge!(INVENTORY_LOW_STOCK_PRODUCTS).set(count as f64);
}
