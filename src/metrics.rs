/// Prometheus metrics for the TuneTrail serving plane
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== HTTP ==========

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ========== Auth & gating ==========

    pub static ref AUTH_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "auth_failures_total",
        "Credential verification failures by kind",
        &["kind"]
    )
    .unwrap();

    pub static ref GATE_DENIALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gate_denials_total",
        "Quota/plan/feature gate denials by reason",
        &["reason"]
    )
    .unwrap();

    pub static ref QUOTA_FAIL_OPEN_TOTAL: IntCounter = register_int_counter!(
        "quota_fail_open_total",
        "Requests admitted because the cache was unavailable"
    )
    .unwrap();

    // ========== Cache ==========

    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_hits_total",
        "Total number of cache hits",
        &["cache_type"]
    )
    .unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_misses_total",
        "Total number of cache misses",
        &["cache_type"]
    )
    .unwrap();

    // ========== Recommendation dispatch ==========

    pub static ref ENGINE_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "engine_requests_total",
        "Recommendation engine calls by kind and outcome",
        &["kind", "outcome"]
    )
    .unwrap();

    pub static ref ENGINE_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "engine_request_duration_seconds",
        "Recommendation engine call latencies in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap();

    pub static ref STALE_SERVED_TOTAL: IntCounter = register_int_counter!(
        "recommendation_stale_served_total",
        "Recommendations served from stale cache after an engine failure"
    )
    .unwrap();

    pub static ref IMPRESSION_BUFFER_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "impression_buffer_dropped_total",
        "Impressions dropped because the write buffer overflowed"
    )
    .unwrap();

    pub static ref IMPRESSION_BUFFER_DEPTH: IntGauge = register_int_gauge!(
        "impression_buffer_depth",
        "Impressions currently queued for background persistence"
    )
    .unwrap();

    // ========== Sessions ==========

    pub static ref SESSIONS_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        "sessions_expired_total",
        "Listening sessions expired by the background sweep"
    )
    .unwrap();

    // ========== Background jobs ==========

    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Background job executions by job type and status",
        &["job_type", "status"]
    )
    .unwrap();
}

/// Render all metrics in the Prometheus text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metrics() {
        IMPRESSION_BUFFER_DROPPED_TOTAL.inc();
        let text = render();
        assert!(text.contains("impression_buffer_dropped_total"));
    }
}
