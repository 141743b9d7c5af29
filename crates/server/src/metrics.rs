//! Prometheus metrics for the redirector front end.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "windrose_requests_total",
            "Dispatched repository requests by renderer",
        ),
        &["renderer"],
    )
    .expect("metric creation failed")
});

pub static REDIRECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("windrose_redirects_total", "302 redirects served")
        .expect("metric creation failed")
});

pub static FALLBACKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "windrose_fallbacks_total",
        "Requests answered from configured fallback mirrors",
    )
    .expect("metric creation failed")
});

pub static SELECTION_EMPTY_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "windrose_selection_empty_total",
        "Requests for which no eligible mirror was found",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REDIRECTS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FALLBACKS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SELECTION_EMPTY_TOTAL.clone()))
            .expect("metric registration failed");
    });
}

/// `GET /metrics`.
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        REQUESTS_TOTAL.with_label_values(&["redirect"]).inc();
        assert!(REQUESTS_TOTAL.with_label_values(&["redirect"]).get() >= 1);
    }
}
