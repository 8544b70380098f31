use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Latency of the full middleware chain per request.
pub(crate) static REQUEST_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "proxy_request_duration_seconds",
        "Latency of requests handled by the proxy"
    )
    .expect("register proxy_request_duration_seconds")
});

pub(crate) static REQUEST_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "proxy_request_status_total",
        "Responses issued by the proxy, by status code and method",
        &["code", "method"]
    )
    .expect("register proxy_request_status_total")
});

/// Token-endpoint grants, labelled `exchange` or `renew`.
pub(crate) static OAUTH_TOKENS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "oauth_tokens_total",
        "Token grants performed against the provider",
        &["action"]
    )
    .expect("register oauth_tokens_total")
});

pub(crate) static OAUTH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "oauth_latency_seconds",
        "Latency of token grants against the provider",
        &["action"]
    )
    .expect("register oauth_latency_seconds")
});

pub(crate) static CLIENT_CANCELLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_client_cancelled_total",
        "Requests abandoned by the client before a response was written"
    )
    .expect("register proxy_client_cancelled_total")
});

/// Touch every metric so the exposition is complete from the first scrape.
pub(crate) fn init() {
    Lazy::force(&REQUEST_LATENCY);
    Lazy::force(&REQUEST_STATUS);
    Lazy::force(&OAUTH_TOKENS);
    Lazy::force(&OAUTH_LATENCY);
    Lazy::force(&CLIENT_CANCELLED);
}

/// Prometheus text exposition of the default registry.
pub(crate) fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("unable to encode metrics: {err}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
