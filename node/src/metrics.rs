//! # Prometheus Metrics
//!
//! Operational metrics for the authentication server, scraped at the
//! `/metrics` endpoint on the dedicated metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they don't
//! collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the server.
///
/// Clone-friendly (prometheus handles are internally shared) so it can be
/// passed to request handlers and background tasks alike.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Registry that owns all metrics below.
    registry: Registry,
    /// Total protocol rounds handled at the auth endpoint.
    pub auth_rounds_total: IntCounter,
    /// Rounds that ended with COMMAND_FAILED set.
    pub auth_failures_total: IntCounter,
    /// Rounds that logged a session in.
    pub logins_total: IntCounter,
    /// Login-page nuts minted at the nut endpoint.
    pub nuts_issued_total: IntCounter,
    /// End-to-end auth round latency in seconds.
    pub auth_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("sqrl".into()), None)
            .expect("failed to create prometheus registry");

        let auth_rounds_total = IntCounter::new(
            "auth_rounds_total",
            "Total protocol rounds handled at the auth endpoint",
        )
        .expect("metric creation");
        registry
            .register(Box::new(auth_rounds_total.clone()))
            .expect("metric registration");

        let auth_failures_total = IntCounter::new(
            "auth_failures_total",
            "Protocol rounds that ended with COMMAND_FAILED",
        )
        .expect("metric creation");
        registry
            .register(Box::new(auth_failures_total.clone()))
            .expect("metric registration");

        let logins_total = IntCounter::new("logins_total", "Protocol rounds that logged a session in")
            .expect("metric creation");
        registry
            .register(Box::new(logins_total.clone()))
            .expect("metric registration");

        let nuts_issued_total =
            IntCounter::new("nuts_issued_total", "Login-page nuts minted for rendering")
                .expect("metric creation");
        registry
            .register(Box::new(nuts_issued_total.clone()))
            .expect("metric registration");

        let auth_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "auth_latency_seconds",
                "End-to-end auth round processing latency in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(auth_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            auth_rounds_total,
            auth_failures_total,
            logins_total,
            nuts_issued_total,
            auth_latency_seconds,
        }
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler rendering `/metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = NodeMetrics::new();
        metrics.auth_rounds_total.inc();
        metrics.nuts_issued_total.inc_by(3);
        let text = metrics.encode().unwrap();
        assert!(text.contains("sqrl_auth_rounds_total 1"));
        assert!(text.contains("sqrl_nuts_issued_total 3"));
    }
}
