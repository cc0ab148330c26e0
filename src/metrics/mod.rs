/*!
 * # Metrics Module
 *
 * Prometheus metrics for the prediction path, exposed in text format at
 * `/metrics`.
 *
 * - `forecast_predictions_total{outcome}`: finished `/predict` calls by outcome
 * - `forecast_upstream_latency_seconds`: time spent waiting on the model
 */

use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

struct PredictionMetrics {
    predictions: IntCounterVec,
    upstream_latency: Histogram,
}

impl PredictionMetrics {
    fn register(registry: &Registry) -> Self {
        let predictions = IntCounterVec::new(
            Opts::new(
                "forecast_predictions_total",
                "Total number of prediction requests by outcome",
            ),
            &["outcome"],
        )
        .expect("metric can be created");

        let upstream_latency = Histogram::with_opts(
            HistogramOpts::new(
                "forecast_upstream_latency_seconds",
                "Latency of calls to the prediction engine",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("metric can be created");

        registry
            .register(Box::new(predictions.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(upstream_latency.clone()))
            .expect("metric can be registered");

        Self {
            predictions,
            upstream_latency,
        }
    }
}

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref METRICS: PredictionMetrics = PredictionMetrics::register(&REGISTRY);
}

/// Counts one finished prediction request
pub fn record_prediction(outcome: &str) {
    METRICS.predictions.with_label_values(&[outcome]).inc();
}

/// Records how long the upstream engine took
pub fn observe_upstream_latency(elapsed: Duration) {
    METRICS.upstream_latency.observe(elapsed.as_secs_f64());
}

/// Current count for an outcome label
pub fn prediction_count(outcome: &str) -> u64 {
    METRICS.predictions.with_label_values(&[outcome]).get()
}

/// Renders all registered metrics in Prometheus text format
pub fn render() -> Result<String, MetricsError> {
    // Touch the lazy set so an idle process still exports the metric families
    let _ = &METRICS.predictions;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MetricsError::ExportError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
}

pub async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("metrics export failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics error"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_outcomes_show_up_in_export() {
        let before = prediction_count("metrics_test");
        record_prediction("metrics_test");
        observe_upstream_latency(Duration::from_millis(120));

        assert_eq!(prediction_count("metrics_test"), before + 1);

        let text = render().unwrap();
        assert!(text.contains("forecast_predictions_total"));
        assert!(text.contains("forecast_upstream_latency_seconds_bucket"));
    }
}
