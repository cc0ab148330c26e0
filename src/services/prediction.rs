use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

use crate::errors::ServiceError;
use crate::metrics;
use crate::ml::PredictionEngine;
use crate::models::{ForecastRequest, PredictionResult};

/// Validates forecast requests and runs them through the prediction engine
#[derive(Clone)]
pub struct PredictionService {
    engine: Arc<dyn PredictionEngine>,
    known_skus: Arc<Vec<String>>,
    timeout: Duration,
}

impl PredictionService {
    pub fn new(engine: Arc<dyn PredictionEngine>, known_skus: Vec<String>, timeout: Duration) -> Self {
        Self {
            engine,
            known_skus: Arc::new(known_skus),
            timeout,
        }
    }

    /// Handles a raw JSON body end to end, recording the outcome
    pub async fn predict_json(&self, body: Value) -> Result<PredictionResult, ServiceError> {
        let result = match ForecastRequest::from_json(body, &self.known_skus) {
            Ok(request) => self.predict(&request).await,
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_prediction(outcome);

        result
    }

    /// Runs one inference for an already validated request.
    ///
    /// The engine is called exactly once; a timeout surfaces as
    /// [`ServiceError::Timeout`] and is not retried.
    #[instrument(skip(self, request), fields(sku = %request.sku, date = %request.date))]
    pub async fn predict(&self, request: &ForecastRequest) -> Result<PredictionResult, ServiceError> {
        let row = request.features();
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, self.engine.predict(&row)).await;
        let elapsed = started.elapsed();
        metrics::observe_upstream_latency(elapsed);

        let predicted_sales = match outcome {
            Ok(result) => result?,
            Err(_) => return Err(ServiceError::Timeout(self.timeout)),
        };

        info!(
            predicted_sales,
            temp_diff = row.temp_diff,
            dow = row.day_of_week,
            duration_ms = %elapsed.as_millis(),
            "prediction completed"
        );

        Ok(PredictionResult { predicted_sales })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::MockPredictionEngine;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "date": "2024-01-15",
            "sku": "onion",
            "yesterday_sales": 22,
            "week_avg_sales": 20,
            "today_temp": 8,
            "yesterday_temp": 9
        })
    }

    fn service(engine: MockPredictionEngine) -> PredictionService {
        PredictionService::new(Arc::new(engine), Vec::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn valid_request_calls_engine_once() {
        let mut engine = MockPredictionEngine::new();
        engine
            .expect_predict()
            .withf(|row| row.temp_diff == -1.0 && row.day_of_week == 2 && row.sku == "onion")
            .times(1)
            .returning(|_| Ok(23.5));

        let result = service(engine).predict_json(sample()).await.unwrap();
        assert_eq!(result.predicted_sales, 23.5);
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_engine() {
        let mut engine = MockPredictionEngine::new();
        engine.expect_predict().times(0);

        let mut body = sample();
        body.as_object_mut().unwrap().remove("today_temp");

        let err = service(engine).predict_json(body).await.unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn engine_errors_propagate_unchanged() {
        let mut engine = MockPredictionEngine::new();
        engine
            .expect_predict()
            .times(1)
            .returning(|_| Err(ServiceError::EmptyResult));

        let err = service(engine).predict_json(sample()).await.unwrap_err();
        assert_matches!(err, ServiceError::EmptyResult);
    }

    struct SlowEngine;

    #[async_trait::async_trait]
    impl PredictionEngine for SlowEngine {
        async fn predict(&self, _row: &crate::models::FeatureRow) -> Result<f64, ServiceError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out() {
        let service =
            PredictionService::new(Arc::new(SlowEngine), Vec::new(), Duration::from_secs(2));

        let err = service.predict_json(sample()).await.unwrap_err();
        assert_matches!(err, ServiceError::Timeout(d) if d == Duration::from_secs(2));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
