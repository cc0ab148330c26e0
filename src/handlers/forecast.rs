use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
};
use serde_json::Value;

use crate::{errors::ServiceError, models::PredictionResult, AppState};

/// Predict next-day sales for one SKU
#[utoipa::path(
    post,
    path = "/predict",
    tag = "Forecast",
    request_body = crate::models::ForecastPayload,
    responses(
        (status = 200, description = "Prediction computed", body = PredictionResult,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Missing or malformed field", body = crate::errors::ErrorResponse),
        (status = 413, description = "Request body exceeds the configured limit", body = crate::errors::ErrorResponse),
        (status = 500, description = "Model returned no rows", body = crate::errors::ErrorResponse),
        (status = 502, description = "Prediction service failed or timed out", body = crate::errors::ErrorResponse),
    )
)]
pub async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PredictionResult>, ServiceError> {
    let Json(body) = payload.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::PayloadTooLarge(rejection.body_text())
        } else {
            ServiceError::ValidationError(format!("invalid JSON body: {}", rejection.body_text()))
        }
    })?;

    let result = state.predictions.predict_json(body).await?;
    Ok(Json(result))
}
