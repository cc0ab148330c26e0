use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of `GET /`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RootResponse {
    pub ok: bool,
    #[schema(example = "forecast-gateway is running; POST /predict to get a forecast")]
    pub message: String,
}

/// Body of `GET /health`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
}

/// Service banner
#[utoipa::path(
    get,
    path = "/",
    tag = "Health",
    responses((status = 200, description = "Service is up", body = RootResponse))
)]
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        ok: true,
        message: format!(
            "{} {} is running; POST /predict to get a forecast",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
    })
}

/// Liveness probe. Never consults the prediction engine.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Process is alive", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}
