use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Forecast Gateway",
        version = "0.1.0",
        description = r#"
# Forecast Gateway

Predicts next-day unit sales for a SKU from recent sales and temperature.
Each request is answered by a single `ML.PREDICT` call against a trained
BigQuery ML regression model.

## Derived features

The gateway computes two features before calling the model:
- `temp_diff` = `today_temp - yesterday_temp`
- `dow` = day of week of `date`, 1 (Sunday) to 7 (Saturday)

## Error Handling

Errors share one body shape:

```json
{
  "error": "Bad Request",
  "message": "Validation error: missing field `sku`",
  "request_id": "0b6f...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```

- `400` invalid input, the model was not called
- `500` the model returned no rows
- `502` the prediction service failed or timed out
        "#
    ),
    tags(
        (name = "Forecast", description = "Sales predictions"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::health::root,
        crate::handlers::health::health,
        crate::handlers::forecast::predict,
    ),
    components(
        schemas(
            crate::models::ForecastPayload,
            crate::models::PredictionResult,
            crate::handlers::health::RootResponse,
            crate::handlers::health::HealthResponse,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDoc::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_all_routes() {
        let openapi = ApiDoc::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Forecast Gateway"));
        assert!(json.contains("\"/predict\""));
        assert!(json.contains("\"/health\""));
        assert!(json.contains("ForecastPayload"));
    }
}
