//! Forecast Gateway Library
//!
//! HTTP front end for a hosted sales-forecasting model: validates forecast
//! requests, derives model features, and runs one BigQuery ML prediction per call.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod middleware_helpers;
pub mod ml;
pub mod models;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::ml::PredictionEngine;
use crate::services::PredictionService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub predictions: PredictionService,
}

impl AppState {
    /// Wires the prediction service around an already constructed engine
    pub fn new(config: AppConfig, engine: Arc<dyn PredictionEngine>) -> Self {
        let predictions =
            PredictionService::new(engine, config.known_skus(), config.prediction_timeout());
        Self {
            config: Arc::new(config),
            predictions,
        }
    }
}

/// Builds the CORS layer described by the configuration
pub fn cors_layer(cfg: &AppConfig) -> Result<CorsLayer, ServiceError> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.should_allow_permissive_cors() {
        ::tracing::info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        Ok(CorsLayer::permissive())
    } else {
        Err(ServiceError::Config(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
                .to_string(),
        ))
    }
}

/// Full HTTP surface: health, prediction, metrics and API docs
pub fn app_router(state: AppState) -> Result<Router, ServiceError> {
    let cors = cors_layer(&state.config)?;
    let body_limit = state.config.max_body_size;

    let router = Router::<AppState>::new()
        .route("/", get(handlers::health::root))
        .route("/health", get(handlers::health::health))
        .route("/predict", post(handlers::forecast::predict))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(openapi::swagger_ui())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state);

    Ok(router)
}

#[cfg(test)]
mod cors_tests {
    use super::*;

    fn cfg(environment: &str) -> AppConfig {
        AppConfig::new(
            "demo-project.sales.m_sales_lr".into(),
            "127.0.0.1".into(),
            8080,
            environment.into(),
        )
    }

    #[test]
    fn production_without_origins_is_rejected() {
        assert!(cors_layer(&cfg("production")).is_err());
    }

    #[test]
    fn production_with_origins_is_accepted() {
        let mut cfg = cfg("production");
        cfg.cors_allowed_origins = Some("https://shop.example.com, ".into());
        assert!(cors_layer(&cfg).is_ok());
    }

    #[test]
    fn development_falls_back_to_permissive() {
        assert!(cors_layer(&cfg("development")).is_ok());
    }
}
