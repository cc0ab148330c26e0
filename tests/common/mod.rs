use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use forecast_gateway::{
    config::AppConfig, errors::ServiceError, ml::PredictionEngine, models::FeatureRow, AppState,
};
use serde_json::Value;
use tower::ServiceExt;

/// What the stub engine answers with
#[derive(Clone)]
#[allow(dead_code)]
pub enum StubReply {
    Value(f64),
    Upstream(String),
    Empty,
}

/// Engine double that records every feature row it is asked to score
pub struct RecordingEngine {
    reply: StubReply,
    calls: Mutex<Vec<FeatureRow>>,
}

impl RecordingEngine {
    pub fn new(reply: StubReply) -> Self {
        Self {
            reply,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<FeatureRow> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

#[async_trait]
impl PredictionEngine for RecordingEngine {
    async fn predict(&self, row: &FeatureRow) -> Result<f64, ServiceError> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push(row.clone());

        match &self.reply {
            StubReply::Value(v) => Ok(*v),
            StubReply::Upstream(msg) => Err(ServiceError::UpstreamError(msg.clone())),
            StubReply::Empty => Err(ServiceError::EmptyResult),
        }
    }
}

/// Helper harness wiring the full router around a stub engine.
pub struct TestApp {
    router: Router,
    pub engine: Arc<RecordingEngine>,
}

impl TestApp {
    pub fn new(reply: StubReply) -> Self {
        Self::with_config(test_config(), reply)
    }

    pub fn with_config(cfg: AppConfig, reply: StubReply) -> Self {
        let engine = Arc::new(RecordingEngine::new(reply));
        let state = AppState::new(cfg, engine.clone());
        let router = forecast_gateway::app_router(state).expect("router should build");

        Self { router, engine }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("failed to build request"),
            None => builder.body(Body::empty()).expect("failed to build request"),
        };

        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("failed to build request");

        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "demo-project.sales.m_sales_lr".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.cors_allow_any_origin = true;
    cfg
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub async fn response_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    String::from_utf8_lossy(&bytes).into_owned()
}
