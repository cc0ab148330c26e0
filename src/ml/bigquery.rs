/*!
 * # BigQuery ML client
 *
 * Runs `ML.PREDICT` over a single synthetic row through the BigQuery v2
 * REST API. User-supplied values never enter the SQL text: they travel as
 * named, typed query parameters. Only the model reference and the output
 * column (both operator configuration, both validated) are spliced in.
 */

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::credentials::TokenProvider;
use super::model_ref::ModelRef;
use super::PredictionEngine;
use crate::config::{AppConfig, AuthMode};
use crate::errors::ServiceError;
use crate::models::FeatureRow;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    static ref COLUMN_PATTERN: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,299}$").expect("column pattern compiles");
}

// ---- wire types -----------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
    /// Lets BigQuery deduplicate a resent request instead of running a second job
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameter {
    pub name: String,
    pub parameter_type: ParameterType,
    pub parameter_value: ParameterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterType {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterValue {
    pub value: String,
}

impl QueryParameter {
    fn new(name: &str, kind: &str, value: String) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: kind.to_string(),
            },
            parameter_value: ParameterValue { value },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableFieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

// ---- query construction ---------------------------------------------------

/// SQL text for a single-row `ML.PREDICT` against `model`
pub fn prediction_sql(model: &str, column: &str) -> String {
    format!(
        r#"SELECT {column}
FROM ML.PREDICT(
  MODEL {model},
  (
    SELECT
      @date AS date,
      @sku AS sku,
      @yesterday_sales AS yesterday_sales,
      @week_avg_sales AS week_avg_sales,
      @today_temp AS today_temp,
      @yesterday_temp AS yesterday_temp,
      @temp_diff AS temp_diff,
      @dow AS dow
  )
)"#
    )
}

/// Named parameters carrying the inputs and derived features
pub fn query_parameters(row: &FeatureRow) -> Vec<QueryParameter> {
    vec![
        QueryParameter::new("date", "DATE", row.date.format("%Y-%m-%d").to_string()),
        QueryParameter::new("sku", "STRING", row.sku.clone()),
        QueryParameter::new("yesterday_sales", "FLOAT64", row.yesterday_sales.to_string()),
        QueryParameter::new("week_avg_sales", "FLOAT64", row.week_avg_sales.to_string()),
        QueryParameter::new("today_temp", "FLOAT64", row.today_temp.to_string()),
        QueryParameter::new("yesterday_temp", "FLOAT64", row.yesterday_temp.to_string()),
        QueryParameter::new("temp_diff", "FLOAT64", row.temp_diff.to_string()),
        QueryParameter::new("dow", "INT64", row.day_of_week.to_string()),
    ]
}

// ---- client ---------------------------------------------------------------

/// Prediction engine backed by BigQuery ML
#[derive(Debug)]
pub struct BigQueryClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    location: Option<String>,
    sql: String,
    column: String,
    tokens: TokenProvider,
    job_timeout: Duration,
}

impl BigQueryClient {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        model: &ModelRef,
        column: impl Into<String>,
        tokens: TokenProvider,
        job_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let column = column.into();
        if !COLUMN_PATTERN.is_match(&column) {
            return Err(ServiceError::Config(format!(
                "'{}' is not a valid prediction column",
                column
            )));
        }

        let project_id = project_id.into();
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sql: prediction_sql(&model.quoted(&project_id), &column),
            project_id,
            location: None,
            column,
            tokens,
            job_timeout,
        })
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|l| !l.trim().is_empty());
        self
    }

    /// Builds the client described by the application configuration
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let model = cfg
            .model_ref()
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        let project_id = cfg
            .job_project_id()
            .map_err(|e| ServiceError::Config(e.to_string()))?;

        let tokens = match cfg
            .auth_mode()
            .map_err(|e| ServiceError::Config(e.to_string()))?
        {
            AuthMode::None => TokenProvider::Anonymous,
            AuthMode::Static => TokenProvider::Static(
                cfg.bigquery_access_token
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        ServiceError::Config("static auth mode without a token".to_string())
                    })?,
            ),
            AuthMode::Metadata => TokenProvider::metadata(cfg.bigquery_metadata_token_url.clone()),
        };

        Ok(Self::new(
            cfg.bigquery_api_base_url.clone(),
            project_id,
            &model,
            cfg.prediction_column.clone(),
            tokens,
            cfg.prediction_timeout(),
        )?
        .with_location(cfg.bigquery_location.clone()))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.job_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ServiceError> {
        Ok(match self.tokens.bearer(&self.http).await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn start_query(&self, row: &FeatureRow) -> Result<QueryResponse, ServiceError> {
        let body = QueryRequest {
            query: &self.sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: query_parameters(row),
            timeout_ms: self.timeout_ms(),
            request_id: Uuid::new_v4().to_string(),
            location: self.location.as_deref(),
        };

        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let request = self.authorize(self.http.post(url).json(&body)).await?;
        read_response(request.send().await?).await
    }

    async fn poll_results(&self, job: &JobReference) -> Result<QueryResponse, ServiceError> {
        let mut params = vec![("timeoutMs", self.timeout_ms().to_string())];
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            params.push(("location", location.to_string()));
        }

        let url = Url::parse_with_params(
            &format!(
                "{}/projects/{}/queries/{}",
                self.base_url, self.project_id, job.job_id
            ),
            &params,
        )
        .map_err(|e| ServiceError::UpstreamError(format!("invalid results URL: {}", e)))?;

        let request = self.authorize(self.http.get(url)).await?;
        read_response(request.send().await?).await
    }

    fn extract_prediction(&self, response: &QueryResponse) -> Result<f64, ServiceError> {
        if let Some(first) = response.errors.first() {
            return Err(ServiceError::UpstreamError(format!(
                "query failed: {} ({})",
                first.message.as_deref().unwrap_or("unknown error"),
                first.reason.as_deref().unwrap_or("no reason")
            )));
        }

        let row = response.rows.first().ok_or(ServiceError::EmptyResult)?;

        let index = response
            .schema
            .as_ref()
            .and_then(|schema| schema.fields.iter().position(|f| f.name == self.column))
            .ok_or_else(|| {
                ServiceError::UpstreamError(format!(
                    "result schema has no '{}' column",
                    self.column
                ))
            })?;

        let cell = row.f.get(index).ok_or_else(|| {
            ServiceError::UpstreamError("result row is shorter than its schema".to_string())
        })?;

        match &cell.v {
            Value::String(raw) => raw.trim().parse::<f64>().map_err(|_| {
                ServiceError::UpstreamError(format!("prediction '{}' is not numeric", raw))
            }),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ServiceError::UpstreamError("prediction out of range".to_string())),
            Value::Null => Err(ServiceError::UpstreamError(
                "model returned a null prediction".to_string(),
            )),
            other => Err(ServiceError::UpstreamError(format!(
                "unexpected prediction value {}",
                other
            ))),
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<QueryResponse, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<QueryResponse>()
            .await
            .map_err(|e| ServiceError::UpstreamError(format!("malformed query response: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| {
            format!(
                "{} ({})",
                b.error.message,
                b.error.status.as_deref().unwrap_or("UNKNOWN")
            )
        })
        .unwrap_or_else(|_| body.chars().take(200).collect());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(%status, "BigQuery rejected credentials");
    }

    Err(ServiceError::UpstreamError(format!(
        "BigQuery returned {}: {}",
        status, detail
    )))
}

#[async_trait]
impl PredictionEngine for BigQueryClient {
    #[instrument(skip(self, row), fields(sku = %row.sku, date = %row.date))]
    async fn predict(&self, row: &FeatureRow) -> Result<f64, ServiceError> {
        let mut response = self.start_query(row).await?;

        // Same job, long-polled; never a second query
        while !response.job_complete {
            let job = response.job_reference.as_ref().ok_or_else(|| {
                ServiceError::UpstreamError("incomplete job without a job reference".to_string())
            })?;
            debug!(job_id = %job.job_id, "prediction job still running");
            response = self.poll_results(job).await?;
        }

        self.extract_prediction(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ForecastRequest;
    use serde_json::json;

    fn sample_row() -> FeatureRow {
        ForecastRequest::from_json(
            json!({
                "date": "2024-01-15",
                "sku": "onion",
                "yesterday_sales": 22,
                "week_avg_sales": 20,
                "today_temp": 8,
                "yesterday_temp": 9
            }),
            &[],
        )
        .unwrap()
        .features()
    }

    fn client(column: &str) -> Result<BigQueryClient, ServiceError> {
        BigQueryClient::new(
            "http://localhost:9050/bigquery/v2/",
            "demo-project",
            &"sales.m_sales_lr".parse().unwrap(),
            column,
            TokenProvider::Anonymous,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn sql_binds_every_feature_as_parameter() {
        let client = client("predicted_sales").unwrap();
        let sql = client.sql();

        assert!(sql.contains("MODEL `demo-project.sales.m_sales_lr`"));
        assert!(sql.starts_with("SELECT predicted_sales"));
        for name in [
            "date",
            "sku",
            "yesterday_sales",
            "week_avg_sales",
            "today_temp",
            "yesterday_temp",
            "temp_diff",
            "dow",
        ] {
            assert!(sql.contains(&format!("@{name} AS {name}")), "missing @{name}");
        }
        assert!(!sql.contains("onion"));
    }

    #[test]
    fn parameters_carry_inputs_and_derived_features() {
        let params = query_parameters(&sample_row());
        assert_eq!(params.len(), 8);

        let find = |name: &str| params.iter().find(|p| p.name == name).unwrap();
        assert_eq!(find("date").parameter_type.kind, "DATE");
        assert_eq!(find("date").parameter_value.value, "2024-01-15");
        assert_eq!(find("sku").parameter_value.value, "onion");
        assert_eq!(find("temp_diff").parameter_value.value, "-1");
        assert_eq!(find("dow").parameter_type.kind, "INT64");
        assert_eq!(find("dow").parameter_value.value, "2");
    }

    #[test]
    fn hostile_sku_stays_inside_its_parameter() {
        let mut row = sample_row();
        row.sku = "onion' AS sku) ); DROP TABLE sales; --".to_string();

        let params = query_parameters(&row);
        let sku = params.iter().find(|p| p.name == "sku").unwrap();
        assert_eq!(sku.parameter_value.value, row.sku);
        assert!(!client("predicted_sales").unwrap().sql().contains("DROP"));
    }

    #[test]
    fn invalid_prediction_column_is_rejected() {
        assert!(matches!(
            client("predicted_sales FROM x --"),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn request_body_uses_named_parameters() {
        let body = QueryRequest {
            query: "SELECT 1",
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: query_parameters(&sample_row()),
            timeout_ms: 5000,
            request_id: "r-1".into(),
            location: None,
        };
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["parameterMode"], "NAMED");
        assert_eq!(value["useLegacySql"], false);
        assert_eq!(value["queryParameters"][0]["parameterType"]["type"], "DATE");
        assert!(value.get("location").is_none());
    }

    #[test]
    fn extracts_prediction_by_column_name() {
        let client = client("predicted_sales").unwrap();
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "sku"}, {"name": "predicted_sales"}]},
            "rows": [{"f": [{"v": "onion"}, {"v": "23.75"}]}]
        }))
        .unwrap();

        assert_eq!(client.extract_prediction(&response).unwrap(), 23.75);
    }

    #[test]
    fn zero_rows_is_empty_result() {
        let client = client("predicted_sales").unwrap();
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "predicted_sales"}]},
            "totalRows": "0"
        }))
        .unwrap();

        assert!(matches!(
            client.extract_prediction(&response),
            Err(ServiceError::EmptyResult)
        ));
    }

    #[test]
    fn null_prediction_is_upstream_error() {
        let client = client("predicted_sales").unwrap();
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "predicted_sales"}]},
            "rows": [{"f": [{"v": null}]}]
        }))
        .unwrap();

        assert!(matches!(
            client.extract_prediction(&response),
            Err(ServiceError::UpstreamError(_))
        ));
    }
}
