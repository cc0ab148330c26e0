use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::ml::model_ref::ModelRef;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_BIGQUERY_API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const DEFAULT_AUTH_MODE: &str = "metadata";
const DEFAULT_PREDICTION_COLUMN: &str = "predicted_sales";
const DEFAULT_PREDICTION_TIMEOUT_SECS: u64 = 30;

/// How the BigQuery client obtains its bearer token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// Fetch short-lived tokens from the GCE/Cloud Run metadata server
    Metadata,
    /// Use the configured `bigquery_access_token` as-is
    Static,
    /// Send no Authorization header (local emulators)
    None,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "metadata" => Ok(AuthMode::Metadata),
            "static" => Ok(AuthMode::Static),
            "none" => Ok(AuthMode::None),
            other => Err(format!("unknown auth mode '{}'", other)),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Model identifier, `project.dataset.model` or `dataset.model`
    #[validate(custom = "validate_model_identifier")]
    pub bigquery_model: String,

    /// Project that runs the query job (defaults to the model's project)
    #[serde(default)]
    pub bigquery_project_id: Option<String>,

    /// Job location, e.g. "US" or "asia-northeast3"
    #[serde(default)]
    pub bigquery_location: Option<String>,

    /// REST root of the BigQuery v2 API
    #[serde(default = "default_bigquery_api_base_url")]
    pub bigquery_api_base_url: String,

    /// Credential source: "metadata", "static" or "none"
    #[serde(default = "default_auth_mode")]
    #[validate(custom = "validate_auth_mode")]
    pub bigquery_auth_mode: String,

    /// Bearer token used when `bigquery_auth_mode` is "static"
    #[serde(default)]
    pub bigquery_access_token: Option<String>,

    /// Token endpoint used when `bigquery_auth_mode` is "metadata"
    #[serde(default = "default_metadata_token_url")]
    pub bigquery_metadata_token_url: String,

    /// Output column read from the model's result row
    #[serde(default = "default_prediction_column")]
    #[validate(length(min = 1))]
    pub prediction_column: String,

    /// Upper bound for the whole upstream exchange, in seconds
    #[serde(default = "default_prediction_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub prediction_timeout_secs: u64,

    /// Comma-separated SKU allow-list; empty accepts any non-empty SKU
    #[serde(default)]
    pub known_skus: Option<String>,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(bigquery_model: String, host: String, port: u16, environment: String) -> Self {
        Self {
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            bigquery_model,
            bigquery_project_id: None,
            bigquery_location: None,
            bigquery_api_base_url: default_bigquery_api_base_url(),
            bigquery_auth_mode: default_auth_mode(),
            bigquery_access_token: None,
            bigquery_metadata_token_url: default_metadata_token_url(),
            prediction_column: default_prediction_column(),
            prediction_timeout_secs: default_prediction_timeout_secs(),
            known_skus: None,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            max_body_size: default_max_body_size(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Parsed credential mode
    pub fn auth_mode(&self) -> Result<AuthMode, AppConfigError> {
        AuthMode::from_str(&self.bigquery_auth_mode).map_err(AppConfigError::Invalid)
    }

    /// Parsed model reference
    pub fn model_ref(&self) -> Result<ModelRef, AppConfigError> {
        ModelRef::from_str(&self.bigquery_model).map_err(AppConfigError::Invalid)
    }

    /// Project billed for the prediction job
    pub fn job_project_id(&self) -> Result<String, AppConfigError> {
        if let Some(project) = self
            .bigquery_project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            return Ok(project.to_string());
        }

        self.model_ref()?
            .project()
            .map(str::to_string)
            .ok_or_else(|| {
                AppConfigError::Invalid(
                    "bigquery_project_id is required when bigquery_model has no project prefix"
                        .to_string(),
                )
            })
    }

    /// Known SKUs, trimmed, empty entries dropped
    pub fn known_skus(&self) -> Vec<String> {
        self.known_skus
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|sku| !sku.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn prediction_timeout(&self) -> Duration {
        Duration::from_secs(self.prediction_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        let has_token = self
            .bigquery_access_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if matches!(self.auth_mode(), Ok(AuthMode::Static)) && !has_token {
            let mut err = ValidationError::new("bigquery_access_token_required");
            err.message = Some(
                "APP__BIGQUERY_ACCESS_TOKEN must be set when APP__BIGQUERY_AUTH_MODE=static".into(),
            );
            errors.add("bigquery_access_token", err);
        }

        if self.job_project_id().is_err() {
            let mut err = ValidationError::new("bigquery_project_id_required");
            err.message = Some(
                "Set APP__BIGQUERY_PROJECT_ID or use a project-qualified APP__BIGQUERY_MODEL"
                    .into(),
            );
            errors.add("bigquery_project_id", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bigquery_api_base_url() -> String {
    DEFAULT_BIGQUERY_API_BASE_URL.to_string()
}

fn default_metadata_token_url() -> String {
    DEFAULT_METADATA_TOKEN_URL.to_string()
}

fn default_auth_mode() -> String {
    DEFAULT_AUTH_MODE.to_string()
}

fn default_prediction_column() -> String {
    DEFAULT_PREDICTION_COLUMN.to_string()
}

fn default_prediction_timeout_secs() -> u64 {
    DEFAULT_PREDICTION_TIMEOUT_SECS
}

fn default_max_body_size() -> usize {
    64 * 1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_auth_mode(value: &str) -> Result<(), ValidationError> {
    AuthMode::from_str(value).map(|_| ()).map_err(|_| {
        let mut err = ValidationError::new("bigquery_auth_mode");
        err.message = Some("Must be one of: metadata, static, none".into());
        err
    })
}

fn validate_model_identifier(value: &str) -> Result<(), ValidationError> {
    ModelRef::from_str(value).map(|_| ()).map_err(|reason| {
        let mut err = ValidationError::new("bigquery_model");
        err.message = Some(reason.into());
        err
    })
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("forecast_gateway={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());

    load_layers(
        config_dir,
        &run_env,
        Environment::with_prefix("APP").separator("__"),
    )
}

fn load_layers(
    config_dir: &Path,
    run_env: &str,
    overrides: Environment,
) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let dir = config_dir.to_string_lossy();
    let config = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", dir, run_env)).required(false))
        .add_source(overrides)
        .build()?;

    // The model has no sensible default; say so before serde does
    if config.get_string("bigquery_model").is_err() {
        error!("Prediction model is not configured. Set APP__BIGQUERY_MODEL to `project.dataset.model`.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "bigquery_model is required but not configured. Set APP__BIGQUERY_MODEL environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
