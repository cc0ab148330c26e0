/*!
 * # Machine Learning Module
 *
 * Inference against externally hosted models. The gateway only depends on
 * [`PredictionEngine`]; [`bigquery::BigQueryClient`] is the production
 * implementation.
 */

use async_trait::async_trait;

use crate::errors::ServiceError;
use crate::models::FeatureRow;

/// BigQuery ML `ML.PREDICT` client
pub mod bigquery;

/// Bearer token sources for outbound calls
pub mod credentials;

/// Validated model identifiers
pub mod model_ref;

pub use bigquery::BigQueryClient;
pub use credentials::TokenProvider;
pub use model_ref::ModelRef;

/// Single-row inference over an external model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionEngine: Send + Sync {
    /// Runs one inference and returns the model's scalar output
    async fn predict(&self, row: &FeatureRow) -> Result<f64, ServiceError>;
}
