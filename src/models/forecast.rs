use chrono::{Datelike, NaiveDate};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use crate::errors::ServiceError;

/// Wire shape of a forecast request.
///
/// Numeric fields accept either JSON numbers or numeric strings.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "date": "2024-01-15",
    "sku": "onion",
    "yesterday_sales": 22,
    "week_avg_sales": 20,
    "today_temp": 8,
    "yesterday_temp": 9
}))]
pub struct ForecastPayload {
    /// Calendar date being forecast, `YYYY-MM-DD`
    #[validate(custom = "validate_date_range")]
    #[schema(value_type = String, format = Date, example = "2024-01-15")]
    pub date: NaiveDate,

    /// Product identifier
    #[validate(custom = "validate_sku")]
    #[schema(example = "onion")]
    pub sku: String,

    /// Units sold the previous day
    #[serde(deserialize_with = "coerce_f64")]
    #[validate(range(min = 0.0), custom = "validate_finite")]
    #[schema(example = 22)]
    pub yesterday_sales: f64,

    /// Average units sold over the prior week
    #[serde(deserialize_with = "coerce_f64")]
    #[validate(range(min = 0.0), custom = "validate_finite")]
    #[schema(example = 20)]
    pub week_avg_sales: f64,

    /// Forecast temperature for the target date
    #[serde(deserialize_with = "coerce_f64")]
    #[validate(custom = "validate_finite")]
    #[schema(example = 8)]
    pub today_temp: f64,

    /// Observed temperature the previous day
    #[serde(deserialize_with = "coerce_f64")]
    #[validate(custom = "validate_finite")]
    #[schema(example = 9)]
    pub yesterday_temp: f64,
}

fn coerce_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom("number is out of range")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("'{}' is not a number", s))),
        other => Err(de::Error::custom(format!(
            "expected a number, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        let mut err = ValidationError::new("finite");
        err.message = Some("must be a finite number".into());
        Err(err)
    }
}

/// BigQuery DATE covers 0001-01-01 through 9999-12-31
fn validate_date_range(date: &NaiveDate) -> Result<(), ValidationError> {
    if (1..=9999).contains(&date.year()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("date_range");
        err.message = Some("date year must be between 0001 and 9999".into());
        Err(err)
    }
}

fn validate_sku(sku: &str) -> Result<(), ValidationError> {
    if sku.trim().is_empty() {
        let mut err = ValidationError::new("sku");
        err.message = Some("sku must not be empty".into());
        return Err(err);
    }
    Ok(())
}

/// A validated forecast request
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub date: NaiveDate,
    pub sku: String,
    pub yesterday_sales: f64,
    pub week_avg_sales: f64,
    pub today_temp: f64,
    pub yesterday_temp: f64,
}

impl ForecastRequest {
    /// Coerces and validates an untyped JSON body.
    ///
    /// An empty `known_skus` accepts any non-empty SKU.
    pub fn from_json(body: Value, known_skus: &[String]) -> Result<Self, ServiceError> {
        if !body.is_object() {
            return Err(ServiceError::ValidationError(format!(
                "expected a JSON object, found {}",
                json_kind(&body)
            )));
        }

        let payload: ForecastPayload = serde_json::from_value(body)?;
        payload.validate()?;

        let sku = payload.sku.trim().to_string();
        if !known_skus.is_empty() && !known_skus.iter().any(|known| *known == sku) {
            return Err(ServiceError::ValidationError(format!(
                "unknown sku '{}'",
                sku
            )));
        }

        Ok(Self {
            date: payload.date,
            sku,
            yesterday_sales: payload.yesterday_sales,
            week_avg_sales: payload.week_avg_sales,
            today_temp: payload.today_temp,
            yesterday_temp: payload.yesterday_temp,
        })
    }

    pub fn temp_diff(&self) -> f64 {
        self.today_temp - self.yesterday_temp
    }

    pub fn day_of_week(&self) -> u32 {
        day_of_week(self.date)
    }

    /// Inputs plus derived features, ready for inference
    pub fn features(&self) -> FeatureRow {
        FeatureRow {
            date: self.date,
            sku: self.sku.clone(),
            yesterday_sales: self.yesterday_sales,
            week_avg_sales: self.week_avg_sales,
            today_temp: self.today_temp,
            yesterday_temp: self.yesterday_temp,
            temp_diff: self.temp_diff(),
            day_of_week: self.day_of_week(),
        }
    }
}

/// Day of week as 1-7 with 1 = Sunday
pub fn day_of_week(date: NaiveDate) -> u32 {
    date.weekday().number_from_sunday()
}

/// The single synthetic row sent to the model
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub sku: String,
    pub yesterday_sales: f64,
    pub week_avg_sales: f64,
    pub today_temp: f64,
    pub yesterday_temp: f64,
    pub temp_diff: f64,
    pub day_of_week: u32,
}

/// Response body of `POST /predict`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PredictionResult {
    #[schema(example = 23.7)]
    pub predicted_sales: f64,
}
