pub mod forecast;

pub use forecast::{day_of_week, FeatureRow, ForecastPayload, ForecastRequest, PredictionResult};
