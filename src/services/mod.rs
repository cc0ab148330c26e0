pub mod prediction;

pub use prediction::PredictionService;
