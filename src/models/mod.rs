// src/models/mod.rs
pub mod grading;
pub mod prediction;
pub mod stats_models;

pub use grading::GradeRecord;
pub use prediction::{
    BusinessKey, ModelOutput, Prediction, PredictionRecord, Recommendation, SkipReason,
    ThresholdKey,
};
