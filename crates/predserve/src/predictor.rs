//! Prediction engine seam.
//!
//! The engine is opaque to the rest of the crate: it maps one validated
//! [`PredictionRecord`] to a label and a probability. The concrete artifact
//! lives in [`crate::model`].

use serde::{Deserialize, Serialize};

use crate::schema::PredictionRecord;

/// Outcome of one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// 1 when the positive class is predicted, else 0.
    pub label: u8,
    /// Probability of the positive class, in [0, 1].
    pub probability: f64,
}

impl PredictionResult {
    /// Build a result from a positive-class probability and decision threshold.
    pub fn from_probability(probability: f64, threshold: f64) -> Result<Self, EngineError> {
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(EngineError::InvalidOutput(probability.to_string()));
        }
        Ok(Self {
            label: u8::from(probability >= threshold),
            probability,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Prediction failed: {0}")]
    Failed(String),

    #[error("Engine produced an invalid probability: {0}")]
    InvalidOutput(String),
}

/// A loaded prediction engine.
///
/// Implementations must be deterministic for a given record; batch
/// redelivery relies on it.
pub trait Predictor: Send + Sync {
    fn predict(&self, record: &PredictionRecord) -> Result<PredictionResult, EngineError>;

    /// Version string of the loaded artifact, if it carries one.
    fn version(&self) -> Option<String> {
        None
    }
}
