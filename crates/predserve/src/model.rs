//! Logistic-regression artifact.
//!
//! The artifact is a JSON document produced by the training pipeline:
//!
//! ```json
//! {
//!   "version": "term-deposit-lr-3",
//!   "intercept": -2.4,
//!   "threshold": 0.5,
//!   "numeric": { "duration": { "mean": 258.0, "scale": 257.5, "weight": 1.1 } },
//!   "categorical": { "poutcome": { "success": 2.3, "failure": -0.2 } }
//! }
//! ```
//!
//! Numeric features are standardized before weighting; categorical features
//! are one-hot encoded, and categories absent from the artifact contribute
//! nothing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::predictor::{EngineError, PredictionResult, Predictor};
use crate::schema::{self, FieldKind, PredictionRecord};

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumericFeature {
    pub mean: f64,
    pub scale: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    #[serde(default)]
    version: Option<String>,
    intercept: f64,
    #[serde(default = "default_threshold")]
    threshold: f64,
    #[serde(default)]
    numeric: BTreeMap<String, NumericFeature>,
    #[serde(default)]
    categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

fn default_threshold() -> f64 {
    0.5
}

impl LogisticModel {
    /// Load and check an artifact from disk.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            version = model.version.as_deref().unwrap_or("unversioned"),
            numeric = model.numeric.len(),
            categorical = model.categorical.len(),
            "Loaded model artifact"
        );
        Ok(model)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelLoadError> {
        let model: Self = serde_json::from_str(raw)?;
        model.check()?;
        Ok(model)
    }

    fn check(&self) -> Result<(), ModelLoadError> {
        if !self.intercept.is_finite() {
            return Err(ModelLoadError::Invalid("intercept is not finite".into()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ModelLoadError::Invalid(format!(
                "threshold {} outside [0, 1]",
                self.threshold
            )));
        }
        for (name, feature) in &self.numeric {
            match schema::field(name).map(|f| f.kind) {
                Some(FieldKind::Integer { .. }) => {}
                _ => {
                    return Err(ModelLoadError::Invalid(format!(
                        "'{name}' is not a numeric input field"
                    )));
                }
            }
            if !(feature.scale.is_finite() && feature.scale > 0.0) {
                return Err(ModelLoadError::Invalid(format!(
                    "scale for '{name}' must be positive"
                )));
            }
            if !(feature.mean.is_finite() && feature.weight.is_finite()) {
                return Err(ModelLoadError::Invalid(format!(
                    "non-finite coefficient for '{name}'"
                )));
            }
        }
        for (name, weights) in &self.categorical {
            let Some(FieldKind::Categorical { choices, .. }) = schema::field(name).map(|f| f.kind)
            else {
                return Err(ModelLoadError::Invalid(format!(
                    "'{name}' is not a categorical input field"
                )));
            };
            for (category, weight) in weights {
                if !choices.contains(&category.as_str()) {
                    return Err(ModelLoadError::Invalid(format!(
                        "'{category}' is not a valid value for '{name}'"
                    )));
                }
                if !weight.is_finite() {
                    return Err(ModelLoadError::Invalid(format!(
                        "non-finite weight for '{name}={category}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn decision(&self, record: &PredictionRecord) -> Result<f64, EngineError> {
        let mut z = self.intercept;
        for (name, feature) in &self.numeric {
            let value = record
                .integer(name)
                .ok_or_else(|| EngineError::Failed(format!("record has no field '{name}'")))?;
            z += feature.weight * (value as f64 - feature.mean) / feature.scale;
        }
        for (name, weights) in &self.categorical {
            let value = record
                .category(name)
                .ok_or_else(|| EngineError::Failed(format!("record has no field '{name}'")))?;
            z += weights.get(value).copied().unwrap_or(0.0);
        }
        Ok(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl Predictor for LogisticModel {
    fn predict(&self, record: &PredictionRecord) -> Result<PredictionResult, EngineError> {
        let z = self.decision(record)?;
        PredictionResult::from_probability(sigmoid(z), self.threshold)
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
