//! Pluggable statistical models
//!
//! The engine only needs `predict`. `LinearSoftmaxModel` is a small
//! concrete implementation read from a JSON artifact; anything heavier can
//! implement the trait elsewhere and be injected.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::features::{FeatureVector, FEATURE_NAMES, FEATURE_SCHEMA_VERSION};
use crate::error::{Result, TriageError};
use crate::patient::EsiLevel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: u8,
    pub probability: f64,
}

pub trait StatisticalModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction>;
    fn version(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassWeights {
    pub label: u8,
    pub bias: f64,
    pub weights: Vec<f64>,
}

/// Multinomial logistic regression over the v1 feature vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSoftmaxModel {
    pub version: String,
    pub feature_schema: String,
    pub classes: Vec<ClassWeights>,
}

impl LinearSoftmaxModel {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TriageError::ClassifierUnavailable(format!("Failed to read model {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let model: LinearSoftmaxModel = serde_json::from_str(content)
            .map_err(|e| TriageError::ClassifierUnavailable(format!("Failed to parse model: {}", e)))?;
        model.check()?;
        Ok(model)
    }

    fn check(&self) -> Result<()> {
        if self.feature_schema != FEATURE_SCHEMA_VERSION {
            return Err(TriageError::ClassifierUnavailable(format!(
                "model expects feature schema {}, engine provides {}",
                self.feature_schema, FEATURE_SCHEMA_VERSION
            )));
        }
        if self.classes.is_empty() {
            return Err(TriageError::ClassifierUnavailable("model has no classes".to_string()));
        }
        for class in &self.classes {
            if EsiLevel::from_u8(class.label).is_none() {
                return Err(TriageError::ClassifierUnavailable(format!(
                    "model class label {} is not an ESI level",
                    class.label
                )));
            }
            if class.weights.len() != FEATURE_NAMES.len() {
                return Err(TriageError::ClassifierUnavailable(format!(
                    "class {} has {} weights, expected {}",
                    class.label,
                    class.weights.len(),
                    FEATURE_NAMES.len()
                )));
            }
        }
        Ok(())
    }
}

impl StatisticalModel for LinearSoftmaxModel {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction> {
        let x = features.to_vec();

        let logits: Vec<f64> = self
            .classes
            .iter()
            .map(|class| class.bias + class.weights.iter().zip(&x).map(|(w, v)| w * v).sum::<f64>())
            .collect();

        // Shift by the max logit so exp() cannot overflow.
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(TriageError::ClassifierUnavailable("non-finite model logits".to_string()));
        }
        let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exps.iter().sum();

        let (best, best_exp) = exps
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });

        Ok(Prediction {
            label: self.classes[best].label,
            probability: best_exp / total,
        })
    }

    fn version(&self) -> &str {
        &self.version
    }
}
