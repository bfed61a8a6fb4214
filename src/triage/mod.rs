//! ESI classification and priority scoring
//!
//! The rule-based classifier is always available. A statistical model can be
//! plugged in front of it; any model failure falls back to the rules so that
//! classification itself never fails.

pub mod features;
pub mod model;
pub mod rules;
pub mod scoring;

pub use features::FeatureVector;
pub use model::{LinearSoftmaxModel, Prediction, StatisticalModel};
pub use rules::RuleBasedClassifier;
pub use scoring::PriorityScorer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, TriageError};
use crate::patient::{EsiLevel, PatientSnapshot};

pub const FALLBACK_REASON: &str = "rule_based_fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessorKind {
    RuleBased,
    Statistical,
}

/// Output of one classification. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub patient_id: String,
    pub esi_level: EsiLevel,
    pub confidence: f64,
    pub reason_codes: Vec<String>,
    pub assessor: AssessorKind,
    pub model_version: Option<String>,
    pub assessed_at: DateTime<Utc>,
}

impl Assessment {
    pub fn is_fallback(&self) -> bool {
        self.reason_codes.iter().any(|r| r == FALLBACK_REASON)
    }
}

/// Anything that can turn a snapshot into an assessment. Implementations
/// must be total and safe to share across request tasks.
pub trait Classifier: Send + Sync {
    fn assess(&self, snapshot: &PatientSnapshot) -> Assessment;
}

impl Classifier for RuleBasedClassifier {
    fn assess(&self, snapshot: &PatientSnapshot) -> Assessment {
        let (esi_level, confidence, reason_codes) = self.classify(snapshot);
        Assessment {
            patient_id: snapshot.patient_id.clone(),
            esi_level,
            confidence,
            reason_codes,
            assessor: AssessorKind::RuleBased,
            model_version: None,
            assessed_at: Utc::now(),
        }
    }
}

/// Statistical model first, rules as the fallback.
pub struct TriageClassifier {
    rules: RuleBasedClassifier,
    model: Option<Arc<dyn StatisticalModel>>,
}

impl TriageClassifier {
    pub fn new(rules: RuleBasedClassifier) -> Self {
        TriageClassifier { rules, model: None }
    }

    pub fn with_model(rules: RuleBasedClassifier, model: Arc<dyn StatisticalModel>) -> Self {
        TriageClassifier {
            rules,
            model: Some(model),
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    fn predict(&self, model: &dyn StatisticalModel, snapshot: &PatientSnapshot) -> Result<Assessment> {
        let features = FeatureVector::from_snapshot(snapshot);

        let prediction = panic::catch_unwind(AssertUnwindSafe(|| model.predict(&features)))
            .map_err(|_| TriageError::ClassifierUnavailable("model panicked during predict".to_string()))??;

        let esi_level = EsiLevel::from_u8(prediction.label).ok_or_else(|| {
            TriageError::ClassifierUnavailable(format!("model returned label {}", prediction.label))
        })?;
        if !prediction.probability.is_finite() {
            return Err(TriageError::ClassifierUnavailable(
                "model returned a non-finite probability".to_string(),
            ));
        }

        Ok(Assessment {
            patient_id: snapshot.patient_id.clone(),
            esi_level,
            confidence: prediction.probability.clamp(0.0, 1.0),
            reason_codes: features.explain(esi_level),
            assessor: AssessorKind::Statistical,
            model_version: Some(model.version().to_string()),
            assessed_at: Utc::now(),
        })
    }
}

impl Classifier for TriageClassifier {
    fn assess(&self, snapshot: &PatientSnapshot) -> Assessment {
        let Some(model) = &self.model else {
            return self.rules.assess(snapshot);
        };

        match self.predict(model.as_ref(), snapshot) {
            Ok(assessment) => {
                debug!(patient_id = %snapshot.patient_id, esi = assessment.esi_level.as_u8(),
                       confidence = assessment.confidence, "statistical assessment");
                assessment
            }
            Err(e) => {
                warn!(patient_id = %snapshot.patient_id, error = %e, "falling back to rule-based triage");
                let mut assessment = self.rules.assess(snapshot);
                assessment.reason_codes.insert(0, FALLBACK_REASON.to_string());
                assessment
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;
    use crate::patient::ConsciousnessLevel;

    struct FixedModel(u8, f64);

    impl StatisticalModel for FixedModel {
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction> {
            Ok(Prediction {
                label: self.0,
                probability: self.1,
            })
        }

        fn version(&self) -> &str {
            "fixed-test"
        }
    }

    struct BrokenModel;

    impl StatisticalModel for BrokenModel {
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction> {
            Err(TriageError::ClassifierUnavailable("backend offline".to_string()))
        }

        fn version(&self) -> &str {
            "broken"
        }
    }

    struct PanickingModel;

    impl StatisticalModel for PanickingModel {
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction> {
            panic!("corrupt weights")
        }

        fn version(&self) -> &str {
            "panics"
        }
    }

    fn rules() -> RuleBasedClassifier {
        RuleBasedClassifier::new(ThresholdConfig::default())
    }

    #[test]
    fn uses_model_prediction_when_healthy() {
        let classifier = TriageClassifier::with_model(rules(), Arc::new(FixedModel(3, 0.72)));
        let assessment = classifier.assess(&PatientSnapshot::new("p-1", 30));

        assert_eq!(assessment.esi_level, EsiLevel::Urgent);
        assert_eq!(assessment.assessor, AssessorKind::Statistical);
        assert_eq!(assessment.model_version.as_deref(), Some("fixed-test"));
        assert!(assessment.reason_codes.contains(&"model_prediction_level_3".to_string()));
    }

    #[test]
    fn falls_back_when_model_errors() {
        let classifier = TriageClassifier::with_model(rules(), Arc::new(BrokenModel));
        let mut snapshot = PatientSnapshot::new("p-2", 30);
        snapshot.consciousness = ConsciousnessLevel::Unresponsive;

        let assessment = classifier.assess(&snapshot);
        assert_eq!(assessment.esi_level, EsiLevel::Resuscitation);
        assert_eq!(assessment.assessor, AssessorKind::RuleBased);
        assert_eq!(assessment.reason_codes[0], FALLBACK_REASON);
        assert!(assessment.is_fallback());
    }

    #[test]
    fn falls_back_when_model_panics_or_returns_garbage() {
        let snapshot = PatientSnapshot::new("p-3", 30);

        let panicking = TriageClassifier::with_model(rules(), Arc::new(PanickingModel));
        assert!(panicking.assess(&snapshot).is_fallback());

        let bad_label = TriageClassifier::with_model(rules(), Arc::new(FixedModel(9, 0.9)));
        assert!(bad_label.assess(&snapshot).is_fallback());

        let bad_probability = TriageClassifier::with_model(rules(), Arc::new(FixedModel(2, f64::NAN)));
        assert!(bad_probability.assess(&snapshot).is_fallback());
    }

    #[test]
    fn without_model_rules_answer_directly() {
        let classifier = TriageClassifier::new(rules());
        let assessment = classifier.assess(&PatientSnapshot::default());
        assert_eq!(assessment.assessor, AssessorKind::RuleBased);
        assert!(!assessment.is_fallback());
    }
}
