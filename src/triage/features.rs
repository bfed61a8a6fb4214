use serde::{Deserialize, Serialize};

use crate::patient::{ConsciousnessLevel, EsiLevel, Gender, PatientSnapshot};

pub const FEATURE_SCHEMA_VERSION: &str = "v1";

/// Column order of `FeatureVector::to_vec`. Models are trained against it.
pub const FEATURE_NAMES: [&str; 29] = [
    "bp_systolic",
    "bp_diastolic",
    "heart_rate",
    "temperature",
    "o2_saturation",
    "respiratory_rate",
    "age",
    "is_male",
    "is_infant",
    "is_child",
    "is_elderly",
    "pain_scale",
    "is_unresponsive",
    "is_altered",
    "has_bleeding",
    "has_breathing_difficulty",
    "has_trauma",
    "num_chronic_conditions",
    "medications_count",
    "has_allergies",
    "previous_admissions",
    "pulse_pressure",
    "shock_index",
    "bp_abnormal",
    "hr_abnormal",
    "o2_abnormal",
    "temp_abnormal",
    "rr_abnormal",
    "vital_abnormality_count",
];

/// Deterministic model input derived from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub bp_systolic: f64,
    pub bp_diastolic: f64,
    pub heart_rate: f64,
    pub temperature: f64,
    pub o2_saturation: f64,
    pub respiratory_rate: f64,
    pub age: f64,
    pub is_male: bool,
    pub is_infant: bool,
    pub is_child: bool,
    pub is_elderly: bool,
    pub pain_scale: f64,
    pub is_unresponsive: bool,
    pub is_altered: bool,
    pub has_bleeding: bool,
    pub has_breathing_difficulty: bool,
    pub has_trauma: bool,
    pub num_chronic_conditions: f64,
    pub medications_count: f64,
    pub has_allergies: bool,
    pub previous_admissions: f64,
    pub pulse_pressure: f64,
    pub shock_index: f64,
    pub bp_abnormal: bool,
    pub hr_abnormal: bool,
    pub o2_abnormal: bool,
    pub temp_abnormal: bool,
    pub rr_abnormal: bool,
    pub vital_abnormality_count: u8,
}

impl FeatureVector {
    pub fn from_snapshot(s: &PatientSnapshot) -> Self {
        let v = &s.vitals;
        let age = s.age;

        let bp_abnormal = v.bp_systolic < 90.0
            || v.bp_systolic > 180.0
            || v.bp_diastolic < 60.0
            || v.bp_diastolic > 110.0;
        let hr_abnormal = v.heart_rate < 50.0 || v.heart_rate > 120.0;
        let o2_abnormal = v.o2_saturation < 92.0;
        let temp_abnormal = v.temperature < 35.5 || v.temperature > 38.5;
        let rr_abnormal = v.respiratory_rate < 10.0 || v.respiratory_rate > 30.0;

        let vital_abnormality_count = [bp_abnormal, hr_abnormal, o2_abnormal, temp_abnormal, rr_abnormal]
            .iter()
            .filter(|flag| **flag)
            .count() as u8;

        FeatureVector {
            bp_systolic: v.bp_systolic,
            bp_diastolic: v.bp_diastolic,
            heart_rate: v.heart_rate,
            temperature: v.temperature,
            o2_saturation: v.o2_saturation,
            respiratory_rate: v.respiratory_rate,
            age: f64::from(age),
            is_male: s.gender == Gender::Male,
            is_infant: age < 2,
            is_child: (2..12).contains(&age),
            is_elderly: age >= 65,
            pain_scale: f64::from(s.pain_scale),
            is_unresponsive: s.consciousness == ConsciousnessLevel::Unresponsive,
            is_altered: s.consciousness.is_altered(),
            has_bleeding: s.bleeding,
            has_breathing_difficulty: s.breathing_difficulty,
            has_trauma: s.trauma_indicator,
            num_chronic_conditions: f64::from(s.chronic_condition_count),
            medications_count: f64::from(s.medication_count),
            has_allergies: s.allergy_present,
            previous_admissions: f64::from(s.previous_admission_count),
            pulse_pressure: v.bp_systolic - v.bp_diastolic,
            shock_index: if v.bp_systolic > 0.0 { v.heart_rate / v.bp_systolic } else { 0.0 },
            bp_abnormal,
            hr_abnormal,
            o2_abnormal,
            temp_abnormal,
            rr_abnormal,
            vital_abnormality_count,
        }
    }

    /// Flattened in `FEATURE_NAMES` order.
    pub fn to_vec(&self) -> Vec<f64> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        vec![
            self.bp_systolic,
            self.bp_diastolic,
            self.heart_rate,
            self.temperature,
            self.o2_saturation,
            self.respiratory_rate,
            self.age,
            flag(self.is_male),
            flag(self.is_infant),
            flag(self.is_child),
            flag(self.is_elderly),
            self.pain_scale,
            flag(self.is_unresponsive),
            flag(self.is_altered),
            flag(self.has_bleeding),
            flag(self.has_breathing_difficulty),
            flag(self.has_trauma),
            self.num_chronic_conditions,
            self.medications_count,
            flag(self.has_allergies),
            self.previous_admissions,
            self.pulse_pressure,
            self.shock_index,
            flag(self.bp_abnormal),
            flag(self.hr_abnormal),
            flag(self.o2_abnormal),
            flag(self.temp_abnormal),
            flag(self.rr_abnormal),
            f64::from(self.vital_abnormality_count),
        ]
    }

    /// Reason codes attached to a model prediction.
    pub fn explain(&self, predicted: EsiLevel) -> Vec<String> {
        let mut reasons = Vec::new();

        if self.vital_abnormality_count >= 3 {
            reasons.push("multiple_abnormal_vitals");
        } else if self.vital_abnormality_count >= 1 {
            reasons.push("abnormal_vitals_detected");
        }

        if self.pain_scale >= 8.0 {
            reasons.push("severe_pain");
        } else if self.pain_scale >= 5.0 {
            reasons.push("moderate_pain");
        }

        if self.is_unresponsive {
            reasons.push("patient_unresponsive");
        } else if self.is_altered {
            reasons.push("altered_consciousness");
        }

        if self.is_infant || self.is_elderly {
            reasons.push("age_risk_factor");
        }
        if self.has_bleeding {
            reasons.push("active_bleeding");
        }
        if self.has_breathing_difficulty {
            reasons.push("respiratory_distress");
        }
        if self.has_trauma {
            reasons.push("trauma_indicator");
        }

        let mut reasons: Vec<String> = reasons.into_iter().map(String::from).collect();
        reasons.push(format!("model_prediction_level_{}", predicted.as_u8()));
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::VitalSigns;

    #[test]
    fn derived_features_follow_the_vitals() {
        let mut s = PatientSnapshot::new("p", 70);
        s.vitals = VitalSigns {
            bp_systolic: 85.0,
            bp_diastolic: 50.0,
            heart_rate: 130.0,
            temperature: 39.2,
            o2_saturation: 90.0,
            respiratory_rate: 32.0,
        };

        let f = FeatureVector::from_snapshot(&s);
        assert_eq!(f.pulse_pressure, 35.0);
        assert!((f.shock_index - 130.0 / 85.0).abs() < 1e-12);
        assert!(f.bp_abnormal && f.hr_abnormal && f.o2_abnormal && f.temp_abnormal && f.rr_abnormal);
        assert_eq!(f.vital_abnormality_count, 5);
        assert!(f.is_elderly && !f.is_child && !f.is_infant);
    }

    #[test]
    fn normal_vitals_have_no_abnormality_flags() {
        let f = FeatureVector::from_snapshot(&PatientSnapshot::new("p", 5));
        assert_eq!(f.vital_abnormality_count, 0);
        assert!(f.is_child);
        assert_eq!(f.pulse_pressure, 40.0);
    }

    #[test]
    fn zero_systolic_guards_shock_index() {
        let mut s = PatientSnapshot::new("p", 30);
        s.vitals.bp_systolic = 0.0;
        assert_eq!(FeatureVector::from_snapshot(&s).shock_index, 0.0);
    }

    #[test]
    fn flattened_vector_matches_schema_and_is_deterministic() {
        let s = PatientSnapshot::new("p", 1);
        let a = FeatureVector::from_snapshot(&s).to_vec();
        let b = FeatureVector::from_snapshot(&s).to_vec();
        assert_eq!(a.len(), FEATURE_NAMES.len());
        assert_eq!(a, b);
        assert_eq!(a[8], 1.0, "is_infant column");
    }
}
