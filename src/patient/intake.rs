use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ConsciousnessLevel, Gender, PatientSnapshot, VitalSigns};
use crate::error::{Result, TriageError};

const MAX_AGE: i64 = 130;

/// Raw intake payload as it arrives from the front desk or a device feed.
/// Nothing here is trusted; `normalize` turns it into a `PatientSnapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeForm {
    pub patient_id: Option<String>,
    pub name: Option<String>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub chief_complaint: Option<String>,

    pub bp_systolic: Option<f64>,
    pub bp_diastolic: Option<f64>,
    pub heart_rate: Option<f64>,
    pub temperature: Option<f64>,
    pub o2_saturation: Option<f64>,
    pub respiratory_rate: Option<f64>,
    pub pain_scale: Option<i64>,
    pub consciousness_level: Option<String>,

    pub bleeding: bool,
    pub breathing_difficulty: bool,
    pub trauma_indicator: bool,

    pub chronic_conditions: Vec<String>,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub medications_count: Option<i64>,
    pub previous_admissions: Option<i64>,
}

impl IntakeForm {
    /// Identity and age are mandatory. Every clinical field is clamped or
    /// defaulted instead of rejected.
    pub fn normalize(&self) -> Result<PatientSnapshot> {
        let patient_id = self
            .patient_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TriageError::Validation("patient_id is required".to_string()))?;

        let age = self
            .age
            .ok_or_else(|| TriageError::Validation("age is required".to_string()))?
            .clamp(0, MAX_AGE) as u32;

        let medication_count = self
            .medications_count
            .map(non_negative)
            .unwrap_or(self.medications.len() as u32);

        Ok(PatientSnapshot {
            patient_id: patient_id.to_string(),
            age,
            gender: self.gender.as_deref().map(Gender::parse).unwrap_or_default(),
            chief_complaint: self.chief_complaint.clone().unwrap_or_default().trim().to_string(),
            vitals: VitalSigns {
                bp_systolic: vital_or(self.bp_systolic, VitalSigns::DEFAULT_BP_SYSTOLIC),
                bp_diastolic: vital_or(self.bp_diastolic, VitalSigns::DEFAULT_BP_DIASTOLIC),
                heart_rate: vital_or(self.heart_rate, VitalSigns::DEFAULT_HEART_RATE),
                temperature: celsius(vital_or(self.temperature, VitalSigns::DEFAULT_TEMPERATURE)),
                o2_saturation: vital_or(self.o2_saturation, VitalSigns::DEFAULT_O2_SATURATION)
                    .min(100.0),
                respiratory_rate: vital_or(self.respiratory_rate, VitalSigns::DEFAULT_RESPIRATORY_RATE),
            },
            pain_scale: self.pain_scale.unwrap_or(0).clamp(0, 10) as u8,
            consciousness: self
                .consciousness_level
                .as_deref()
                .map(ConsciousnessLevel::parse)
                .unwrap_or_default(),
            bleeding: self.bleeding,
            breathing_difficulty: self.breathing_difficulty,
            trauma_indicator: self.trauma_indicator,
            chronic_condition_count: self.chronic_conditions.len() as u32,
            medication_count,
            allergy_present: self.allergies.iter().any(|a| !a.trim().is_empty()),
            previous_admission_count: self.previous_admissions.map(non_negative).unwrap_or(0),
            taken_at: Utc::now(),
        })
    }
}

fn vital_or(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        _ => default,
    }
}

// Readings above 50 can only be Fahrenheit.
fn celsius(temperature: f64) -> f64 {
    if temperature > 50.0 {
        (temperature - 32.0) * 5.0 / 9.0
    } else {
        temperature
    }
}

fn non_negative(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}
