//! Patient data model
//!
//! A `PatientSnapshot` is one point-in-time clinical picture. Snapshots are
//! never mutated after normalisation; every reassessment builds a new one.

pub mod intake;

pub use intake::IntakeForm;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Emergency Severity Index, 1 (most severe) to 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EsiLevel {
    Resuscitation = 1,
    Emergent = 2,
    Urgent = 3,
    LessUrgent = 4,
    NonUrgent = 5,
}

impl EsiLevel {
    pub const ALL: [EsiLevel; 5] = [
        EsiLevel::Resuscitation,
        EsiLevel::Emergent,
        EsiLevel::Urgent,
        EsiLevel::LessUrgent,
        EsiLevel::NonUrgent,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Zero-based index for per-level lookup tables.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            1 => Some(EsiLevel::Resuscitation),
            2 => Some(EsiLevel::Emergent),
            3 => Some(EsiLevel::Urgent),
            4 => Some(EsiLevel::LessUrgent),
            5 => Some(EsiLevel::NonUrgent),
            _ => None,
        }
    }

    /// Out-of-range levels snap to the nearest valid level.
    pub fn clamped(level: i64) -> Self {
        let level = level.clamp(1, 5) as u8;
        EsiLevel::from_u8(level).unwrap_or(EsiLevel::NonUrgent)
    }

    /// ESI 1 and 2 count as critical for dashboards and alerts.
    pub fn is_critical(self) -> bool {
        self <= EsiLevel::Emergent
    }

    pub fn name(self) -> &'static str {
        match self {
            EsiLevel::Resuscitation => "Resuscitation",
            EsiLevel::Emergent => "Emergent",
            EsiLevel::Urgent => "Urgent",
            EsiLevel::LessUrgent => "Less Urgent",
            EsiLevel::NonUrgent => "Non-Urgent",
        }
    }
}

impl From<EsiLevel> for u8 {
    fn from(level: EsiLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for EsiLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        EsiLevel::from_u8(level).ok_or_else(|| format!("ESI level must be 1-5, got {}", level))
    }
}

impl fmt::Display for EsiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ESI {}", self.as_u8())
    }
}

/// AVPU consciousness scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsciousnessLevel {
    #[default]
    Alert,
    Voice,
    Pain,
    Unresponsive,
}

impl ConsciousnessLevel {
    /// Lenient parse; anything unrecognised is treated as Alert.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_lowercase().as_str() {
            "voice" | "verbal" | "confused" => ConsciousnessLevel::Voice,
            "pain" => ConsciousnessLevel::Pain,
            "unresponsive" | "unconscious" => ConsciousnessLevel::Unresponsive,
            _ => ConsciousnessLevel::Alert,
        }
    }

    pub fn is_altered(self) -> bool {
        matches!(self, ConsciousnessLevel::Voice | ConsciousnessLevel::Pain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    #[default]
    Unknown,
}

impl Gender {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            "" | "unknown" => Gender::Unknown,
            _ => Gender::Other,
        }
    }
}

/// Vital signs with every field populated. Temperature is in Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub bp_systolic: f64,
    pub bp_diastolic: f64,
    pub heart_rate: f64,
    pub temperature: f64,
    pub o2_saturation: f64,
    pub respiratory_rate: f64,
}

impl VitalSigns {
    pub const DEFAULT_BP_SYSTOLIC: f64 = 120.0;
    pub const DEFAULT_BP_DIASTOLIC: f64 = 80.0;
    pub const DEFAULT_HEART_RATE: f64 = 80.0;
    pub const DEFAULT_TEMPERATURE: f64 = 37.0;
    pub const DEFAULT_O2_SATURATION: f64 = 98.0;
    pub const DEFAULT_RESPIRATORY_RATE: f64 = 16.0;
}

impl Default for VitalSigns {
    fn default() -> Self {
        VitalSigns {
            bp_systolic: Self::DEFAULT_BP_SYSTOLIC,
            bp_diastolic: Self::DEFAULT_BP_DIASTOLIC,
            heart_rate: Self::DEFAULT_HEART_RATE,
            temperature: Self::DEFAULT_TEMPERATURE,
            o2_saturation: Self::DEFAULT_O2_SATURATION,
            respiratory_rate: Self::DEFAULT_RESPIRATORY_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    pub patient_id: String,
    pub age: u32,
    pub gender: Gender,
    pub chief_complaint: String,
    pub vitals: VitalSigns,
    pub pain_scale: u8,
    pub consciousness: ConsciousnessLevel,
    pub bleeding: bool,
    pub breathing_difficulty: bool,
    pub trauma_indicator: bool,
    pub chronic_condition_count: u32,
    pub medication_count: u32,
    pub allergy_present: bool,
    pub previous_admission_count: u32,
    pub taken_at: DateTime<Utc>,
}

impl PatientSnapshot {
    /// Adult age assumed when nothing else is known.
    pub const DEFAULT_AGE: u32 = 40;

    pub fn new(patient_id: impl Into<String>, age: u32) -> Self {
        PatientSnapshot {
            patient_id: patient_id.into(),
            age,
            ..Default::default()
        }
    }

    pub fn complaint_mentions(&self, keyword: &str) -> bool {
        self.chief_complaint.to_lowercase().contains(&keyword.to_lowercase())
    }
}

impl Default for PatientSnapshot {
    fn default() -> Self {
        PatientSnapshot {
            patient_id: String::new(),
            age: Self::DEFAULT_AGE,
            gender: Gender::Unknown,
            chief_complaint: String::new(),
            vitals: VitalSigns::default(),
            pain_scale: 0,
            consciousness: ConsciousnessLevel::Alert,
            bleeding: false,
            breathing_difficulty: false,
            trauma_indicator: false,
            chronic_condition_count: 0,
            medication_count: 0,
            allergy_present: false,
            previous_admission_count: 0,
            taken_at: Utc::now(),
        }
    }
}
