use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::patient::{EsiLevel, PatientSnapshot};
use crate::triage::Assessment;

/// One classification together with the snapshot it was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub assessment: Assessment,
    pub snapshot: PatientSnapshot,
}

/// Append-only assessment history, keyed by patient.
#[derive(Debug, Default)]
pub struct AssessmentLog {
    records: DashMap<String, Vec<AssessmentRecord>>,
}

impl AssessmentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: AssessmentRecord) {
        self.records
            .entry(record.assessment.patient_id.clone())
            .or_default()
            .push(record);
    }

    /// Oldest first.
    pub fn history(&self, patient_id: &str) -> Vec<AssessmentRecord> {
        self.records
            .get(patient_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self, patient_id: &str) -> Option<AssessmentRecord> {
        self.records
            .get(patient_id)
            .and_then(|records| records.last().cloned())
    }

    pub fn latest_level(&self, patient_id: &str) -> Option<EsiLevel> {
        self.records
            .get(patient_id)
            .and_then(|records| records.last().map(|r| r.assessment.esi_level))
    }

    pub fn patient_count(&self) -> usize {
        self.records.len()
    }

    /// Most recent assessments across all patients, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AssessmentRecord> {
        let mut all: Vec<AssessmentRecord> = self
            .records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| b.assessment.assessed_at.cmp(&a.assessment.assessed_at));
        all.truncate(limit);
        all
    }
}
