use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, TriageError};
use crate::patient::EsiLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    InTreatment,
    Completed,
    Discharged,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Discharged)
    }

    pub fn can_transition_to(self, target: QueueStatus) -> bool {
        matches!(
            (self, target),
            (QueueStatus::Waiting, QueueStatus::InTreatment)
                | (QueueStatus::InTreatment, QueueStatus::Completed)
                | (QueueStatus::Waiting, QueueStatus::Discharged)
                | (QueueStatus::InTreatment, QueueStatus::Discharged)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::InTreatment => "in_treatment",
            QueueStatus::Completed => "completed",
            QueueStatus::Discharged => "discharged",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assessment that arrived after treatment had already started. Kept on the
/// entry for the record, never applied to its ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredReassessment {
    pub esi_level: EsiLevel,
    pub priority_score: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub patient_id: String,
    pub esi_level: EsiLevel,
    pub priority_score: f64,
    pub status: QueueStatus,
    pub entered_queue_time: DateTime<Utc>,
    pub treatment_started_time: Option<DateTime<Utc>>,
    pub treatment_completed_time: Option<DateTime<Utc>>,
    pub discharged_time: Option<DateTime<Utc>>,
    pub estimated_treatment_minutes: i64,
    pub actual_treatment_minutes: Option<i64>,
    pub deferred_reassessments: Vec<DeferredReassessment>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        patient_id: impl Into<String>,
        esi_level: EsiLevel,
        priority_score: f64,
        estimated_treatment_minutes: i64,
        now: DateTime<Utc>,
    ) -> Self {
        QueueEntry {
            id: Uuid::new_v4(),
            patient_id: patient_id.into(),
            esi_level,
            priority_score,
            status: QueueStatus::Waiting,
            entered_queue_time: now,
            treatment_started_time: None,
            treatment_completed_time: None,
            discharged_time: None,
            estimated_treatment_minutes,
            actual_treatment_minutes: None,
            deferred_reassessments: Vec::new(),
            updated_at: now,
        }
    }

    /// Whole minutes spent waiting, floored and never negative. Stops
    /// counting once treatment starts.
    pub fn elapsed_wait_minutes(&self, now: DateTime<Utc>) -> i64 {
        let until = self.treatment_started_time.unwrap_or(now);
        whole_minutes(until - self.entered_queue_time)
    }

    pub fn remaining_wait_minutes(&self, now: DateTime<Utc>) -> i64 {
        (self.estimated_treatment_minutes - self.elapsed_wait_minutes(now)).max(0)
    }

    /// Queue order: ESI ascending, score descending, arrival ascending.
    /// Patient id settles exact ties so the order is total.
    pub fn rank_cmp(&self, other: &QueueEntry) -> Ordering {
        self.esi_level
            .cmp(&other.esi_level)
            .then_with(|| other.priority_score.total_cmp(&self.priority_score))
            .then_with(|| self.entered_queue_time.cmp(&other.entered_queue_time))
            .then_with(|| self.patient_id.cmp(&other.patient_id))
    }

    /// Applies a status change, or leaves the entry untouched and errors.
    pub(crate) fn apply(&mut self, target: QueueStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(TriageError::InvalidTransition {
                patient_id: self.patient_id.clone(),
                from: self.status,
                to: target,
            });
        }

        match target {
            QueueStatus::InTreatment => {
                self.treatment_started_time = Some(now);
            }
            QueueStatus::Completed => {
                self.treatment_completed_time = Some(now);
                self.actual_treatment_minutes = self
                    .treatment_started_time
                    .map(|started| whole_minutes(now - started));
            }
            QueueStatus::Discharged => {
                self.discharged_time = Some(now);
            }
            QueueStatus::Waiting => {}
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

fn whole_minutes(duration: chrono::Duration) -> i64 {
    duration.num_minutes().max(0)
}

/// One row of the waiting list, with position and wait computed at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueView {
    pub entry: QueueEntry,
    pub position: usize,
    pub wait_minutes: i64,
    pub remaining_wait_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(QueueEntry),
    Updated { entry: QueueEntry, previous_esi: EsiLevel },
    /// Treatment already started; the assessment was recorded only.
    Deferred(QueueEntry),
}

impl UpsertOutcome {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            UpsertOutcome::Created(entry) => entry,
            UpsertOutcome::Updated { entry, .. } => entry,
            UpsertOutcome::Deferred(entry) => entry,
        }
    }

    pub fn into_entry(self) -> QueueEntry {
        match self {
            UpsertOutcome::Created(entry) => entry,
            UpsertOutcome::Updated { entry, .. } => entry,
            UpsertOutcome::Deferred(entry) => entry,
        }
    }
}
