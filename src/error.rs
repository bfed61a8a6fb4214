use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueStatus;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Patient not found in queue: {0}")]
    PatientNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error("Invalid transition for patient {patient_id}: {from} -> {to}")]
    InvalidTransition {
        patient_id: String,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TriageError {
    /// True for errors the request layer should report as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, TriageError::PatientNotFound(_) | TriageError::AlertNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;
