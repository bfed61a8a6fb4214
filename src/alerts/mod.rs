//! Alerting
//!
//! `AlertPolicy` decides when an alert is due; `AlertBook` keeps the alerts
//! that were raised and tracks acknowledgement.

mod book;

pub use book::AlertBook;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::patient::EsiLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CriticalPatient,
    ConditionChange,
    CriticalBacklog,
    Overcrowding,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertType::CriticalPatient => "critical_patient",
            AlertType::ConditionChange => "condition_change",
            AlertType::CriticalBacklog => "critical_backlog",
            AlertType::Overcrowding => "overcrowding",
        };
        f.write_str(name)
    }
}

/// An alert the policy wants raised. `AlertBook::raise` turns it into an
/// `Alert` with an id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub patient_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub patient_id: Option<String>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_draft(draft: AlertDraft, now: DateTime<Utc>) -> Self {
        Alert {
            id: Uuid::new_v4(),
            patient_id: draft.patient_id,
            alert_type: draft.alert_type,
            severity: draft.severity,
            message: draft.message,
            acknowledged: false,
            acknowledged_by: None,
            created_at: now,
            acknowledged_at: None,
        }
    }
}

/// Decides which alerts a state change should raise.
///
/// Patient alerts are edge-triggered by assessments. Queue alerts are
/// level-triggered and evaluated on every refresh, so each type is held
/// back for `repeat_interval` after firing and re-armed once its condition
/// clears.
#[derive(Debug)]
pub struct AlertPolicy {
    config: AlertConfig,
    last_fired: Mutex<HashMap<AlertType, DateTime<Utc>>>,
}

impl AlertPolicy {
    pub fn new(config: AlertConfig) -> Self {
        AlertPolicy {
            config,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_assessment(
        &self,
        patient_id: &str,
        previous: Option<EsiLevel>,
        current: EsiLevel,
        chief_complaint: &str,
    ) -> Option<AlertDraft> {
        match previous {
            None if current.is_critical() => Some(AlertDraft {
                alert_type: AlertType::CriticalPatient,
                severity: if current == EsiLevel::Resuscitation {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                },
                message: format!("Critical patient ({}): {}", current, chief_complaint),
                patient_id: Some(patient_id.to_string()),
            }),
            None => None,
            Some(old) if old == current => None,
            Some(old) => {
                let severity = if current > old {
                    AlertSeverity::Medium
                } else if current == EsiLevel::Resuscitation {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                };
                Some(AlertDraft {
                    alert_type: AlertType::ConditionChange,
                    severity,
                    message: format!("Patient condition change: {} → {}", old, current),
                    patient_id: Some(patient_id.to_string()),
                })
            }
        }
    }

    /// Overcrowding outranks a critical backlog when both hold.
    pub fn on_queue_snapshot(&self, waiting: usize, critical: usize, now: DateTime<Utc>) -> Option<AlertDraft> {
        let candidates = [
            (
                AlertType::Overcrowding,
                waiting >= self.config.overcrowding,
                AlertSeverity::Critical,
                format!("Emergency department at critical capacity: {} patients waiting", waiting),
            ),
            (
                AlertType::CriticalBacklog,
                critical >= self.config.critical_backlog,
                AlertSeverity::High,
                format!(
                    "Multiple critical patients waiting: {} ESI 1-2 patients require immediate attention",
                    critical
                ),
            ),
        ];

        let repeat = Duration::seconds(self.config.repeat_interval_secs);
        let mut last_fired = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fired = None;

        for (alert_type, active, severity, message) in candidates {
            if !active {
                last_fired.remove(&alert_type);
                continue;
            }
            if fired.is_some() {
                continue;
            }
            if let Some(last) = last_fired.get(&alert_type) {
                if now - *last < repeat {
                    debug!(%alert_type, "queue alert suppressed");
                    continue;
                }
            }
            last_fired.insert(alert_type, now);
            fired = Some(AlertDraft {
                alert_type,
                severity,
                message,
                patient_id: None,
            });
        }

        fired
    }
}
