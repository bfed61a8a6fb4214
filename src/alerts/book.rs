use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use super::{Alert, AlertDraft};
use crate::error::{Result, TriageError};

/// Alerts raised so far. Alerts are never removed, only acknowledged.
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: DashMap<Uuid, Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, draft: AlertDraft, now: DateTime<Utc>) -> Alert {
        let alert = Alert::from_draft(draft, now);
        info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            patient_id = alert.patient_id.as_deref().unwrap_or("-"),
            "alert raised"
        );
        self.alerts.insert(alert.id, alert.clone());
        alert
    }

    /// Acknowledging twice keeps the first acknowledgement.
    pub fn acknowledge(&self, id: Uuid, by: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut alert = self.alerts.get_mut(&id).ok_or(TriageError::AlertNotFound(id))?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(by.to_string());
            alert.acknowledged_at = Some(now);
            info!(alert_id = %id, by, "alert acknowledged");
        }
        Ok(alert.clone())
    }

    pub fn get(&self, id: Uuid) -> Result<Alert> {
        self.alerts
            .get(&id)
            .map(|alert| alert.clone())
            .ok_or(TriageError::AlertNotFound(id))
    }

    /// Unacknowledged alerts, newest first.
    pub fn active(&self, limit: usize) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|alert| !alert.acknowledged)
            .map(|alert| alert.clone())
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        active.truncate(limit);
        active
    }

    pub fn active_count(&self) -> usize {
        self.alerts.iter().filter(|alert| !alert.acknowledged).count()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Later copies of the same alert replace earlier ones.
    pub fn restore(&self, alerts: impl IntoIterator<Item = Alert>) {
        for alert in alerts {
            self.alerts.insert(alert.id, alert);
        }
    }
}
