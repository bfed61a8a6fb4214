//! Triage service
//!
//! Owns one instance of every engine component and runs each operation
//! across them: classify, log, queue, alert, persist, notify. Built once at
//! startup and shared by handle.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertBook, AlertPolicy};
use crate::config::{Config, QueueConfig};
use crate::error::{Result, TriageError};
use crate::history::{AssessmentLog, AssessmentRecord};
use crate::notify::{Notifier, Topic};
use crate::patient::{EsiLevel, PatientSnapshot};
use crate::queue::{QueueEngine, QueueEntry, QueueStatus, QueueView, UpsertOutcome};
use crate::storage::{Store, StoredRecord};
use crate::triage::{Assessment, Classifier, PriorityScorer};

/// What an assessment did to the patient's queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEffect {
    Enqueued,
    Reranked,
    /// Treatment had started; the assessment was only recorded.
    Deferred,
    /// The visit is closed; the assessment was only recorded.
    NotQueued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentOutcome {
    pub assessment: Assessment,
    pub entry: QueueEntry,
    pub effect: QueueEffect,
    pub queue_position: Option<usize>,
    pub alert: Option<Alert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub total_patients: usize,
    pub waiting_patients: usize,
    pub in_treatment_patients: usize,
    pub critical_patients: usize,
    pub esi_distribution: BTreeMap<String, usize>,
    pub average_wait_minutes: f64,
    pub active_alerts: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub rescored: usize,
    pub waiting: usize,
    pub alert: Option<Alert>,
}

pub struct TriageService {
    classifier: Arc<dyn Classifier>,
    scorer: PriorityScorer,
    queue: QueueEngine,
    log: AssessmentLog,
    policy: AlertPolicy,
    alerts: AlertBook,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    limits: QueueConfig,
    /// Serializes assess, upsert and transition for one patient.
    patient_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TriageService {
    pub fn new(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        TriageService {
            classifier,
            scorer: PriorityScorer::new(config.scoring.clone()),
            queue: QueueEngine::new(&config.queue),
            log: AssessmentLog::new(),
            policy: AlertPolicy::new(config.alerts.clone()),
            alerts: AlertBook::new(),
            store,
            notifier,
            limits: config.queue.clone(),
            patient_locks: DashMap::new(),
        }
    }

    fn patient_lock(&self, patient_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.patient_locks.entry(patient_id.to_string()).or_default())
    }

    pub fn queue(&self) -> &QueueEngine {
        &self.queue
    }

    pub fn alert_book(&self) -> &AlertBook {
        &self.alerts
    }

    /// Classifies a new arrival and places them in the queue.
    #[instrument(skip(self, snapshot), fields(patient_id = %snapshot.patient_id))]
    pub async fn assess_and_enqueue(&self, snapshot: PatientSnapshot) -> Result<AssessmentOutcome> {
        if snapshot.patient_id.trim().is_empty() {
            return Err(TriageError::Validation("patient_id is required".to_string()));
        }

        let lock = self.patient_lock(&snapshot.patient_id);
        let _guard = lock.lock().await;

        // A patient still in the department is treated as a reassessment.
        let previous = self
            .queue
            .get(&snapshot.patient_id)
            .ok()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.esi_level);

        self.process(snapshot, previous, true).await
    }

    /// Classifies a patient already known to the department.
    #[instrument(skip(self, snapshot))]
    pub async fn reassess(&self, patient_id: &str, snapshot: PatientSnapshot) -> Result<AssessmentOutcome> {
        if snapshot.patient_id != patient_id {
            return Err(TriageError::Validation(format!(
                "snapshot is for patient {}, not {}",
                snapshot.patient_id, patient_id
            )));
        }

        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().await;

        let previous = self.log.latest_level(patient_id);
        if previous.is_none() && !self.queue.contains(patient_id) {
            return Err(TriageError::PatientNotFound(patient_id.to_string()));
        }

        let active = self
            .queue
            .get(patient_id)
            .map(|entry| !entry.status.is_terminal())
            .unwrap_or(true);

        self.process(snapshot, previous, active).await
    }

    /// Callers hold the patient's lock.
    async fn process(
        &self,
        snapshot: PatientSnapshot,
        previous: Option<EsiLevel>,
        enqueue: bool,
    ) -> Result<AssessmentOutcome> {
        let now = Utc::now();
        let patient_id = snapshot.patient_id.clone();
        let assessment = self.classifier.assess(&snapshot);
        let level = assessment.esi_level;

        let record = AssessmentRecord {
            assessment: assessment.clone(),
            snapshot: snapshot.clone(),
        };
        self.log.append(record.clone());
        self.persist(StoredRecord::Assessment(record)).await;

        let (entry, effect, previous) = if enqueue {
            let wait = self
                .queue
                .get(&patient_id)
                .ok()
                .filter(|entry| entry.status == QueueStatus::Waiting)
                .map(|entry| entry.elapsed_wait_minutes(now))
                .unwrap_or(0);
            let score = self.scorer.score(level, wait, snapshot.age, snapshot.pain_scale);

            match self.queue.upsert_assessment_at(&patient_id, level, score, now) {
                UpsertOutcome::Created(entry) => (entry, QueueEffect::Enqueued, previous),
                UpsertOutcome::Updated { entry, previous_esi } => {
                    (entry, QueueEffect::Reranked, Some(previous_esi))
                }
                UpsertOutcome::Deferred(entry) => (entry, QueueEffect::Deferred, previous),
            }
        } else {
            (self.queue.get(&patient_id)?, QueueEffect::NotQueued, previous)
        };

        if effect != QueueEffect::NotQueued {
            self.persist(StoredRecord::QueueEntry(entry.clone())).await;
        }

        let alert = match effect {
            QueueEffect::NotQueued => None,
            _ => self
                .policy
                .on_assessment(&patient_id, previous, level, &snapshot.chief_complaint)
                .map(|draft| self.alerts.raise(draft, now)),
        };
        if let Some(alert) = &alert {
            self.persist(StoredRecord::Alert(alert.clone())).await;
            self.publish(Topic::Alerts, "new_alert", alert);
        }

        let queue_position = self.queue.position(&patient_id);
        info!(
            patient_id = %patient_id,
            esi = level.as_u8(),
            confidence = assessment.confidence,
            effect = ?effect,
            position = queue_position,
            "patient assessed"
        );

        let outcome = AssessmentOutcome {
            assessment,
            entry,
            effect,
            queue_position,
            alert,
        };
        self.publish(Topic::Patient, "patient_update", &outcome);
        if matches!(effect, QueueEffect::Enqueued | QueueEffect::Reranked) {
            self.publish(Topic::Queue, "queue_change", &outcome.entry);
        }
        Ok(outcome)
    }

    /// `limit` defaults and is capped by the queue configuration.
    pub fn list_waiting(&self, limit: Option<usize>, esi_filter: Option<EsiLevel>) -> Vec<QueueView> {
        let limit = limit
            .unwrap_or(self.limits.default_list_limit)
            .min(self.limits.max_list_limit);
        self.queue.list_waiting(limit, esi_filter, Utc::now())
    }

    #[instrument(skip(self))]
    pub async fn transition(&self, patient_id: &str, target: QueueStatus) -> Result<QueueEntry> {
        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().await;
        let entry = self.queue.transition_at(patient_id, target, Utc::now())?;
        self.persist(StoredRecord::QueueEntry(entry.clone())).await;
        self.publish(Topic::Queue, "queue_change", &entry);
        Ok(entry)
    }

    #[instrument(skip(self))]
    pub async fn acknowledge_alert(&self, alert_id: Uuid, by: &str) -> Result<Alert> {
        let by = by.trim();
        if by.is_empty() {
            return Err(TriageError::Validation("acknowledged_by is required".to_string()));
        }
        let alert = self.alerts.acknowledge(alert_id, by, Utc::now())?;
        self.persist(StoredRecord::Alert(alert.clone())).await;
        self.publish(Topic::Alerts, "alert_acknowledged", &alert);
        Ok(alert)
    }

    pub fn alert(&self, alert_id: Uuid) -> Result<Alert> {
        self.alerts.get(alert_id)
    }

    pub fn active_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.active(limit)
    }

    /// Assessment history, oldest first.
    pub fn history(&self, patient_id: &str) -> Result<Vec<AssessmentRecord>> {
        let history = self.log.history(patient_id);
        if history.is_empty() {
            return Err(TriageError::PatientNotFound(patient_id.to_string()));
        }
        Ok(history)
    }

    pub fn dashboard_snapshot(&self) -> DashboardSnapshot {
        self.dashboard_at(Utc::now())
    }

    pub fn dashboard_at(&self, now: DateTime<Utc>) -> DashboardSnapshot {
        let entries = self.queue.entries();
        let waiting: Vec<&QueueEntry> = entries.iter().filter(|e| e.status == QueueStatus::Waiting).collect();

        let mut esi_distribution: BTreeMap<String, usize> = EsiLevel::ALL
            .iter()
            .map(|level| (format!("level_{}", level.as_u8()), 0))
            .collect();
        for entry in &waiting {
            *esi_distribution
                .entry(format!("level_{}", entry.esi_level.as_u8()))
                .or_insert(0) += 1;
        }

        let average_wait_minutes = if waiting.is_empty() {
            0.0
        } else {
            let total: i64 = waiting.iter().map(|e| e.elapsed_wait_minutes(now)).sum();
            (total as f64 / waiting.len() as f64 * 10.0).round() / 10.0
        };

        DashboardSnapshot {
            total_patients: self.log.patient_count(),
            waiting_patients: waiting.len(),
            in_treatment_patients: entries.iter().filter(|e| e.status == QueueStatus::InTreatment).count(),
            critical_patients: waiting.iter().filter(|e| e.esi_level.is_critical()).count(),
            esi_distribution,
            average_wait_minutes,
            active_alerts: self.alerts.active_count(),
            generated_at: now,
        }
    }

    /// Rescores waiting patients for the time they have waited, raises any
    /// queue-level alert, and publishes fresh snapshots.
    pub async fn refresh(&self, now: DateTime<Utc>) -> RefreshReport {
        let rescored = self.queue.refresh_scores(now, |entry, wait| {
            let (age, pain) = self
                .log
                .latest(&entry.patient_id)
                .map(|record| (record.snapshot.age, record.snapshot.pain_scale))
                .unwrap_or((PatientSnapshot::DEFAULT_AGE, 0));
            self.scorer.score(entry.esi_level, wait, age, pain)
        });

        let dashboard = self.dashboard_at(now);
        let alert = self
            .policy
            .on_queue_snapshot(dashboard.waiting_patients, dashboard.critical_patients, now)
            .map(|draft| self.alerts.raise(draft, now));
        if let Some(alert) = &alert {
            self.persist(StoredRecord::Alert(alert.clone())).await;
            self.publish(Topic::Alerts, "new_alert", alert);
        }

        let dashboard = self.dashboard_at(now);
        let queue = self.queue.list_waiting(self.limits.default_list_limit, None, now);
        self.publish(Topic::Dashboard, "dashboard_stats", &dashboard);
        self.publish(Topic::Queue, "queue_update", &queue);
        self.publish(Topic::Alerts, "alerts_update", &self.alerts.active(self.limits.default_list_limit));

        debug!(rescored, waiting = dashboard.waiting_patients, "queue refreshed");
        RefreshReport {
            rescored,
            waiting: dashboard.waiting_patients,
            alert,
        }
    }

    /// Rebuilds in-memory state from stored records, oldest first.
    pub fn restore(&self, records: Vec<StoredRecord>) {
        let mut entries = Vec::new();
        let mut alerts = Vec::new();
        let mut assessments = 0;

        for record in records {
            match record {
                StoredRecord::Assessment(record) => {
                    self.log.append(record);
                    assessments += 1;
                }
                StoredRecord::QueueEntry(entry) => entries.push(entry),
                StoredRecord::Alert(alert) => alerts.push(alert),
            }
        }

        let (entry_count, alert_count) = (entries.len(), alerts.len());
        self.queue.restore(entries);
        self.alerts.restore(alerts);
        info!(assessments, queue_records = entry_count, alert_records = alert_count, "state restored");
    }

    async fn persist(&self, record: StoredRecord) {
        // In-memory state is authoritative; a failed write is logged and the
        // operation still succeeds.
        if let Err(e) = self.store.save(&record).await {
            warn!(kind = ?record.kind(), error = %e, "failed to persist record");
        }
    }

    fn publish<T: Serialize + ?Sized>(&self, topic: Topic, event: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => self.notifier.publish(topic, event, value),
            Err(e) => warn!(?topic, event, error = %e, "failed to encode notification"),
        }
    }
}
