//! Persistence collaborators
//!
//! The engine keeps its working state in memory. A `Store` receives every
//! assessment, queue entry change and alert so that state can be rebuilt
//! after a restart.

mod persistence;

pub use persistence::JournalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::alerts::Alert;
use crate::error::Result;
use crate::history::AssessmentRecord;
use crate::queue::QueueEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Assessment(AssessmentRecord),
    QueueEntry(QueueEntry),
    Alert(Alert),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Assessment,
    QueueEntry,
    Alert,
}

impl StoredRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            StoredRecord::Assessment(_) => RecordKind::Assessment,
            StoredRecord::QueueEntry(_) => RecordKind::QueueEntry,
            StoredRecord::Alert(_) => RecordKind::Alert,
        }
    }

    pub fn patient_id(&self) -> Option<&str> {
        match self {
            StoredRecord::Assessment(record) => Some(&record.assessment.patient_id),
            StoredRecord::QueueEntry(entry) => Some(&entry.patient_id),
            StoredRecord::Alert(alert) => alert.patient_id.as_deref(),
        }
    }

    /// Time of the last change the record describes.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StoredRecord::Assessment(record) => record.assessment.assessed_at,
            StoredRecord::QueueEntry(entry) => entry.updated_at,
            StoredRecord::Alert(alert) => alert.acknowledged_at.unwrap_or(alert.created_at),
        }
    }
}

/// Selection for `Store::query`. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub patient_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub newest_first: bool,
}

impl RecordFilter {
    pub fn kind(kind: RecordKind) -> Self {
        RecordFilter {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.kind.map_or(true, |kind| record.kind() == kind)
            && self
                .patient_id
                .as_deref()
                .map_or(true, |id| record.patient_id() == Some(id))
            && self.since.map_or(true, |since| record.timestamp() >= since)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, record: &StoredRecord) -> Result<()>;

    /// Every record about one patient, in save order.
    async fn load(&self, patient_id: &str) -> Result<Vec<StoredRecord>>;

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoredRecord>>;

    /// Everything, in save order. Used to rebuild state at startup.
    async fn replay(&self) -> Result<Vec<StoredRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: Vec<StoredRecord>) -> Self {
        MemoryStore {
            records: RwLock::new(records),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub(crate) async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, record: &StoredRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn load(&self, patient_id: &str) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| record.patient_id() == Some(patient_id))
            .cloned()
            .collect())
    }

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().await;
        let mut selected: Vec<StoredRecord> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        if filter.newest_first {
            // Stable sort keeps save order among equal timestamps.
            selected.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        } else {
            selected.sort_by_key(StoredRecord::timestamp);
        }
        selected.truncate(limit);
        Ok(selected)
    }

    async fn replay(&self) -> Result<Vec<StoredRecord>> {
        Ok(self.records.read().await.clone())
    }
}
