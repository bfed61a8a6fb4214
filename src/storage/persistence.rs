use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{MemoryStore, RecordFilter, Store, StoredRecord};
use crate::error::{Result, TriageError};

const JOURNAL_FILE: &str = "triage.journal";

/// Append-only journal of stored records.
///
/// Each frame is a 4-byte big-endian length followed by the JSON record.
/// The journal is replayed into memory when opened; reads are served from
/// that copy and every save is appended and synced before it returns.
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    file: Mutex<File>,
    cache: MemoryStore,
}

impl JournalStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(JOURNAL_FILE);

        let records = match fs::read(&path).await {
            Ok(bytes) => {
                let (records, valid) = decode_frames(&bytes, &path);
                if valid < bytes.len() {
                    // Cut the damaged tail so new frames follow the last good one.
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(valid as u64).await?;
                    file.sync_all().await?;
                    warn!(path = %path.display(), dropped = bytes.len() - valid, "journal tail discarded");
                }
                records
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), records = records.len(), "journal opened");

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;

        Ok(JournalStore {
            path,
            file: Mutex::new(file),
            cache: MemoryStore::from_records(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the journal.
    pub async fn truncate(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        *file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        self.cache.clear().await;
        Ok(())
    }

    /// Rewrites the journal keeping every assessment but only the last
    /// version of each queue entry and alert.
    pub async fn compact(&self) -> Result<usize> {
        let mut file = self.file.lock().await;
        let records = compacted(self.cache.replay().await?);

        let mut bytes = Vec::new();
        for record in &records {
            bytes.extend_from_slice(&encode_frame(record)?);
        }

        // Write beside the journal, then swap it in.
        let temp_path = self.path.with_extension("tmp");
        let mut temp = File::create(&temp_path).await?;
        temp.write_all(&bytes).await?;
        temp.sync_all().await?;
        drop(temp);
        fs::rename(&temp_path, &self.path).await?;

        *file = OpenOptions::new().append(true).open(&self.path).await?;
        let kept = records.len();
        self.cache.clear().await;
        for record in &records {
            self.cache.save(record).await?;
        }
        info!(path = %self.path.display(), records = kept, "journal compacted");
        Ok(kept)
    }
}

#[async_trait]
impl Store for JournalStore {
    async fn save(&self, record: &StoredRecord) -> Result<()> {
        let frame = encode_frame(record)?;

        let mut file = self.file.lock().await;
        file.write_all(&frame).await?;
        file.sync_data().await?;
        self.cache.save(record).await
    }

    async fn load(&self, patient_id: &str) -> Result<Vec<StoredRecord>> {
        self.cache.load(patient_id).await
    }

    async fn query(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoredRecord>> {
        self.cache.query(filter, limit).await
    }

    async fn replay(&self) -> Result<Vec<StoredRecord>> {
        self.cache.replay().await
    }
}

fn encode_frame(record: &StoredRecord) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| TriageError::Storage(format!("Serialization failed: {}", e)))?;
    let size = u32::try_from(payload.len())
        .map_err(|_| TriageError::Storage(format!("record of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes frames up to the first damaged one and returns them with the
/// length of the readable prefix. A crash mid-append leaves at most one
/// partial frame at the tail.
fn decode_frames(bytes: &[u8], path: &Path) -> (Vec<StoredRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + 4) else {
            warn!(path = %path.display(), offset, "journal ends in a partial header");
            break;
        };
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = offset + 4;

        let Some(payload) = bytes.get(start..start + size) else {
            warn!(path = %path.display(), offset, "journal ends in a partial record");
            break;
        };
        match serde_json::from_slice::<StoredRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "stopping replay at unreadable record");
                break;
            }
        }
        offset = start + size;
    }

    (records, offset)
}

fn compacted(records: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let mut latest: HashMap<Uuid, usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        match record {
            StoredRecord::QueueEntry(entry) => {
                latest.insert(entry.id, index);
            }
            StoredRecord::Alert(alert) => {
                latest.insert(alert.id, index);
            }
            StoredRecord::Assessment(_) => {}
        }
    }

    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| match record {
            StoredRecord::QueueEntry(entry) => latest.get(&entry.id) == Some(index),
            StoredRecord::Alert(alert) => latest.get(&alert.id) == Some(index),
            StoredRecord::Assessment(_) => true,
        })
        .map(|(_, record)| record)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::EsiLevel;
    use crate::queue::{QueueEntry, QueueStatus};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(patient_id: &str) -> QueueEntry {
        QueueEntry::new(
            patient_id,
            EsiLevel::Urgent,
            200.0,
            30,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn saved_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let first = StoredRecord::QueueEntry(entry("a"));
        let second = StoredRecord::QueueEntry(entry("b"));

        {
            let journal = JournalStore::open(dir.path()).await.unwrap();
            journal.save(&first).await.unwrap();
            journal.save(&second).await.unwrap();
        }

        let journal = JournalStore::open(dir.path()).await.unwrap();
        assert_eq!(journal.replay().await.unwrap(), vec![first.clone(), second]);
        assert_eq!(journal.load("a").await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let record = StoredRecord::QueueEntry(entry("a"));
        {
            let journal = JournalStore::open(dir.path()).await.unwrap();
            journal.save(&record).await.unwrap();
        }

        // Half a frame, as left by a crash during append.
        let path = dir.path().join(JOURNAL_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let frame = encode_frame(&record).unwrap();
        bytes.extend_from_slice(&frame[..frame.len() / 2]);
        std::fs::write(&path, bytes).unwrap();

        let journal = JournalStore::open(dir.path()).await.unwrap();
        assert_eq!(journal.replay().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn saves_after_a_torn_tail_survive_reopen() {
        let dir = tempdir().unwrap();
        let a = StoredRecord::QueueEntry(entry("a"));
        {
            let journal = JournalStore::open(dir.path()).await.unwrap();
            journal.save(&a).await.unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let frame = encode_frame(&a).unwrap();
        bytes.extend_from_slice(&frame[..frame.len() / 2]);
        std::fs::write(&path, bytes).unwrap();

        let b = StoredRecord::QueueEntry(entry("b"));
        let c = StoredRecord::QueueEntry(entry("c"));
        {
            let journal = JournalStore::open(dir.path()).await.unwrap();
            assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), frame.len() as u64);
            journal.save(&b).await.unwrap();
            journal.save(&c).await.unwrap();
        }

        let journal = JournalStore::open(dir.path()).await.unwrap();
        assert_eq!(journal.replay().await.unwrap(), vec![a, b, c]);
    }

    #[test]
    fn decode_reports_the_readable_prefix() {
        let record = StoredRecord::QueueEntry(entry("a"));
        let frame = encode_frame(&record).unwrap();
        let mut bytes = frame.clone();
        bytes.extend_from_slice(&[0, 0]);

        let (records, valid) = decode_frames(&bytes, Path::new("test.journal"));
        assert_eq!(records, vec![record]);
        assert_eq!(valid, frame.len());
    }

    #[tokio::test]
    async fn compact_keeps_last_version_of_each_entry() {
        let dir = tempdir().unwrap();
        let journal = JournalStore::open(dir.path()).await.unwrap();

        let mut a = entry("a");
        journal.save(&StoredRecord::QueueEntry(a.clone())).await.unwrap();
        a.status = QueueStatus::InTreatment;
        journal.save(&StoredRecord::QueueEntry(a.clone())).await.unwrap();
        journal.save(&StoredRecord::QueueEntry(entry("b"))).await.unwrap();

        assert_eq!(journal.compact().await.unwrap(), 2);

        let reopened = JournalStore::open(dir.path()).await.unwrap();
        let records = reopened.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], StoredRecord::QueueEntry(a));

        // Appends after compaction land in the new file.
        reopened.save(&StoredRecord::QueueEntry(entry("c"))).await.unwrap();
        drop(reopened);
        assert_eq!(JournalStore::open(dir.path()).await.unwrap().replay().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn truncate_empties_the_journal() {
        let dir = tempdir().unwrap();
        let journal = JournalStore::open(dir.path()).await.unwrap();
        journal.save(&StoredRecord::QueueEntry(entry("a"))).await.unwrap();

        journal.truncate().await.unwrap();
        assert!(journal.replay().await.unwrap().is_empty());
        drop(journal);
        assert!(JournalStore::open(dir.path()).await.unwrap().replay().await.unwrap().is_empty());
    }
}
