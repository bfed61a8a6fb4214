//! Treatment queue state machine
//!
//! Each patient's current entry sits behind its own mutex, so operations on
//! different patients never serialise on each other. The map of entries is
//! behind an `RwLock` that is only write-locked to add or replace an entry.
//! Lock order is always map, then entry. The archive is only locked once
//! no entry lock is held.

mod entry;

pub use entry::{DeferredReassessment, QueueEntry, QueueStatus, QueueView, UpsertOutcome};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::error::{Result, TriageError};
use crate::patient::EsiLevel;

type Slot = Arc<Mutex<QueueEntry>>;

#[derive(Debug)]
pub struct QueueEngine {
    // Current entry per patient: active, or the latest terminal one until
    // the patient comes back.
    entries: RwLock<HashMap<String, Slot>>,
    // Terminal entries replaced by a newer visit.
    archive: Mutex<Vec<QueueEntry>>,
    treatment_minutes: [i64; 5],
}

impl QueueEngine {
    pub fn new(config: &QueueConfig) -> Self {
        QueueEngine {
            entries: RwLock::new(HashMap::new()),
            archive: Mutex::new(Vec::new()),
            treatment_minutes: config.treatment_minutes,
        }
    }

    pub fn estimated_treatment_minutes(&self, esi_level: EsiLevel) -> i64 {
        self.treatment_minutes[esi_level.index()]
    }

    pub fn upsert_assessment(&self, patient_id: &str, esi_level: EsiLevel, score: f64) -> UpsertOutcome {
        self.upsert_assessment_at(patient_id, esi_level, score, Utc::now())
    }

    pub fn upsert_assessment_at(
        &self,
        patient_id: &str,
        esi_level: EsiLevel,
        score: f64,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        loop {
            let seen = self.slot(patient_id);

            if let Some(slot) = &seen {
                let mut entry = lock(slot);
                match entry.status {
                    QueueStatus::Waiting => {
                        let previous_esi = entry.esi_level;
                        entry.esi_level = esi_level;
                        entry.priority_score = score;
                        entry.estimated_treatment_minutes = self.estimated_treatment_minutes(esi_level);
                        entry.updated_at = now;
                        debug!(patient_id, esi = esi_level.as_u8(), score, "re-ranked waiting entry");
                        return UpsertOutcome::Updated {
                            entry: entry.clone(),
                            previous_esi,
                        };
                    }
                    QueueStatus::InTreatment => {
                        entry.deferred_reassessments.push(DeferredReassessment {
                            esi_level,
                            priority_score: score,
                            recorded_at: now,
                        });
                        entry.updated_at = now;
                        info!(patient_id, esi = esi_level.as_u8(), "reassessment recorded during treatment");
                        return UpsertOutcome::Deferred(entry.clone());
                    }
                    QueueStatus::Completed | QueueStatus::Discharged => {}
                }
            }

            // No active entry: open a new visit, unless another writer got
            // there between the lookup and the write lock.
            let mut map = write(&self.entries);
            let unchanged = match (map.get(patient_id), &seen) {
                (None, None) => true,
                (Some(current), Some(seen)) => Arc::ptr_eq(current, seen),
                _ => false,
            };
            if !unchanged {
                continue;
            }

            let fresh = QueueEntry::new(
                patient_id,
                esi_level,
                score,
                self.estimated_treatment_minutes(esi_level),
                now,
            );
            if let Some(previous) = map.insert(patient_id.to_string(), Arc::new(Mutex::new(fresh.clone()))) {
                let retired = lock(&previous).clone();
                lock(&self.archive).push(retired);
            }
            info!(patient_id, esi = esi_level.as_u8(), score, "patient entered queue");
            return UpsertOutcome::Created(fresh);
        }
    }

    pub fn start_treatment(&self, patient_id: &str) -> Result<QueueEntry> {
        self.transition_at(patient_id, QueueStatus::InTreatment, Utc::now())
    }

    pub fn complete_treatment(&self, patient_id: &str) -> Result<QueueEntry> {
        self.transition_at(patient_id, QueueStatus::Completed, Utc::now())
    }

    pub fn discharge(&self, patient_id: &str) -> Result<QueueEntry> {
        self.transition_at(patient_id, QueueStatus::Discharged, Utc::now())
    }

    /// All-or-nothing: on error the entry is left exactly as it was.
    pub fn transition_at(&self, patient_id: &str, target: QueueStatus, now: DateTime<Utc>) -> Result<QueueEntry> {
        let slot = self
            .slot(patient_id)
            .ok_or_else(|| TriageError::PatientNotFound(patient_id.to_string()))?;

        let mut entry = lock(&slot);
        let from = entry.status;
        entry.apply(target, now)?;
        info!(patient_id, %from, to = %target, "queue transition");
        Ok(entry.clone())
    }

    pub fn get(&self, patient_id: &str) -> Result<QueueEntry> {
        self.slot(patient_id)
            .map(|slot| lock(&slot).clone())
            .ok_or_else(|| TriageError::PatientNotFound(patient_id.to_string()))
    }

    pub fn contains(&self, patient_id: &str) -> bool {
        read(&self.entries).contains_key(patient_id)
    }

    /// Copy of every current entry, whatever its status.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.slots().iter().map(|slot| lock(slot).clone()).collect()
    }

    /// Waiting entries in queue order.
    pub fn waiting(&self) -> Vec<QueueEntry> {
        let mut waiting: Vec<QueueEntry> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.status == QueueStatus::Waiting)
            .collect();
        waiting.sort_by(QueueEntry::rank_cmp);
        waiting
    }

    /// Positions are ranks in the full waiting order, so a filtered listing
    /// still reports where each patient stands overall.
    pub fn list_waiting(&self, limit: usize, esi_filter: Option<EsiLevel>, now: DateTime<Utc>) -> Vec<QueueView> {
        self.waiting()
            .into_iter()
            .enumerate()
            .filter(|(_, entry)| esi_filter.map_or(true, |level| entry.esi_level == level))
            .take(limit)
            .map(|(index, entry)| QueueView {
                position: index + 1,
                wait_minutes: entry.elapsed_wait_minutes(now),
                remaining_wait_minutes: entry.remaining_wait_minutes(now),
                entry,
            })
            .collect()
    }

    pub fn position(&self, patient_id: &str) -> Option<usize> {
        self.waiting()
            .iter()
            .position(|entry| entry.patient_id == patient_id)
            .map(|index| index + 1)
    }

    /// Recomputes the score of every waiting entry. Returns how many changed.
    pub fn refresh_scores<F>(&self, now: DateTime<Utc>, score: F) -> usize
    where
        F: Fn(&QueueEntry, i64) -> f64,
    {
        let mut changed = 0;
        for slot in self.slots() {
            let mut entry = lock(&slot);
            if entry.status != QueueStatus::Waiting {
                continue;
            }
            let wait = entry.elapsed_wait_minutes(now);
            let updated = score(&entry, wait);
            if updated != entry.priority_score {
                entry.priority_score = updated;
                entry.updated_at = now;
                changed += 1;
            }
        }
        changed
    }

    /// Loads entries recovered from storage. The newest entry per patient
    /// becomes current; older ones go to the archive.
    pub fn restore(&self, entries: impl IntoIterator<Item = QueueEntry>) {
        let mut map = write(&self.entries);
        let mut retired = Vec::new();

        for entry in entries {
            let replace = match map.get(&entry.patient_id) {
                None => true,
                Some(slot) => {
                    let current = lock(slot);
                    if current.id == entry.id {
                        true
                    } else if entry.entered_queue_time >= current.entered_queue_time {
                        retired.push(current.clone());
                        true
                    } else {
                        retired.push(entry.clone());
                        false
                    }
                }
            };
            if replace {
                map.insert(entry.patient_id.clone(), Arc::new(Mutex::new(entry)));
            }
        }
        lock(&self.archive).extend(retired);
        info!(patients = map.len(), "queue restored");
    }

    pub fn archived(&self) -> Vec<QueueEntry> {
        lock(&self.archive).clone()
    }

    fn slot(&self, patient_id: &str) -> Option<Slot> {
        read(&self.entries).get(patient_id).cloned()
    }

    // Handles are cloned under the read lock, so a listing sees each patient
    // exactly once even while other patients are being added.
    fn slots(&self) -> Vec<Slot> {
        read(&self.entries).values().cloned().collect()
    }
}

// Every mutation is validated before it is written, so a guard recovered
// from a poisoned lock still holds a consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::thread;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn engine() -> QueueEngine {
        QueueEngine::new(&QueueConfig::default())
    }

    fn ids(views: &[QueueView]) -> Vec<&str> {
        views.iter().map(|v| v.entry.patient_id.as_str()).collect()
    }

    #[test]
    fn equal_scores_are_served_in_arrival_order() {
        let queue = engine();
        queue.upsert_assessment_at("late", EsiLevel::Urgent, 50.0, t0() + Duration::minutes(2));
        queue.upsert_assessment_at("early", EsiLevel::Urgent, 50.0, t0());

        let listing = queue.list_waiting(10, None, t0() + Duration::minutes(5));
        assert_eq!(ids(&listing), vec!["early", "late"]);
        assert_eq!(listing[0].position, 1);
        assert_eq!(listing[0].wait_minutes, 5);
    }

    #[test]
    fn listing_is_ordered_and_repeatable() {
        let queue = engine();
        queue.upsert_assessment_at("minor", EsiLevel::NonUrgent, 60.0, t0());
        queue.upsert_assessment_at("urgent-low", EsiLevel::Urgent, 205.0, t0());
        queue.upsert_assessment_at("urgent-high", EsiLevel::Urgent, 230.0, t0() + Duration::minutes(1));
        queue.upsert_assessment_at("critical", EsiLevel::Resuscitation, 1000.0, t0() + Duration::minutes(3));

        let now = t0() + Duration::minutes(10);
        let first = queue.list_waiting(10, None, now);
        assert_eq!(ids(&first), vec!["critical", "urgent-high", "urgent-low", "minor"]);
        assert_eq!(first, queue.list_waiting(10, None, now));
    }

    #[test]
    fn filtered_listing_keeps_global_positions() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Emergent, 500.0, t0());
        queue.upsert_assessment_at("b", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("c", EsiLevel::Urgent, 190.0, t0());

        let urgent = queue.list_waiting(10, Some(EsiLevel::Urgent), t0());
        assert_eq!(ids(&urgent), vec!["b", "c"]);
        assert_eq!(urgent.iter().map(|v| v.position).collect::<Vec<_>>(), vec![2, 3]);

        assert_eq!(queue.list_waiting(1, None, t0()).len(), 1);
    }

    #[test]
    fn reassessment_while_waiting_reranks() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("b", EsiLevel::Urgent, 210.0, t0());
        assert_eq!(queue.position("a"), Some(2));

        let outcome = queue.upsert_assessment_at("a", EsiLevel::Emergent, 500.0, t0() + Duration::minutes(4));
        match &outcome {
            UpsertOutcome::Updated { entry, previous_esi } => {
                assert_eq!(*previous_esi, EsiLevel::Urgent);
                assert_eq!(entry.estimated_treatment_minutes, 10);
                assert_eq!(entry.entered_queue_time, t0());
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(queue.position("a"), Some(1));
    }

    #[test]
    fn reassessment_during_treatment_is_recorded_not_applied() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0());
        queue.transition_at("a", QueueStatus::InTreatment, t0() + Duration::minutes(5)).unwrap();

        let outcome = queue.upsert_assessment_at("a", EsiLevel::Resuscitation, 1000.0, t0() + Duration::minutes(6));
        let entry = match outcome {
            UpsertOutcome::Deferred(entry) => entry,
            other => panic!("expected deferred, got {:?}", other),
        };
        assert_eq!(entry.esi_level, EsiLevel::Urgent);
        assert_eq!(entry.priority_score, 200.0);
        assert_eq!(entry.status, QueueStatus::InTreatment);
        assert_eq!(entry.deferred_reassessments.len(), 1);
        assert_eq!(entry.deferred_reassessments[0].esi_level, EsiLevel::Resuscitation);
    }

    #[test]
    fn full_treatment_cycle_records_duration() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0());
        let started = t0() + Duration::minutes(12);
        let completed = started + Duration::minutes(47) + Duration::seconds(30);

        let entry = queue.transition_at("a", QueueStatus::InTreatment, started).unwrap();
        assert_eq!(entry.treatment_started_time, Some(started));

        let entry = queue.transition_at("a", QueueStatus::Completed, completed).unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
        assert_eq!(entry.treatment_completed_time, Some(completed));
        assert_eq!(entry.actual_treatment_minutes, Some(47));
        assert!(queue.waiting().is_empty());
    }

    #[test]
    fn illegal_transitions_fail_without_side_effects() {
        let queue = engine();
        queue.upsert_assessment_at("w", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("t", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("c", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("d", EsiLevel::Urgent, 200.0, t0());
        queue.start_treatment("t").unwrap();
        queue.start_treatment("c").unwrap();
        queue.complete_treatment("c").unwrap();
        queue.discharge("d").unwrap();

        let before = queue.entries();
        for id in ["t", "c", "d"] {
            let err = queue.start_treatment(id).unwrap_err();
            assert!(matches!(err, TriageError::InvalidTransition { .. }), "{id}: {err}");
        }
        assert!(matches!(queue.complete_treatment("w"), Err(TriageError::InvalidTransition { .. })));
        assert!(matches!(queue.discharge("c"), Err(TriageError::InvalidTransition { .. })));

        let mut after = queue.entries();
        let mut before = before;
        before.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        after.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        assert_eq!(before, after);
    }

    #[test]
    fn successful_transition_touches_one_entry() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("b", EsiLevel::Urgent, 200.0, t0());
        let b_before = queue.get("b").unwrap();

        queue.start_treatment("a").unwrap();
        assert_eq!(queue.get("b").unwrap(), b_before);
    }

    #[test]
    fn unknown_patient_is_not_found() {
        let queue = engine();
        assert!(matches!(queue.start_treatment("ghost"), Err(TriageError::PatientNotFound(_))));
        assert!(matches!(queue.get("ghost"), Err(TriageError::PatientNotFound(_))));
    }

    #[test]
    fn returning_patient_opens_a_new_visit() {
        let queue = engine();
        let first = queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0()).into_entry();
        queue.discharge("a").unwrap();

        let outcome = queue.upsert_assessment_at("a", EsiLevel::LessUrgent, 50.0, t0() + Duration::hours(3));
        assert!(matches!(outcome, UpsertOutcome::Created(_)));
        assert_ne!(outcome.entry().id, first.id);
        assert_eq!(queue.archived().len(), 1);
        assert_eq!(queue.archived()[0].status, QueueStatus::Discharged);
    }

    #[test]
    fn refresh_updates_only_waiting_scores() {
        let queue = engine();
        queue.upsert_assessment_at("a", EsiLevel::Urgent, 200.0, t0());
        queue.upsert_assessment_at("b", EsiLevel::Urgent, 200.0, t0());
        queue.start_treatment("b").unwrap();

        let changed = queue.refresh_scores(t0() + Duration::minutes(20), |entry, wait| {
            entry.priority_score.floor() + wait as f64
        });
        assert_eq!(changed, 1);
        assert_eq!(queue.get("a").unwrap().priority_score, 220.0);
        assert_eq!(queue.get("b").unwrap().priority_score, 200.0);
    }

    #[test]
    fn restore_keeps_latest_visit_current() {
        let queue = engine();
        let old = QueueEntry::new("a", EsiLevel::Urgent, 200.0, 30, t0());
        let mut done = old.clone();
        done.status = QueueStatus::Completed;
        let newer = QueueEntry::new("a", EsiLevel::NonUrgent, 10.0, 120, t0() + Duration::days(1));

        queue.restore(vec![old, done, newer.clone()]);
        assert_eq!(queue.get("a").unwrap(), newer);
        assert_eq!(queue.archived().len(), 1);
        assert_eq!(queue.archived()[0].status, QueueStatus::Completed);
    }

    #[test]
    fn concurrent_upserts_and_listings_never_tear() {
        let queue = engine();
        for i in 0..50 {
            queue.upsert_assessment_at(&format!("seed-{i}"), EsiLevel::LessUrgent, 50.0, t0());
        }

        thread::scope(|scope| {
            for worker in 0..4 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..100 {
                        let id = format!("w{worker}-{i}");
                        queue.upsert_assessment_at(&id, EsiLevel::Urgent, 200.0, t0());
                        queue.upsert_assessment_at(&id, EsiLevel::Emergent, 500.0, t0());
                        if i % 3 == 0 {
                            queue.start_treatment(&id).unwrap();
                        }
                    }
                });
            }
            for _ in 0..2 {
                let queue = &queue;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let listing = queue.list_waiting(usize::MAX, None, t0());
                        let unique: HashSet<&str> = ids(&listing).into_iter().collect();
                        assert_eq!(unique.len(), listing.len());
                        assert!(listing.len() >= 50, "seed entries never leave the queue");
                    }
                });
            }
        });

        let waiting = queue.waiting();
        // 4 workers x 100 patients, a third of each batch moved to treatment.
        assert_eq!(waiting.len(), 50 + 4 * (100 - 34));
        assert_eq!(queue.entries().len(), 50 + 400);
    }
}
