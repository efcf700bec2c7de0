//! In-memory reference adapter for the storage port.
//!
//! Every cell carries a version stamp; a transaction records the version of
//! each cell it reads (version 0 for a cell that does not exist yet) and the
//! commit re-validates those stamps under one lock before applying its staged
//! writes. First committer wins, later committers get [`StoreError::Conflict`].
//! The per-learner "active enrollment" and "open session" slots are versioned
//! cells of their own, so two transactions inserting for the same learner
//! collide even though neither read an existing row.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::domain::{
    AttendanceSession, Enrollment, EnrollmentId, IdempotencyKey, LearnerId, MonthlyHoursSummary,
    Placement, PlacementId, SessionId, SessionStatus,
};
use super::ports::{PlacementStore, StoreError, StoreTransaction};

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    value: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CellKey {
    Placement(PlacementId),
    Enrollment(EnrollmentId),
    Session(SessionId),
    ActiveSlot(LearnerId),
    OpenSlot(LearnerId),
}

#[derive(Default)]
struct State {
    placements: HashMap<PlacementId, Versioned<Placement>>,
    // Versions survive deletion so a stale reader cannot resurrect a row.
    placement_tombstones: HashMap<PlacementId, u64>,
    enrollments: HashMap<EnrollmentId, Versioned<Enrollment>>,
    sessions: HashMap<SessionId, Versioned<AttendanceSession>>,
    active_slots: HashMap<LearnerId, Versioned<Option<EnrollmentId>>>,
    open_slots: HashMap<LearnerId, Versioned<Option<SessionId>>>,
    summaries: HashMap<(LearnerId, i32, u32), MonthlyHoursSummary>,
}

impl State {
    fn version_of(&self, key: &CellKey) -> u64 {
        match key {
            CellKey::Placement(id) => self
                .placements
                .get(id)
                .map(|cell| cell.version)
                .or_else(|| self.placement_tombstones.get(id).copied())
                .unwrap_or(0),
            CellKey::Enrollment(id) => self
                .enrollments
                .get(id)
                .map(|cell| cell.version)
                .unwrap_or(0),
            CellKey::Session(id) => self.sessions.get(id).map(|cell| cell.version).unwrap_or(0),
            CellKey::ActiveSlot(learner_id) => self
                .active_slots
                .get(learner_id)
                .map(|cell| cell.version)
                .unwrap_or(0),
            CellKey::OpenSlot(learner_id) => self
                .open_slots
                .get(learner_id)
                .map(|cell| cell.version)
                .unwrap_or(0),
        }
    }
}

struct Inner {
    state: Mutex<State>,
    forced_conflicts: AtomicU32,
}

/// Reference [`PlacementStore`] keeping everything behind one mutex.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                forced_conflicts: AtomicU32::new(0),
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a conflict. Lets tests drive
    /// the engine's retry loop without staging a real race.
    pub fn force_conflicts(&self, count: u32) {
        self.inner.forced_conflicts.store(count, Ordering::Release);
    }

    pub fn placement_snapshot(&self, id: &PlacementId) -> Option<Placement> {
        let state = self.lock_state();
        state.placements.get(id).map(|cell| cell.value.clone())
    }

    pub fn active_enrollment_snapshot(&self, learner_id: &LearnerId) -> Option<Enrollment> {
        let state = self.lock_state();
        let slot = state.active_slots.get(learner_id)?.value?;
        state.enrollments.get(&slot).map(|cell| cell.value.clone())
    }

    pub fn session_snapshot(&self, id: &SessionId) -> Option<AttendanceSession> {
        let state = self.lock_state();
        state.sessions.get(id).map(|cell| cell.value.clone())
    }

    pub fn open_session_snapshot(&self, learner_id: &LearnerId) -> Option<AttendanceSession> {
        let state = self.lock_state();
        let slot = state.open_slots.get(learner_id)?.value?;
        state.sessions.get(&slot).map(|cell| cell.value.clone())
    }

    pub fn summary_snapshot(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Option<MonthlyHoursSummary> {
        let state = self.lock_state();
        state
            .summaries
            .get(&(learner_id.clone(), year, month))
            .cloned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("store mutex poisoned")
    }
}

#[async_trait]
impl PlacementStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            reads: Vec::new(),
            staged: Staged::default(),
        }))
    }
}

#[derive(Default)]
struct Staged {
    placements: Vec<Placement>,
    removed_placements: Vec<PlacementId>,
    enrollments: Vec<Enrollment>,
    sessions: Vec<AttendanceSession>,
    summaries: Vec<MonthlyHoursSummary>,
}

pub struct MemoryTransaction {
    inner: Arc<Inner>,
    reads: Vec<(CellKey, u64)>,
    staged: Staged,
}

impl MemoryTransaction {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("store mutex poisoned")
    }

    fn consume_forced_conflict(&self) -> bool {
        let mut current = self.inner.forced_conflicts.load(Ordering::Acquire);
        while current > 0 {
            match self.inner.forced_conflicts.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn placement(&mut self, id: &PlacementId) -> Result<Option<Placement>, StoreError> {
        let state = self.lock_state();
        let value = state.placements.get(id).map(|cell| cell.value.clone());
        let version = state.version_of(&CellKey::Placement(id.clone()));
        drop(state);
        self.reads.push((CellKey::Placement(id.clone()), version));
        Ok(value)
    }

    async fn placements(&mut self) -> Result<Vec<Placement>, StoreError> {
        let state = self.lock_state();
        let mut rows: Vec<Placement> = state
            .placements
            .values()
            .map(|cell| cell.value.clone())
            .collect();
        let stamps: Vec<(CellKey, u64)> = rows
            .iter()
            .map(|row| {
                let key = CellKey::Placement(row.id.clone());
                let version = state.version_of(&key);
                (key, version)
            })
            .collect();
        drop(state);
        self.reads.extend(stamps);
        rows.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(rows)
    }

    async fn active_enrollment(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<Enrollment>, StoreError> {
        let state = self.lock_state();
        let slot = state
            .active_slots
            .get(learner_id)
            .and_then(|cell| cell.value);
        let value = slot.and_then(|id| state.enrollments.get(&id).map(|cell| cell.value.clone()));
        let slot_version = state.version_of(&CellKey::ActiveSlot(learner_id.clone()));
        let row_stamp = slot.map(|id| {
            let key = CellKey::Enrollment(id);
            let version = state.version_of(&key);
            (key, version)
        });
        drop(state);
        self.reads
            .push((CellKey::ActiveSlot(learner_id.clone()), slot_version));
        if let Some(stamp) = row_stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn active_enrollments_for_placement(
        &mut self,
        placement_id: &PlacementId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.lock_state();
        let mut rows: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|cell| cell.value.placement_id == *placement_id && cell.value.is_active())
            .map(|cell| cell.value.clone())
            .collect();
        let stamps: Vec<(CellKey, u64)> = rows
            .iter()
            .map(|row| (CellKey::Enrollment(row.id), row_version(&state, row.id)))
            .collect();
        drop(state);
        self.reads.extend(stamps);
        rows.sort_by(|a, b| a.learner_id.0.cmp(&b.learner_id.0));
        Ok(rows)
    }

    async fn enrollment_by_start_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError> {
        let state = self.lock_state();
        let value = state
            .enrollments
            .values()
            .find(|cell| cell.value.started_with == *key)
            .map(|cell| cell.value.clone());
        let stamp = value
            .as_ref()
            .map(|row| (CellKey::Enrollment(row.id), row_version(&state, row.id)));
        drop(state);
        if let Some(stamp) = stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn enrollment_by_end_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError> {
        let state = self.lock_state();
        let value = state
            .enrollments
            .values()
            .find(|cell| cell.value.ended_with.as_ref() == Some(key))
            .map(|cell| cell.value.clone());
        let stamp = value
            .as_ref()
            .map(|row| (CellKey::Enrollment(row.id), row_version(&state, row.id)));
        drop(state);
        if let Some(stamp) = stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn session(&mut self, id: &SessionId) -> Result<Option<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let value = state.sessions.get(id).map(|cell| cell.value.clone());
        let version = state.version_of(&CellKey::Session(*id));
        drop(state);
        self.reads.push((CellKey::Session(*id), version));
        Ok(value)
    }

    async fn open_session(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let slot = state.open_slots.get(learner_id).and_then(|cell| cell.value);
        let value = slot.and_then(|id| state.sessions.get(&id).map(|cell| cell.value.clone()));
        let slot_version = state.version_of(&CellKey::OpenSlot(learner_id.clone()));
        let row_stamp = slot.map(|id| (CellKey::Session(id), state.version_of(&CellKey::Session(id))));
        drop(state);
        self.reads
            .push((CellKey::OpenSlot(learner_id.clone()), slot_version));
        if let Some(stamp) = row_stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn session_by_open_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let value = state
            .sessions
            .values()
            .find(|cell| cell.value.opened_with == *key)
            .map(|cell| cell.value.clone());
        let stamp = value
            .as_ref()
            .map(|row| (CellKey::Session(row.id), state.version_of(&CellKey::Session(row.id))));
        drop(state);
        if let Some(stamp) = stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn session_by_close_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let value = state
            .sessions
            .values()
            .find(|cell| cell.value.closed_with.as_ref() == Some(key))
            .map(|cell| cell.value.clone());
        let stamp = value
            .as_ref()
            .map(|row| (CellKey::Session(row.id), state.version_of(&CellKey::Session(row.id))));
        drop(state);
        if let Some(stamp) = stamp {
            self.reads.push(stamp);
        }
        Ok(value)
    }

    async fn open_sessions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let mut rows: Vec<AttendanceSession> = state
            .sessions
            .values()
            .filter(|cell| cell.value.is_open() && cell.value.opened_at < cutoff)
            .map(|cell| cell.value.clone())
            .collect();
        let stamps: Vec<(CellKey, u64)> = rows
            .iter()
            .map(|row| (CellKey::Session(row.id), state.version_of(&CellKey::Session(row.id))))
            .collect();
        drop(state);
        self.reads.extend(stamps);
        rows.sort_by_key(|row| row.opened_at);
        Ok(rows)
    }

    async fn closed_sessions_in_month(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        let state = self.lock_state();
        let mut rows: Vec<AttendanceSession> = state
            .sessions
            .values()
            .filter(|cell| {
                let session = &cell.value;
                session.learner_id == *learner_id
                    && session.status == SessionStatus::Closed
                    && session.opened_at.year() == year
                    && session.opened_at.month() == month
            })
            .map(|cell| cell.value.clone())
            .collect();
        let stamps: Vec<(CellKey, u64)> = rows
            .iter()
            .map(|row| (CellKey::Session(row.id), state.version_of(&CellKey::Session(row.id))))
            .collect();
        drop(state);
        self.reads.extend(stamps);
        rows.sort_by_key(|row| row.opened_at);
        Ok(rows)
    }

    async fn monthly_summary(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Option<MonthlyHoursSummary>, StoreError> {
        // Summaries are a derived cache; stale reads are tolerated, so no stamp.
        let state = self.lock_state();
        Ok(state
            .summaries
            .get(&(learner_id.clone(), year, month))
            .cloned())
    }

    fn put_placement(&mut self, placement: Placement) {
        self.staged.placements.push(placement);
    }

    fn remove_placement(&mut self, id: &PlacementId) {
        self.staged.removed_placements.push(id.clone());
    }

    fn put_enrollment(&mut self, enrollment: Enrollment) {
        self.staged.enrollments.push(enrollment);
    }

    fn put_session(&mut self, session: AttendanceSession) {
        self.staged.sessions.push(session);
    }

    fn put_summary(&mut self, summary: MonthlyHoursSummary) {
        self.staged.summaries.push(summary);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.consume_forced_conflict() {
            return Err(StoreError::Conflict);
        }

        let mut state = self.inner.state.lock().expect("store mutex poisoned");

        for (key, observed) in &self.reads {
            if state.version_of(key) != *observed {
                return Err(StoreError::Conflict);
            }
        }

        for id in &self.staged.removed_placements {
            if let Some(cell) = state.placements.remove(id) {
                // The removal is itself a new version of the cell.
                state
                    .placement_tombstones
                    .insert(id.clone(), cell.version + 1);
            }
        }
        for placement in self.staged.placements {
            let version = state.version_of(&CellKey::Placement(placement.id.clone())) + 1;
            state.placement_tombstones.remove(&placement.id);
            state
                .placements
                .insert(placement.id.clone(), Versioned { version, value: placement });
        }
        for enrollment in self.staged.enrollments {
            let version = state.version_of(&CellKey::Enrollment(enrollment.id)) + 1;
            let learner_id = enrollment.learner_id.clone();
            let slot = if enrollment.is_active() {
                Some(Some(enrollment.id))
            } else if slot_points_at(&state.active_slots, &learner_id, enrollment.id) {
                Some(None)
            } else {
                None
            };
            state
                .enrollments
                .insert(enrollment.id, Versioned { version, value: enrollment });
            if let Some(value) = slot {
                bump_slot(&mut state.active_slots, learner_id, value);
            }
        }
        for session in self.staged.sessions {
            let version = state.version_of(&CellKey::Session(session.id)) + 1;
            let learner_id = session.learner_id.clone();
            let slot = if session.is_open() {
                Some(Some(session.id))
            } else if slot_points_at(&state.open_slots, &learner_id, session.id) {
                Some(None)
            } else {
                None
            };
            state
                .sessions
                .insert(session.id, Versioned { version, value: session });
            if let Some(value) = slot {
                bump_slot(&mut state.open_slots, learner_id, value);
            }
        }
        for summary in self.staged.summaries {
            state.summaries.insert(
                (summary.learner_id.clone(), summary.year, summary.month),
                summary,
            );
        }

        Ok(())
    }
}

fn row_version(state: &State, id: EnrollmentId) -> u64 {
    state.version_of(&CellKey::Enrollment(id))
}

fn slot_points_at<K, I>(slots: &HashMap<K, Versioned<Option<I>>>, key: &K, id: I) -> bool
where
    K: std::hash::Hash + Eq,
    I: PartialEq,
{
    slots
        .get(key)
        .map(|cell| cell.value.as_ref() == Some(&id))
        .unwrap_or(false)
}

fn bump_slot<K, I>(slots: &mut HashMap<K, Versioned<Option<I>>>, key: K, value: Option<I>)
where
    K: std::hash::Hash + Eq,
{
    let version = slots.get(&key).map(|cell| cell.version).unwrap_or(0) + 1;
    slots.insert(key, Versioned { version, value });
}
