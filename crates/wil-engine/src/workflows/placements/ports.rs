//! Outbound ports the engine is generic over: transactional storage and
//! check-in verification. Adapters live with the embedding service; the
//! in-memory reference adapter is in [`super::memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::domain::{
    AttendanceSession, Enrollment, IdempotencyKey, LearnerId, MonthlyHoursSummary, Placement,
    PlacementId, SessionId, VerificationFactors,
};

/// Storage abstraction. Every engine operation runs against a single
/// transaction obtained from `begin`; reads outside a transaction are not
/// part of the contract.
#[async_trait]
pub trait PlacementStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One atomic unit of work. Reads observe a consistent snapshot; staged
/// writes become visible only when `commit` succeeds. A concurrent commit
/// that invalidates an observed read fails this one with
/// [`StoreError::Conflict`], and dropping the transaction without committing
/// discards all staged writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn placement(&mut self, id: &PlacementId) -> Result<Option<Placement>, StoreError>;
    async fn placements(&mut self) -> Result<Vec<Placement>, StoreError>;

    /// The learner's single active enrollment, if any.
    async fn active_enrollment(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<Enrollment>, StoreError>;
    async fn active_enrollments_for_placement(
        &mut self,
        placement_id: &PlacementId,
    ) -> Result<Vec<Enrollment>, StoreError>;
    async fn enrollment_by_start_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError>;
    async fn enrollment_by_end_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError>;

    async fn session(&mut self, id: &SessionId) -> Result<Option<AttendanceSession>, StoreError>;
    /// The learner's single open session, if any.
    async fn open_session(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<AttendanceSession>, StoreError>;
    async fn session_by_open_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError>;
    async fn session_by_close_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError>;
    /// Open sessions whose `opened_at` predates the cutoff, across learners.
    async fn open_sessions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AttendanceSession>, StoreError>;
    async fn closed_sessions_in_month(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Vec<AttendanceSession>, StoreError>;

    async fn monthly_summary(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Option<MonthlyHoursSummary>, StoreError>;

    fn put_placement(&mut self, placement: Placement);
    fn remove_placement(&mut self, id: &PlacementId);
    fn put_enrollment(&mut self, enrollment: Enrollment);
    fn put_session(&mut self, session: AttendanceSession);
    fn put_summary(&mut self, summary: MonthlyHoursSummary);

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Error enumeration for storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("concurrent write invalidated this transaction")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Gateway judging a check-in attempt from its proof factors. Which factors
/// are required, and how they are checked, is deployment policy behind this
/// trait.
#[async_trait]
pub trait VerificationGateway: Send + Sync {
    async fn verify(
        &self,
        learner_id: &LearnerId,
        placement_id: &PlacementId,
        factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError>;
}

/// Outcome of a verification round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Factors check out; `evidence_ref` points at the stored proof bundle.
    Accepted { evidence_ref: String },
    /// Factors were judged and rejected for the given reason.
    Rejected { reason: String },
}

/// Failure to obtain a verdict at all, as opposed to a rejection.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("verification backend unavailable: {0}")]
    Unavailable(String),
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
}
