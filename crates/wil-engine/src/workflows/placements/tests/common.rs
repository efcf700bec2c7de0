//! Shared fixtures and scripted port doubles for the placement engine tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::workflows::placements::domain::{
    AdminPlacementStatus, AttendanceSession, Enrollment, EnrollmentId, IdempotencyKey, LearnerId,
    MonthlyHoursSummary, Placement, PlacementId, ProgramId, SessionId, SessionStatus,
    VerificationFactors,
};
use crate::workflows::placements::engine::{EngineSettings, PlacementEngine};
use crate::workflows::placements::events::{DomainEvent, EmitError, EventSink};
use crate::workflows::placements::memory::MemoryStore;
use crate::workflows::placements::ports::{
    PlacementStore, StoreError, StoreTransaction, Verdict, VerificationError, VerificationGateway,
};
use crate::workflows::placements::retry::RetryPolicy;

pub(super) struct AcceptAllVerifier;

#[async_trait]
impl VerificationGateway for AcceptAllVerifier {
    async fn verify(
        &self,
        learner_id: &LearnerId,
        placement_id: &PlacementId,
        _factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError> {
        Ok(Verdict::Accepted {
            evidence_ref: format!("evidence:{learner_id}@{placement_id}"),
        })
    }
}

pub(super) struct RejectingVerifier {
    pub(super) reason: &'static str,
}

#[async_trait]
impl VerificationGateway for RejectingVerifier {
    async fn verify(
        &self,
        _learner_id: &LearnerId,
        _placement_id: &PlacementId,
        _factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError> {
        Ok(Verdict::Rejected {
            reason: self.reason.to_string(),
        })
    }
}

pub(super) struct SlowVerifier {
    pub(super) delay: Duration,
}

#[async_trait]
impl VerificationGateway for SlowVerifier {
    async fn verify(
        &self,
        _learner_id: &LearnerId,
        _placement_id: &PlacementId,
        _factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError> {
        tokio::time::sleep(self.delay).await;
        Ok(Verdict::Accepted {
            evidence_ref: "evidence:late".to_string(),
        })
    }
}

pub(super) struct UnavailableVerifier;

#[async_trait]
impl VerificationGateway for UnavailableVerifier {
    async fn verify(
        &self,
        _learner_id: &LearnerId,
        _placement_id: &PlacementId,
        _factors: &VerificationFactors,
    ) -> Result<Verdict, VerificationError> {
        Err(VerificationError::Unavailable(
            "verification backend offline".to_string(),
        ))
    }
}

#[derive(Default)]
pub(super) struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub(super) fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: DomainEvent) -> Result<(), EmitError> {
        self.events.lock().expect("event log poisoned").push(event);
        Ok(())
    }
}

pub(super) struct FailingSink;

impl EventSink for FailingSink {
    fn emit(&self, _event: DomainEvent) -> Result<(), EmitError> {
        Err(EmitError::Transport("event bus offline".to_string()))
    }
}

pub(super) struct UnavailableStore;

#[async_trait]
impl PlacementStore for UnavailableStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Err(StoreError::Unavailable("store offline".to_string()))
    }
}

/// Wraps a [`MemoryStore`] and fails any commit that staged a monthly
/// summary. Lets tests observe a close surviving a broken recompute.
pub(super) struct SummaryWriteBlockedStore {
    inner: MemoryStore,
}

impl SummaryWriteBlockedStore {
    pub(super) fn new(inner: MemoryStore) -> Self {
        Self { inner }
    }
}

struct SummaryBlockedTxn {
    inner: Box<dyn StoreTransaction>,
    staged_summary: bool,
}

#[async_trait]
impl PlacementStore for SummaryWriteBlockedStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(SummaryBlockedTxn {
            inner: self.inner.begin().await?,
            staged_summary: false,
        }))
    }
}

#[async_trait]
impl StoreTransaction for SummaryBlockedTxn {
    async fn placement(&mut self, id: &PlacementId) -> Result<Option<Placement>, StoreError> {
        self.inner.placement(id).await
    }

    async fn placements(&mut self) -> Result<Vec<Placement>, StoreError> {
        self.inner.placements().await
    }

    async fn active_enrollment(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<Enrollment>, StoreError> {
        self.inner.active_enrollment(learner_id).await
    }

    async fn active_enrollments_for_placement(
        &mut self,
        placement_id: &PlacementId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        self.inner
            .active_enrollments_for_placement(placement_id)
            .await
    }

    async fn enrollment_by_start_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError> {
        self.inner.enrollment_by_start_key(key).await
    }

    async fn enrollment_by_end_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Enrollment>, StoreError> {
        self.inner.enrollment_by_end_key(key).await
    }

    async fn session(&mut self, id: &SessionId) -> Result<Option<AttendanceSession>, StoreError> {
        self.inner.session(id).await
    }

    async fn open_session(
        &mut self,
        learner_id: &LearnerId,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        self.inner.open_session(learner_id).await
    }

    async fn session_by_open_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        self.inner.session_by_open_key(key).await
    }

    async fn session_by_close_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        self.inner.session_by_close_key(key).await
    }

    async fn open_sessions_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        self.inner.open_sessions_before(cutoff).await
    }

    async fn closed_sessions_in_month(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        self.inner
            .closed_sessions_in_month(learner_id, year, month)
            .await
    }

    async fn monthly_summary(
        &mut self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<Option<MonthlyHoursSummary>, StoreError> {
        self.inner.monthly_summary(learner_id, year, month).await
    }

    fn put_placement(&mut self, placement: Placement) {
        self.inner.put_placement(placement);
    }

    fn remove_placement(&mut self, id: &PlacementId) {
        self.inner.remove_placement(id);
    }

    fn put_enrollment(&mut self, enrollment: Enrollment) {
        self.inner.put_enrollment(enrollment);
    }

    fn put_session(&mut self, session: AttendanceSession) {
        self.inner.put_session(session);
    }

    fn put_summary(&mut self, summary: MonthlyHoursSummary) {
        self.staged_summary = true;
        self.inner.put_summary(summary);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if this.staged_summary {
            return Err(StoreError::Unavailable(
                "summary partition offline".to_string(),
            ));
        }
        this.inner.commit().await
    }
}

/// Engine settings with near-instant retry delays so conflict tests
/// finish quickly.
pub(super) fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2)),
        ..EngineSettings::default()
    }
}

pub(super) type TestEngine = PlacementEngine<MemoryStore, AcceptAllVerifier, RecordingSink>;

pub(super) fn engine() -> (Arc<TestEngine>, MemoryStore, Arc<RecordingSink>) {
    engine_over(MemoryStore::new())
}

pub(super) fn engine_over(store: MemoryStore) -> (Arc<TestEngine>, MemoryStore, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let engine = PlacementEngine::new(
        Arc::new(store.clone()),
        Arc::new(AcceptAllVerifier),
        Arc::clone(&sink),
        fast_settings(),
    );
    (Arc::new(engine), store, sink)
}

pub(super) fn engine_with_verifier<V>(
    verifier: V,
    settings: EngineSettings,
) -> (
    Arc<PlacementEngine<MemoryStore, V, RecordingSink>>,
    MemoryStore,
    Arc<RecordingSink>,
)
where
    V: VerificationGateway,
{
    let store = MemoryStore::new();
    let sink = Arc::new(RecordingSink::new());
    let engine = PlacementEngine::new(
        Arc::new(store.clone()),
        Arc::new(verifier),
        Arc::clone(&sink),
        settings,
    );
    (Arc::new(engine), store, sink)
}

pub(super) async fn read_json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 4096)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) fn lid(raw: &str) -> LearnerId {
    LearnerId(raw.to_string())
}

pub(super) fn pid(raw: &str) -> PlacementId {
    PlacementId(raw.to_string())
}

pub(super) fn prog(raw: &str) -> ProgramId {
    ProgramId(raw.to_string())
}

pub(super) fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey(raw.to_string())
}

pub(super) fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn pin_factors() -> VerificationFactors {
    VerificationFactors {
        device_pin_hash: Some("hash-1234".to_string()),
        qr_payload: None,
        geolocation: None,
        selfie_ref: None,
    }
}

pub(super) async fn seed_placement<S, V, E>(
    engine: &PlacementEngine<S, V, E>,
    placement: &str,
    program: &str,
    capacity: u32,
) -> Placement
where
    S: PlacementStore,
    V: VerificationGateway,
    E: EventSink,
{
    engine
        .create_placement(pid(placement), prog(program), capacity, AdminPlacementStatus::Active)
        .await
        .expect("placement seeded")
}

pub(super) async fn enroll_learner<S, V, E>(
    engine: &PlacementEngine<S, V, E>,
    learner: &str,
    placement: &str,
    program: &str,
    idem: &str,
    now: DateTime<Utc>,
) -> Enrollment
where
    S: PlacementStore,
    V: VerificationGateway,
    E: EventSink,
{
    let request = crate::workflows::placements::domain::EnrollRequest {
        learner_id: lid(learner),
        placement_id: pid(placement),
        learner_program: prog(program),
        idempotency_key: key(idem),
    };
    engine.enroll(&request, now).await.expect("enrollment accepted")
}

/// Stages a closed session directly in the store, bypassing the engine.
/// Used by the hours tests to build month histories without walking
/// through check-in/check-out for every block.
pub(super) async fn seed_closed_session(
    store: &MemoryStore,
    learner: &str,
    placement: &str,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
) -> AttendanceSession {
    seed_session(store, learner, placement, opened_at, Some(closed_at), SessionStatus::Closed).await
}

pub(super) async fn seed_open_session(
    store: &MemoryStore,
    learner: &str,
    placement: &str,
    opened_at: DateTime<Utc>,
) -> AttendanceSession {
    seed_session(store, learner, placement, opened_at, None, SessionStatus::Open).await
}

pub(super) async fn seed_flagged_session(
    store: &MemoryStore,
    learner: &str,
    placement: &str,
    opened_at: DateTime<Utc>,
) -> AttendanceSession {
    seed_session(store, learner, placement, opened_at, None, SessionStatus::Flagged).await
}

async fn seed_session(
    store: &MemoryStore,
    learner: &str,
    placement: &str,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    status: SessionStatus,
) -> AttendanceSession {
    let session = AttendanceSession {
        id: SessionId(Uuid::new_v4()),
        learner_id: lid(learner),
        placement_id: pid(placement),
        opened_at,
        closed_at,
        status,
        evidence_ref: "evidence:seeded".to_string(),
        notes: None,
        opened_with: key(&format!("seed-open-{}", Uuid::new_v4())),
        closed_with: closed_at.map(|_| key(&format!("seed-close-{}", Uuid::new_v4()))),
    };
    let mut txn = store.begin().await.expect("transaction");
    txn.put_session(session.clone());
    txn.commit().await.expect("seeded session committed");
    session
}

/// Stages an active enrollment without consuming a seat, for tests that
/// only care about the session side.
pub(super) async fn seed_enrollment(
    store: &MemoryStore,
    learner: &str,
    placement: &str,
    program: &str,
    started_at: DateTime<Utc>,
) -> Enrollment {
    let enrollment = Enrollment {
        id: EnrollmentId(Uuid::new_v4()),
        learner_id: lid(learner),
        placement_id: pid(placement),
        program_id: prog(program),
        started_at,
        ended_at: None,
        started_with: key(&format!("seed-enroll-{}", Uuid::new_v4())),
        ended_with: None,
    };
    let mut txn = store.begin().await.expect("transaction");
    txn.put_enrollment(enrollment.clone());
    txn.commit().await.expect("seeded enrollment committed");
    enrollment
}
