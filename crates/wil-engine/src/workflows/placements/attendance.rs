//! Attendance session tracking: verified check-in, check-out, the staleness
//! sweep, and the per-learner status view. Sessions follow Open -> Closed or
//! Open -> Flagged; `Flagged` is terminal and earns no minutes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::domain::{
    AttendanceSession, CheckInRequest, CheckOutRequest, ErrorKind, LearnerId, LearnerStatusView,
    PlacementId, SessionId, SessionStatus, ViewError,
};
use super::events::{emit_or_log, DomainEvent, EventSink};
use super::hours::HoursAggregator;
use super::ports::{PlacementStore, StoreError, Verdict, VerificationError, VerificationGateway};
use super::retry::{with_deadline, RetryPolicy};

/// Drives the attendance session state machine for all learners.
pub struct AttendanceTracker<S, V, E> {
    store: Arc<S>,
    verifier: Arc<V>,
    events: Arc<E>,
    hours: Arc<HoursAggregator<S, E>>,
    retry: RetryPolicy,
    stale_session_after: chrono::Duration,
    txn_timeout: Duration,
    verify_timeout: Duration,
}

enum SessionOutcome {
    Created(AttendanceSession),
    Replayed(AttendanceSession),
}

/// Result of one staleness sweep pass.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub flagged: Vec<AttendanceSession>,
}

impl<S, V, E> AttendanceTracker<S, V, E>
where
    S: PlacementStore,
    V: VerificationGateway,
    E: EventSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        verifier: Arc<V>,
        events: Arc<E>,
        hours: Arc<HoursAggregator<S, E>>,
        retry: RetryPolicy,
        stale_session_after: chrono::Duration,
        txn_timeout: Duration,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            store,
            verifier,
            events,
            hours,
            retry,
            stale_session_after,
            txn_timeout,
            verify_timeout,
        }
    }

    /// Opens an attendance session once the proof factors pass verification.
    /// Resubmitting the same idempotency key returns the recorded session.
    pub async fn check_in(
        &self,
        request: &CheckInRequest,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSession, CheckInError> {
        let verify = self.verifier.verify(
            &request.learner_id,
            &request.placement_id,
            &request.factors,
        );
        let verdict = match tokio::time::timeout(self.verify_timeout, verify).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(VerificationError::Timeout(limit))) => {
                return Err(CheckInError::VerificationTimeout(limit));
            }
            Ok(Err(VerificationError::Unavailable(detail))) => {
                return Err(CheckInError::VerifierUnavailable(detail));
            }
            Err(_) => return Err(CheckInError::VerificationTimeout(self.verify_timeout)),
        };
        let evidence_ref = match verdict {
            Verdict::Accepted { evidence_ref } => evidence_ref,
            Verdict::Rejected { reason } => {
                debug!(
                    learner = %request.learner_id,
                    placement = %request.placement_id,
                    reason,
                    "check-in verification rejected"
                );
                return Err(CheckInError::VerificationFailed { reason });
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.txn_timeout,
                self.open_once(request, &evidence_ref, now),
                || CheckInError::StoreUnavailable(timed_out(self.txn_timeout)),
            )
            .await;

            match result {
                Err(CheckInError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempt,
                        ?delay,
                        "check-in lost a commit race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(CheckInError::Conflict) => {
                    warn!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempts = attempt,
                        "check-in retry budget exhausted"
                    );
                    return Err(CheckInError::Conflict);
                }
                Err(other) => return Err(other),
                Ok(SessionOutcome::Created(session)) => {
                    emit_or_log(
                        self.events.as_ref(),
                        DomainEvent::SessionOpened {
                            session_id: session.id,
                            learner_id: session.learner_id.clone(),
                            placement_id: session.placement_id.clone(),
                            at: session.opened_at,
                        },
                    );
                    return Ok(session);
                }
                Ok(SessionOutcome::Replayed(session)) => return Ok(session),
            }
        }
    }

    async fn open_once(
        &self,
        request: &CheckInRequest,
        evidence_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome, CheckInError> {
        let mut txn = self.store.begin().await?;

        if let Some(existing) = txn.session_by_open_key(&request.idempotency_key).await? {
            // Replays hand back the recorded session in whatever state it
            // has reached since, including closed or flagged.
            if existing.learner_id == request.learner_id {
                return Ok(SessionOutcome::Replayed(existing));
            }
        }

        match txn.active_enrollment(&request.learner_id).await? {
            Some(enrollment) if enrollment.placement_id == request.placement_id => {}
            Some(enrollment) => {
                return Err(CheckInError::NotAssignedHere {
                    learner_id: request.learner_id.clone(),
                    placement_id: request.placement_id.clone(),
                    detail: format!("learner is assigned to {}", enrollment.placement_id),
                });
            }
            None => {
                return Err(CheckInError::NotAssignedHere {
                    learner_id: request.learner_id.clone(),
                    placement_id: request.placement_id.clone(),
                    detail: "learner holds no active enrollment".to_string(),
                });
            }
        }

        if let Some(open) = txn.open_session(&request.learner_id).await? {
            return Err(CheckInError::AlreadyCheckedIn {
                learner_id: request.learner_id.clone(),
                session_id: open.id,
            });
        }

        let session = AttendanceSession {
            id: SessionId(Uuid::new_v4()),
            learner_id: request.learner_id.clone(),
            placement_id: request.placement_id.clone(),
            opened_at: now,
            closed_at: None,
            status: SessionStatus::Open,
            evidence_ref: evidence_ref.to_string(),
            notes: None,
            opened_with: request.idempotency_key.clone(),
            closed_with: None,
        };

        txn.put_session(session.clone());
        txn.commit().await?;

        Ok(SessionOutcome::Created(session))
    }

    /// Closes the learner's open session and triggers the monthly recompute.
    /// The close stands even when the follow-up recompute fails; the summary
    /// is a cache and heals on the next recompute.
    pub async fn check_out(
        &self,
        request: &CheckOutRequest,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSession, CheckOutError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(self.txn_timeout, self.close_once(request, now), || {
                CheckOutError::StoreUnavailable(timed_out(self.txn_timeout))
            })
            .await;

            match result {
                Err(CheckOutError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        learner = %request.learner_id,
                        session = %request.session_id,
                        attempt,
                        ?delay,
                        "check-out lost a commit race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(CheckOutError::Conflict) => {
                    warn!(
                        learner = %request.learner_id,
                        session = %request.session_id,
                        attempts = attempt,
                        "check-out retry budget exhausted"
                    );
                    return Err(CheckOutError::Conflict);
                }
                Err(other) => return Err(other),
                Ok(SessionOutcome::Created(session)) => {
                    let minutes = session
                        .worked_seconds()
                        .map(|seconds| (seconds / 60) as u64)
                        .unwrap_or(0);
                    emit_or_log(
                        self.events.as_ref(),
                        DomainEvent::SessionClosed {
                            session_id: session.id,
                            learner_id: session.learner_id.clone(),
                            placement_id: session.placement_id.clone(),
                            minutes,
                            at: now,
                        },
                    );

                    let year = session.opened_at.year();
                    let month = session.opened_at.month();
                    if let Err(error) =
                        self.hours.recompute(&session.learner_id, year, month).await
                    {
                        warn!(
                            learner = %session.learner_id,
                            year,
                            month,
                            %error,
                            "monthly summary recompute failed after close"
                        );
                    }
                    return Ok(session);
                }
                Ok(SessionOutcome::Replayed(session)) => return Ok(session),
            }
        }
    }

    async fn close_once(
        &self,
        request: &CheckOutRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome, CheckOutError> {
        let mut txn = self.store.begin().await?;

        if let Some(existing) = txn.session_by_close_key(&request.idempotency_key).await? {
            if existing.learner_id == request.learner_id {
                return Ok(SessionOutcome::Replayed(existing));
            }
        }

        let mut session = match txn.session(&request.session_id).await? {
            Some(session) if session.learner_id == request.learner_id => session,
            Some(_) => {
                return Err(CheckOutError::NoOpenSession {
                    learner_id: request.learner_id.clone(),
                    detail: format!("session {} belongs to another learner", request.session_id),
                });
            }
            None => {
                return Err(CheckOutError::NoOpenSession {
                    learner_id: request.learner_id.clone(),
                    detail: format!("session {} does not exist", request.session_id),
                });
            }
        };
        if !session.is_open() {
            return Err(CheckOutError::NoOpenSession {
                learner_id: request.learner_id.clone(),
                detail: format!(
                    "session {} is already {}",
                    session.id,
                    session.status.label()
                ),
            });
        }

        // Device clock skew must not produce a close before the open.
        session.closed_at = Some(now.max(session.opened_at));
        session.status = SessionStatus::Closed;
        session.closed_with = Some(request.idempotency_key.clone());
        if request.notes.is_some() {
            session.notes = request.notes.clone();
        }

        txn.put_session(session.clone());
        txn.commit().await?;

        Ok(SessionOutcome::Created(session))
    }

    /// Flags every session left open past the staleness threshold. Flagged
    /// sessions stop blocking their learner's next check-in and never count
    /// toward hours.
    pub async fn sweep_stale_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, SweepError> {
        let cutoff = now - self.stale_session_after;

        let mut attempt = 0;
        let flagged = loop {
            attempt += 1;
            let result = with_deadline(self.txn_timeout, self.sweep_once(cutoff), || {
                SweepError::StoreUnavailable(timed_out(self.txn_timeout))
            })
            .await;

            match result {
                Err(SweepError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(attempt, ?delay, "sweep lost a commit race, replaying");
                    tokio::time::sleep(delay).await;
                }
                Err(SweepError::Conflict) => {
                    warn!(attempts = attempt, "sweep retry budget exhausted");
                    return Err(SweepError::Conflict);
                }
                Err(other) => return Err(other),
                Ok(flagged) => break flagged,
            }
        };

        for session in &flagged {
            emit_or_log(
                self.events.as_ref(),
                DomainEvent::SessionFlagged {
                    session_id: session.id,
                    learner_id: session.learner_id.clone(),
                    opened_at: session.opened_at,
                    at: now,
                },
            );
        }
        if !flagged.is_empty() {
            info!(
                flagged = flagged.len(),
                cutoff = %cutoff,
                "stale attendance sessions flagged"
            );
        }

        Ok(SweepReport { cutoff, flagged })
    }

    async fn sweep_once(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AttendanceSession>, SweepError> {
        let mut txn = self.store.begin().await?;

        let stale = txn.open_sessions_before(cutoff).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut flagged = Vec::with_capacity(stale.len());
        for mut session in stale {
            session.status = SessionStatus::Flagged;
            txn.put_session(session.clone());
            flagged.push(session);
        }
        txn.commit().await?;

        Ok(flagged)
    }

    /// Read-only per-learner snapshot: active enrollment, open session, and
    /// the stored summary for the month `now` falls in.
    pub async fn learner_status(
        &self,
        learner_id: &LearnerId,
        now: DateTime<Utc>,
    ) -> Result<LearnerStatusView, ViewError> {
        let mut txn = self
            .store
            .begin()
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;

        let enrollment = txn
            .active_enrollment(learner_id)
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;
        let open_session = txn
            .open_session(learner_id)
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;
        let latest_summary = txn
            .monthly_summary(learner_id, now.year(), now.month())
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;

        Ok(LearnerStatusView {
            learner_id: learner_id.clone(),
            placement_id: enrollment.as_ref().map(|e| e.placement_id.clone()),
            program_id: enrollment.as_ref().map(|e| e.program_id.clone()),
            enrolled_since: enrollment.as_ref().map(|e| e.started_at),
            open_session_id: open_session.as_ref().map(|s| s.id),
            checked_in_at: open_session.as_ref().map(|s| s.opened_at),
            latest_summary,
        })
    }
}

fn timed_out(limit: Duration) -> String {
    format!("transaction exceeded the {limit:?} deadline")
}

/// Failures while opening an attendance session.
#[derive(Debug, thiserror::Error)]
pub enum CheckInError {
    #[error("verification rejected the check-in: {reason}")]
    VerificationFailed { reason: String },
    #[error("verification timed out after {0:?}")]
    VerificationTimeout(Duration),
    #[error("verification backend unavailable: {0}")]
    VerifierUnavailable(String),
    #[error("learner {learner_id} cannot check in at {placement_id}: {detail}")]
    NotAssignedHere {
        learner_id: LearnerId,
        placement_id: PlacementId,
        detail: String,
    },
    #[error("learner {learner_id} already has open session {session_id}")]
    AlreadyCheckedIn {
        learner_id: LearnerId,
        session_id: SessionId,
    },
    #[error("check-in kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CheckInError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            CheckInError::VerificationFailed { .. }
            | CheckInError::NotAssignedHere { .. }
            | CheckInError::AlreadyCheckedIn { .. } => ErrorKind::Validation,
            CheckInError::Conflict => ErrorKind::Contention,
            CheckInError::VerificationTimeout(_)
            | CheckInError::VerifierUnavailable(_)
            | CheckInError::StoreUnavailable(_) => ErrorKind::Dependency,
        }
    }
}

impl From<StoreError> for CheckInError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}

/// Failures while closing an attendance session.
#[derive(Debug, thiserror::Error)]
pub enum CheckOutError {
    #[error("learner {learner_id} has no matching open session: {detail}")]
    NoOpenSession {
        learner_id: LearnerId,
        detail: String,
    },
    #[error("check-out kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CheckOutError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            CheckOutError::NoOpenSession { .. } => ErrorKind::Validation,
            CheckOutError::Conflict => ErrorKind::Contention,
            CheckOutError::StoreUnavailable(_) => ErrorKind::Dependency,
        }
    }
}

impl From<StoreError> for CheckOutError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}

/// Failures during the staleness sweep.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("sweep kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SweepError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            SweepError::Conflict => ErrorKind::Contention,
            SweepError::StoreUnavailable(_) => ErrorKind::Dependency,
        }
    }
}

impl From<StoreError> for SweepError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}
