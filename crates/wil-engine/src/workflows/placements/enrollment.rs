//! Enrollment coordination: seat accounting under optimistic concurrency,
//! plus the administrative placement operations. Every mutation is one
//! transaction; a lost commit race is replayed with jittered backoff until
//! the retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::domain::{
    AdminPlacementStatus, EnrollRequest, Enrollment, EnrollmentId, ErrorKind, InvariantViolation,
    LearnerId, Placement, PlacementId, PlacementStatus, PlacementView, ProgramId, UnenrollRequest,
    ViewError,
};
use super::events::{emit_or_log, DomainEvent, EventSink};
use super::ports::{PlacementStore, StoreError};
use super::retry::{with_deadline, RetryPolicy};

/// Owns the learner-placement binding and the placement seat counters.
pub struct EnrollmentCoordinator<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    retry: RetryPolicy,
    txn_timeout: Duration,
}

enum EnrollOutcome {
    Created(Enrollment),
    Replayed(Enrollment),
}

enum UnenrollOutcome {
    Ended(Enrollment),
    Replayed(Enrollment),
}

impl<S, E> EnrollmentCoordinator<S, E>
where
    S: PlacementStore,
    E: EventSink,
{
    pub fn new(store: Arc<S>, events: Arc<E>, retry: RetryPolicy, txn_timeout: Duration) -> Self {
        Self {
            store,
            events,
            retry,
            txn_timeout,
        }
    }

    /// Binds a learner to a placement, consuming one seat. Resubmitting the
    /// same idempotency key returns the recorded enrollment unchanged.
    pub async fn enroll(
        &self,
        request: &EnrollRequest,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(self.txn_timeout, self.enroll_once(request, now), || {
                EnrollError::StoreUnavailable(timed_out(self.txn_timeout))
            })
            .await;

            match result {
                Err(EnrollError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempt,
                        ?delay,
                        "enroll lost a commit race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(EnrollError::Conflict) => {
                    warn!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempts = attempt,
                        "enroll retry budget exhausted"
                    );
                    return Err(EnrollError::Conflict);
                }
                Err(other) => {
                    if other.kind() == ErrorKind::Invariant {
                        error!(
                            learner = %request.learner_id,
                            placement = %request.placement_id,
                            %other,
                            "enrollment invariant violated"
                        );
                    }
                    return Err(other);
                }
                Ok(EnrollOutcome::Created(enrollment)) => {
                    emit_or_log(
                        self.events.as_ref(),
                        DomainEvent::Enrolled {
                            enrollment_id: enrollment.id,
                            learner_id: enrollment.learner_id.clone(),
                            placement_id: enrollment.placement_id.clone(),
                            at: enrollment.started_at,
                        },
                    );
                    return Ok(enrollment);
                }
                Ok(EnrollOutcome::Replayed(enrollment)) => return Ok(enrollment),
            }
        }
    }

    async fn enroll_once(
        &self,
        request: &EnrollRequest,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, EnrollError> {
        let mut txn = self.store.begin().await?;

        if let Some(existing) = txn.enrollment_by_start_key(&request.idempotency_key).await? {
            // Key scope across learners is the caller's concern; a hit for a
            // different learner does not replay.
            if existing.learner_id == request.learner_id {
                return Ok(EnrollOutcome::Replayed(existing));
            }
        }

        let mut placement = txn
            .placement(&request.placement_id)
            .await?
            .ok_or_else(|| EnrollError::PlacementUnavailable {
                placement_id: request.placement_id.clone(),
                detail: "placement does not exist".to_string(),
            })?;

        match placement.status {
            PlacementStatus::Inactive | PlacementStatus::Suspended => {
                return Err(EnrollError::PlacementUnavailable {
                    placement_id: placement.id,
                    detail: format!("placement is {}", placement.status.label()),
                });
            }
            PlacementStatus::Active | PlacementStatus::Full => {}
        }

        if let Some(active) = txn.active_enrollment(&request.learner_id).await? {
            return Err(EnrollError::AlreadyEnrolled {
                learner_id: request.learner_id.clone(),
                placement_id: active.placement_id,
            });
        }

        if request.learner_program != placement.program_id {
            return Err(EnrollError::ProgramMismatch {
                learner_program: request.learner_program.clone(),
                placement_program: placement.program_id,
            });
        }

        if placement.seats_remaining() == 0 {
            return Err(EnrollError::CapacityExceeded {
                placement_id: placement.id,
                capacity: placement.capacity,
            });
        }

        placement.record_assignment()?;

        let enrollment = Enrollment {
            id: EnrollmentId(Uuid::new_v4()),
            learner_id: request.learner_id.clone(),
            placement_id: request.placement_id.clone(),
            program_id: placement.program_id.clone(),
            started_at: now,
            ended_at: None,
            started_with: request.idempotency_key.clone(),
            ended_with: None,
        };

        txn.put_placement(placement);
        txn.put_enrollment(enrollment.clone());
        txn.commit().await?;

        Ok(EnrollOutcome::Created(enrollment))
    }

    /// Ends the learner's active enrollment at the given placement and frees
    /// its seat. Replaying the same key returns the already-ended record.
    pub async fn unenroll(
        &self,
        request: &UnenrollRequest,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, UnenrollError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(self.txn_timeout, self.unenroll_once(request, now), || {
                UnenrollError::StoreUnavailable(timed_out(self.txn_timeout))
            })
            .await;

            match result {
                Err(UnenrollError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempt,
                        ?delay,
                        "unenroll lost a commit race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(UnenrollError::Conflict) => {
                    warn!(
                        learner = %request.learner_id,
                        placement = %request.placement_id,
                        attempts = attempt,
                        "unenroll retry budget exhausted"
                    );
                    return Err(UnenrollError::Conflict);
                }
                Err(other) => {
                    if other.kind() == ErrorKind::Invariant {
                        error!(
                            learner = %request.learner_id,
                            placement = %request.placement_id,
                            %other,
                            "unenroll invariant violated"
                        );
                    }
                    return Err(other);
                }
                Ok(UnenrollOutcome::Ended(enrollment)) => {
                    emit_or_log(
                        self.events.as_ref(),
                        DomainEvent::Unenrolled {
                            learner_id: enrollment.learner_id.clone(),
                            placement_id: enrollment.placement_id.clone(),
                            at: now,
                        },
                    );
                    return Ok(enrollment);
                }
                Ok(UnenrollOutcome::Replayed(enrollment)) => return Ok(enrollment),
            }
        }
    }

    async fn unenroll_once(
        &self,
        request: &UnenrollRequest,
        now: DateTime<Utc>,
    ) -> Result<UnenrollOutcome, UnenrollError> {
        let mut txn = self.store.begin().await?;

        if let Some(existing) = txn.enrollment_by_end_key(&request.idempotency_key).await? {
            if existing.learner_id == request.learner_id {
                return Ok(UnenrollOutcome::Replayed(existing));
            }
        }

        let mut enrollment = match txn.active_enrollment(&request.learner_id).await? {
            Some(active) if active.placement_id == request.placement_id => active,
            _ => {
                return Err(UnenrollError::NotEnrolled {
                    learner_id: request.learner_id.clone(),
                    placement_id: request.placement_id.clone(),
                });
            }
        };

        // The placement row must exist while an enrollment references it.
        let mut placement = txn.placement(&request.placement_id).await?.ok_or_else(|| {
            InvariantViolation::new(format!(
                "enrollment {} references missing placement {}",
                enrollment.id, request.placement_id
            ))
        })?;
        placement.record_release()?;

        enrollment.ended_at = Some(now);
        enrollment.ended_with = Some(request.idempotency_key.clone());

        txn.put_placement(placement);
        txn.put_enrollment(enrollment.clone());
        txn.commit().await?;

        Ok(UnenrollOutcome::Ended(enrollment))
    }

    /// Registers a new placement. Capacity must hold at least one seat.
    pub async fn create_placement(
        &self,
        placement_id: PlacementId,
        program_id: ProgramId,
        capacity: u32,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        if capacity == 0 {
            return Err(PlacementAdminError::InvalidCapacity {
                placement_id,
                capacity,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.txn_timeout,
                self.create_placement_once(&placement_id, &program_id, capacity, status),
                || PlacementAdminError::StoreUnavailable(timed_out(self.txn_timeout)),
            )
            .await;

            match result {
                Err(PlacementAdminError::Conflict) if attempt < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(other) => return Err(other),
                Ok(placement) => {
                    info!(
                        placement = %placement.id,
                        program = %placement.program_id,
                        capacity = placement.capacity,
                        status = placement.status.label(),
                        "placement registered"
                    );
                    return Ok(placement);
                }
            }
        }
    }

    async fn create_placement_once(
        &self,
        placement_id: &PlacementId,
        program_id: &ProgramId,
        capacity: u32,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        let mut txn = self.store.begin().await?;

        if txn.placement(placement_id).await?.is_some() {
            return Err(PlacementAdminError::DuplicatePlacement(
                placement_id.clone(),
            ));
        }

        let mut placement = Placement::new(placement_id.clone(), program_id.clone(), capacity);
        status.apply(&mut placement);

        txn.put_placement(placement.clone());
        txn.commit().await?;
        Ok(placement)
    }

    /// Applies an administrative status. `Full` cannot be requested; it is
    /// re-derived from the seat counter whenever the placement reactivates.
    pub async fn set_placement_status(
        &self,
        placement_id: &PlacementId,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.txn_timeout,
                self.set_placement_status_once(placement_id, status),
                || PlacementAdminError::StoreUnavailable(timed_out(self.txn_timeout)),
            )
            .await;

            match result {
                Err(PlacementAdminError::Conflict) if attempt < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(other) => return Err(other),
                Ok(placement) => {
                    info!(
                        placement = %placement.id,
                        status = placement.status.label(),
                        "placement status changed"
                    );
                    return Ok(placement);
                }
            }
        }
    }

    async fn set_placement_status_once(
        &self,
        placement_id: &PlacementId,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        let mut txn = self.store.begin().await?;

        let mut placement = txn
            .placement(placement_id)
            .await?
            .ok_or_else(|| PlacementAdminError::PlacementNotFound(placement_id.clone()))?;
        status.apply(&mut placement);
        placement.verify_seat_invariant()?;

        txn.put_placement(placement.clone());
        txn.commit().await?;
        Ok(placement)
    }

    /// Removes a placement outright. Refused while any seat is assigned.
    pub async fn delete_placement(
        &self,
        placement_id: &PlacementId,
    ) -> Result<(), PlacementAdminError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.txn_timeout,
                self.delete_placement_once(placement_id),
                || PlacementAdminError::StoreUnavailable(timed_out(self.txn_timeout)),
            )
            .await;

            match result {
                Err(PlacementAdminError::Conflict) if attempt < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(other) => return Err(other),
                Ok(()) => {
                    info!(placement = %placement_id, "placement deleted");
                    return Ok(());
                }
            }
        }
    }

    async fn delete_placement_once(
        &self,
        placement_id: &PlacementId,
    ) -> Result<(), PlacementAdminError> {
        let mut txn = self.store.begin().await?;

        let placement = txn
            .placement(placement_id)
            .await?
            .ok_or_else(|| PlacementAdminError::PlacementNotFound(placement_id.clone()))?;
        if placement.assigned_count > 0 {
            return Err(PlacementAdminError::PlacementOccupied {
                placement_id: placement.id,
                assigned_count: placement.assigned_count,
            });
        }

        txn.remove_placement(placement_id);
        txn.commit().await?;
        Ok(())
    }

    /// Read-only snapshot of one placement and its currently assigned
    /// learners. Never commits, so it cannot conflict.
    pub async fn placement_view(
        &self,
        placement_id: &PlacementId,
    ) -> Result<PlacementView, ViewError> {
        let mut txn = self
            .store
            .begin()
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;

        let placement = txn
            .placement(placement_id)
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?
            .ok_or_else(|| ViewError::PlacementNotFound(placement_id.clone()))?;
        let learners = txn
            .active_enrollments_for_placement(placement_id)
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?
            .into_iter()
            .map(|enrollment| enrollment.learner_id)
            .collect();

        Ok(PlacementView {
            placement_id: placement.id,
            program_id: placement.program_id,
            capacity: placement.capacity,
            assigned_count: placement.assigned_count,
            status: placement.status.label(),
            learners,
        })
    }
}

fn timed_out(limit: Duration) -> String {
    format!("transaction exceeded the {limit:?} deadline")
}

/// Failures while enrolling a learner.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("placement {placement_id} is unavailable: {detail}")]
    PlacementUnavailable {
        placement_id: PlacementId,
        detail: String,
    },
    #[error("learner {learner_id} already holds an active enrollment at {placement_id}")]
    AlreadyEnrolled {
        learner_id: LearnerId,
        placement_id: PlacementId,
    },
    #[error("programme {learner_program} does not match placement programme {placement_program}")]
    ProgramMismatch {
        learner_program: ProgramId,
        placement_program: ProgramId,
    },
    #[error("placement {placement_id} has no seats left of {capacity}")]
    CapacityExceeded {
        placement_id: PlacementId,
        capacity: u32,
    },
    #[error("enrollment kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl EnrollError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            EnrollError::PlacementUnavailable { .. }
            | EnrollError::AlreadyEnrolled { .. }
            | EnrollError::ProgramMismatch { .. }
            | EnrollError::CapacityExceeded { .. } => ErrorKind::Validation,
            EnrollError::Conflict => ErrorKind::Contention,
            EnrollError::StoreUnavailable(_) => ErrorKind::Dependency,
            EnrollError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

impl From<StoreError> for EnrollError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}

/// Failures while ending an enrollment.
#[derive(Debug, thiserror::Error)]
pub enum UnenrollError {
    #[error("learner {learner_id} holds no active enrollment at {placement_id}")]
    NotEnrolled {
        learner_id: LearnerId,
        placement_id: PlacementId,
    },
    #[error("unenroll kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl UnenrollError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            UnenrollError::NotEnrolled { .. } => ErrorKind::Validation,
            UnenrollError::Conflict => ErrorKind::Contention,
            UnenrollError::StoreUnavailable(_) => ErrorKind::Dependency,
            UnenrollError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

impl From<StoreError> for UnenrollError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}

/// Failures for the administrative placement operations.
#[derive(Debug, thiserror::Error)]
pub enum PlacementAdminError {
    #[error("placement {placement_id} capacity {capacity} must be at least one seat")]
    InvalidCapacity {
        placement_id: PlacementId,
        capacity: u32,
    },
    #[error("placement {0} already exists")]
    DuplicatePlacement(PlacementId),
    #[error("placement {0} not found")]
    PlacementNotFound(PlacementId),
    #[error("placement {placement_id} still holds {assigned_count} active assignments")]
    PlacementOccupied {
        placement_id: PlacementId,
        assigned_count: u32,
    },
    #[error("placement administration kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl PlacementAdminError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            PlacementAdminError::InvalidCapacity { .. }
            | PlacementAdminError::DuplicatePlacement(_)
            | PlacementAdminError::PlacementNotFound(_)
            | PlacementAdminError::PlacementOccupied { .. } => ErrorKind::Validation,
            PlacementAdminError::Conflict => ErrorKind::Contention,
            PlacementAdminError::StoreUnavailable(_) => ErrorKind::Dependency,
            PlacementAdminError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

impl From<StoreError> for PlacementAdminError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}
