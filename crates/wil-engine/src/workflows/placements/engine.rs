//! Facade wiring the enrollment coordinator, attendance tracker, and hours
//! aggregator over one shared store, verifier, and event sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;

use super::attendance::{AttendanceTracker, CheckInError, CheckOutError, SweepError, SweepReport};
use super::domain::{
    AdminPlacementStatus, AttendanceSession, CheckInRequest, CheckOutRequest, EnrollRequest,
    Enrollment, LearnerId, LearnerStatusView, MonthlyHoursSummary, Placement, PlacementId,
    PlacementView, ProgramId, UnenrollRequest, ViewError,
};
use super::enrollment::{EnrollError, EnrollmentCoordinator, PlacementAdminError, UnenrollError};
use super::events::EventSink;
use super::hours::{AggregationError, HoursAggregator, StipendPolicy};
use super::ports::{PlacementStore, VerificationGateway};
use super::retry::RetryPolicy;

/// Knobs shared by all engine components. `Default` matches the published
/// contract: a 160-hour monthly target and a 16-hour staleness threshold.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub stipend: StipendPolicy,
    pub stale_session_after: chrono::Duration,
    pub txn_timeout: Duration,
    pub verify_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stipend: StipendPolicy::default(),
            stale_session_after: chrono::Duration::hours(16),
            txn_timeout: Duration::from_secs(2),
            verify_timeout: Duration::from_secs(3),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry: RetryPolicy::new(
                config.txn_retry_attempts,
                Duration::from_millis(config.txn_retry_base_ms),
                Duration::from_millis(config.txn_retry_max_ms),
            ),
            stipend: StipendPolicy::new(config.monthly_target_minutes),
            stale_session_after: chrono::Duration::hours(config.stale_session_hours as i64),
            txn_timeout: Duration::from_millis(config.txn_timeout_ms),
            verify_timeout: Duration::from_millis(config.verify_timeout_ms),
        }
    }
}

/// The complete placement engine behind one handle. All methods take `now`
/// from the caller so schedules and tests control the clock.
pub struct PlacementEngine<S, V, E> {
    enrollment: EnrollmentCoordinator<S, E>,
    attendance: AttendanceTracker<S, V, E>,
    hours: Arc<HoursAggregator<S, E>>,
}

impl<S, V, E> PlacementEngine<S, V, E>
where
    S: PlacementStore,
    V: VerificationGateway,
    E: EventSink,
{
    pub fn new(store: Arc<S>, verifier: Arc<V>, events: Arc<E>, settings: EngineSettings) -> Self {
        let hours = Arc::new(HoursAggregator::new(
            store.clone(),
            events.clone(),
            settings.stipend,
            settings.retry.clone(),
            settings.txn_timeout,
        ));
        let enrollment = EnrollmentCoordinator::new(
            store.clone(),
            events.clone(),
            settings.retry.clone(),
            settings.txn_timeout,
        );
        let attendance = AttendanceTracker::new(
            store,
            verifier,
            events,
            hours.clone(),
            settings.retry,
            settings.stale_session_after,
            settings.txn_timeout,
            settings.verify_timeout,
        );

        Self {
            enrollment,
            attendance,
            hours,
        }
    }

    pub fn enrollment(&self) -> &EnrollmentCoordinator<S, E> {
        &self.enrollment
    }

    pub fn attendance(&self) -> &AttendanceTracker<S, V, E> {
        &self.attendance
    }

    pub fn hours(&self) -> &HoursAggregator<S, E> {
        &self.hours
    }

    pub async fn enroll(
        &self,
        request: &EnrollRequest,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollError> {
        self.enrollment.enroll(request, now).await
    }

    pub async fn unenroll(
        &self,
        request: &UnenrollRequest,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, UnenrollError> {
        self.enrollment.unenroll(request, now).await
    }

    pub async fn check_in(
        &self,
        request: &CheckInRequest,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSession, CheckInError> {
        self.attendance.check_in(request, now).await
    }

    pub async fn check_out(
        &self,
        request: &CheckOutRequest,
        now: DateTime<Utc>,
    ) -> Result<AttendanceSession, CheckOutError> {
        self.attendance.check_out(request, now).await
    }

    /// Freshly derived summary for one learner-month; does not persist.
    pub async fn monthly_summary(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<MonthlyHoursSummary, ViewError> {
        self.hours.current(learner_id, year, month).await
    }

    /// On-demand recompute that persists the summary and may announce a
    /// tier change, exactly like the post-close trigger.
    pub async fn recompute_monthly_summary(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<MonthlyHoursSummary, AggregationError> {
        self.hours.recompute(learner_id, year, month).await
    }

    pub async fn sweep_stale_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, SweepError> {
        self.attendance.sweep_stale_sessions(now).await
    }

    pub async fn create_placement(
        &self,
        placement_id: PlacementId,
        program_id: ProgramId,
        capacity: u32,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        self.enrollment
            .create_placement(placement_id, program_id, capacity, status)
            .await
    }

    pub async fn set_placement_status(
        &self,
        placement_id: &PlacementId,
        status: AdminPlacementStatus,
    ) -> Result<Placement, PlacementAdminError> {
        self.enrollment
            .set_placement_status(placement_id, status)
            .await
    }

    pub async fn delete_placement(
        &self,
        placement_id: &PlacementId,
    ) -> Result<(), PlacementAdminError> {
        self.enrollment.delete_placement(placement_id).await
    }

    pub async fn placement_view(
        &self,
        placement_id: &PlacementId,
    ) -> Result<PlacementView, ViewError> {
        self.enrollment.placement_view(placement_id).await
    }

    pub async fn learner_status(
        &self,
        learner_id: &LearnerId,
        now: DateTime<Utc>,
    ) -> Result<LearnerStatusView, ViewError> {
        self.attendance.learner_status(learner_id, now).await
    }
}
