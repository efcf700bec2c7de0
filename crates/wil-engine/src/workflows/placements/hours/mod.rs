//! Monthly hours aggregation. The summary row is a derived cache: it is
//! recomputed in full from the month's closed sessions, never adjusted
//! incrementally, so replaying a recompute is always safe.

mod policy;

pub use policy::{StipendPolicy, FULL_THRESHOLD_PCT, PRORATA_THRESHOLD_PCT};

use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use tracing::{debug, info, warn};

use super::domain::{
    AttendanceSession, ErrorKind, LearnerId, MonthlyHoursSummary, SessionStatus, StipendTier,
    ViewError,
};
use super::events::{emit_or_log, DomainEvent, EventSink};
use super::ports::{PlacementStore, StoreError};
use super::retry::{with_deadline, RetryPolicy};

/// Recomputes and persists monthly summaries, announcing tier transitions.
pub struct HoursAggregator<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    policy: StipendPolicy,
    retry: RetryPolicy,
    txn_timeout: Duration,
}

impl<S, E> HoursAggregator<S, E>
where
    S: PlacementStore,
    E: EventSink,
{
    pub fn new(
        store: Arc<S>,
        events: Arc<E>,
        policy: StipendPolicy,
        retry: RetryPolicy,
        txn_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            policy,
            retry,
            txn_timeout,
        }
    }

    pub fn policy(&self) -> StipendPolicy {
        self.policy
    }

    /// Rebuilds the summary for one learner-month from its closed sessions
    /// and persists it. A tier transition against the previously stored
    /// summary (absent counts as `None`) is announced exactly once.
    pub async fn recompute(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<MonthlyHoursSummary, AggregationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.txn_timeout,
                self.recompute_once(learner_id, year, month),
                || AggregationError::StoreUnavailable(timed_out(self.txn_timeout)),
            )
            .await;

            match result {
                Err(AggregationError::Conflict) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        learner = %learner_id,
                        year,
                        month,
                        attempt,
                        ?delay,
                        "summary recompute lost a commit race, replaying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AggregationError::Conflict) => {
                    warn!(
                        learner = %learner_id,
                        year,
                        month,
                        attempts = attempt,
                        "summary recompute retry budget exhausted"
                    );
                    return Err(AggregationError::Conflict);
                }
                Err(other) => return Err(other),
                Ok((summary, previous_tier)) => {
                    if previous_tier != summary.stipend_tier {
                        info!(
                            learner = %learner_id,
                            year,
                            month,
                            minutes = summary.total_minutes,
                            from = previous_tier.label(),
                            to = summary.stipend_tier.label(),
                            "stipend tier changed"
                        );
                        emit_or_log(
                            self.events.as_ref(),
                            DomainEvent::TierChanged {
                                learner_id: learner_id.clone(),
                                year,
                                month,
                                previous: previous_tier,
                                current: summary.stipend_tier,
                            },
                        );
                    }
                    return Ok(summary);
                }
            }
        }
    }

    async fn recompute_once(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<(MonthlyHoursSummary, StipendTier), AggregationError> {
        let mut txn = self.store.begin().await?;

        let sessions = txn.closed_sessions_in_month(learner_id, year, month).await?;
        let previous_tier = txn
            .monthly_summary(learner_id, year, month)
            .await?
            .map(|stored| stored.stipend_tier)
            .unwrap_or(StipendTier::None);

        let summary = self.summarize(learner_id, year, month, &sessions);
        txn.put_summary(summary.clone());
        txn.commit().await?;

        Ok((summary, previous_tier))
    }

    /// Freshly derived summary without persisting anything. Serves the
    /// read-only lookup; the result matches what `recompute` would store.
    pub async fn current(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
    ) -> Result<MonthlyHoursSummary, ViewError> {
        if !(1..=12).contains(&month) {
            return Err(ViewError::InvalidPeriod { year, month });
        }

        let mut txn = self
            .store
            .begin()
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;
        let sessions = txn
            .closed_sessions_in_month(learner_id, year, month)
            .await
            .map_err(|error| ViewError::StoreUnavailable(error.to_string()))?;

        Ok(self.summarize(learner_id, year, month, &sessions))
    }

    /// Pure rollup: sum whole seconds across the month's closed sessions,
    /// floor to minutes once at the end, then band the total. A session
    /// belongs to the month it was opened in.
    fn summarize(
        &self,
        learner_id: &LearnerId,
        year: i32,
        month: u32,
        sessions: &[AttendanceSession],
    ) -> MonthlyHoursSummary {
        let total_seconds: i64 = sessions
            .iter()
            .filter(|session| {
                session.status == SessionStatus::Closed
                    && session.opened_at.year() == year
                    && session.opened_at.month() == month
            })
            .filter_map(AttendanceSession::worked_seconds)
            .sum();
        let total_minutes = (total_seconds / 60) as u64;

        MonthlyHoursSummary {
            learner_id: learner_id.clone(),
            year,
            month,
            total_minutes,
            stipend_tier: self.policy.classify(total_minutes),
        }
    }
}

fn timed_out(limit: Duration) -> String {
    format!("transaction exceeded the {limit:?} deadline")
}

/// Failures while recomputing a monthly summary.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("summary recompute kept colliding with concurrent updates; retry later")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AggregationError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            AggregationError::Conflict => ErrorKind::Contention,
            AggregationError::StoreUnavailable(_) => ErrorKind::Dependency,
        }
    }
}

impl From<StoreError> for AggregationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict => Self::Conflict,
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
        }
    }
}
