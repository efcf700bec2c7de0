use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{EnrollmentId, LearnerId, PlacementId, SessionId, StipendTier};

/// Closed set of facts the engine announces after a transaction commits.
/// Emission is fire-and-forget; a sink failure never rolls anything back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Enrolled {
        enrollment_id: EnrollmentId,
        learner_id: LearnerId,
        placement_id: PlacementId,
        at: DateTime<Utc>,
    },
    Unenrolled {
        learner_id: LearnerId,
        placement_id: PlacementId,
        at: DateTime<Utc>,
    },
    SessionOpened {
        session_id: SessionId,
        learner_id: LearnerId,
        placement_id: PlacementId,
        at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: SessionId,
        learner_id: LearnerId,
        placement_id: PlacementId,
        minutes: u64,
        at: DateTime<Utc>,
    },
    SessionFlagged {
        session_id: SessionId,
        learner_id: LearnerId,
        opened_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    TierChanged {
        learner_id: LearnerId,
        year: i32,
        month: u32,
        previous: StipendTier,
        current: StipendTier,
    },
}

impl DomainEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Enrolled { .. } => "enrolled",
            DomainEvent::Unenrolled { .. } => "unenrolled",
            DomainEvent::SessionOpened { .. } => "session_opened",
            DomainEvent::SessionClosed { .. } => "session_closed",
            DomainEvent::SessionFlagged { .. } => "session_flagged",
            DomainEvent::TierChanged { .. } => "tier_changed",
        }
    }
}

/// Trait describing the outbound event hook (audit log, queue, webhook).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent) -> Result<(), EmitError>;
}

/// Event dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("event transport unavailable: {0}")]
    Transport(String),
}

/// Emits after a successful commit; a refused event is logged and dropped.
pub(crate) fn emit_or_log<E: EventSink + ?Sized>(sink: &E, event: DomainEvent) {
    let kind = event.kind();
    if let Err(error) = sink.emit(event) {
        tracing::warn!(event = kind, %error, "domain event emission failed");
    }
}
