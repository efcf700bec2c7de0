//! Work-integrated-learning placement engine: capacity-safe enrollment,
//! verified attendance sessions, and monthly stipend classification.

pub mod attendance;
pub mod domain;
pub mod engine;
pub mod enrollment;
pub mod events;
pub mod hours;
pub mod memory;
pub mod ports;
pub mod retry;
pub mod router;

#[cfg(test)]
mod tests;

pub use attendance::{AttendanceTracker, CheckInError, CheckOutError, SweepError, SweepReport};
pub use domain::{
    AdminPlacementStatus, AttendanceSession, CheckInRequest, CheckOutRequest, EnrollRequest,
    Enrollment, EnrollmentId, ErrorKind, GeoPoint, IdempotencyKey, InvariantViolation, LearnerId,
    LearnerStatusView, MonthlyHoursSummary, Placement, PlacementId, PlacementStatus, PlacementView,
    ProgramId, QrPayload, SessionId, SessionStatus, StipendTier, UnenrollRequest,
    VerificationFactors, ViewError,
};
pub use engine::{EngineSettings, PlacementEngine};
pub use enrollment::{EnrollError, EnrollmentCoordinator, PlacementAdminError, UnenrollError};
pub use events::{DomainEvent, EmitError, EventSink};
pub use hours::{AggregationError, HoursAggregator, StipendPolicy};
pub use memory::MemoryStore;
pub use ports::{
    PlacementStore, StoreError, StoreTransaction, Verdict, VerificationError, VerificationGateway,
};
pub use retry::RetryPolicy;
pub use router::engine_router;
