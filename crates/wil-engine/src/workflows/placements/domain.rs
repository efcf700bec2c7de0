use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier wrapper for learners handled by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LearnerId(pub String);

/// Identifier wrapper for workplace placements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementId(pub String);

/// Identifier wrapper for training programmes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub String);

/// Identifier assigned to an enrollment when it is first committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollmentId(pub Uuid);

/// Identifier assigned to an attendance session when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

/// Caller-supplied token that makes every mutating operation safely retryable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl fmt::Display for LearnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PlacementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a placement's availability. `Full` is derived from the
/// seat counter; `Inactive` and `Suspended` are administrative states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStatus {
    Active,
    Full,
    Inactive,
    Suspended,
}

impl PlacementStatus {
    pub const fn label(self) -> &'static str {
        match self {
            PlacementStatus::Active => "active",
            PlacementStatus::Full => "full",
            PlacementStatus::Inactive => "inactive",
            PlacementStatus::Suspended => "suspended",
        }
    }
}

/// The administrative half of the placement lifecycle. `Full` is never set
/// directly; it falls out of the seat counter when `Active` is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminPlacementStatus {
    Active,
    Inactive,
    Suspended,
}

impl AdminPlacementStatus {
    pub const fn label(self) -> &'static str {
        match self {
            AdminPlacementStatus::Active => "active",
            AdminPlacementStatus::Inactive => "inactive",
            AdminPlacementStatus::Suspended => "suspended",
        }
    }

    /// Applies the requested state, re-deriving `Full` from the counter.
    /// Suspension does not touch the counter, so a full placement comes
    /// back as `Full` when reactivated.
    pub(crate) fn apply(self, placement: &mut Placement) {
        placement.status = match self {
            AdminPlacementStatus::Active if placement.assigned_count == placement.capacity => {
                PlacementStatus::Full
            }
            AdminPlacementStatus::Active => PlacementStatus::Active,
            AdminPlacementStatus::Inactive => PlacementStatus::Inactive,
            AdminPlacementStatus::Suspended => PlacementStatus::Suspended,
        };
    }
}

/// A workplace slot pool with a finite number of seats for one programme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub id: PlacementId,
    pub program_id: ProgramId,
    pub capacity: u32,
    pub assigned_count: u32,
    pub status: PlacementStatus,
}

impl Placement {
    pub fn new(id: PlacementId, program_id: ProgramId, capacity: u32) -> Self {
        Self {
            id,
            program_id,
            capacity,
            assigned_count: 0,
            status: PlacementStatus::Active,
        }
    }

    pub fn seats_remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.assigned_count)
    }

    /// Occupy one seat, flipping the status to `Full` when the last one goes.
    pub(crate) fn record_assignment(&mut self) -> Result<(), InvariantViolation> {
        if self.assigned_count >= self.capacity {
            return Err(InvariantViolation::new(format!(
                "placement {} assignment would exceed capacity {}",
                self.id, self.capacity
            )));
        }
        self.assigned_count += 1;
        if self.assigned_count == self.capacity && self.status == PlacementStatus::Active {
            self.status = PlacementStatus::Full;
        }
        Ok(())
    }

    /// Release one seat, demoting `Full` back to `Active`.
    pub(crate) fn record_release(&mut self) -> Result<(), InvariantViolation> {
        if self.assigned_count == 0 {
            return Err(InvariantViolation::new(format!(
                "placement {} release would decrement assigned_count below zero",
                self.id
            )));
        }
        self.assigned_count -= 1;
        if self.status == PlacementStatus::Full {
            self.status = PlacementStatus::Active;
        }
        Ok(())
    }

    /// Seat counter and derived status must agree whenever the placement is
    /// on the Active/Full axis. Administrative states keep their counter.
    pub fn verify_seat_invariant(&self) -> Result<(), InvariantViolation> {
        if self.assigned_count > self.capacity {
            return Err(InvariantViolation::new(format!(
                "placement {} holds {} assignments over capacity {}",
                self.id, self.assigned_count, self.capacity
            )));
        }
        match self.status {
            PlacementStatus::Full if self.assigned_count != self.capacity => {
                Err(InvariantViolation::new(format!(
                    "placement {} marked full with {}/{} seats assigned",
                    self.id, self.assigned_count, self.capacity
                )))
            }
            PlacementStatus::Active if self.assigned_count == self.capacity => {
                Err(InvariantViolation::new(format!(
                    "placement {} still active with all {} seats assigned",
                    self.id, self.capacity
                )))
            }
            _ => Ok(()),
        }
    }
}

/// A learner's tie to a placement. At most one active enrollment per learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub learner_id: LearnerId,
    pub placement_id: PlacementId,
    pub program_id: ProgramId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub started_with: IdempotencyKey,
    pub ended_with: Option<IdempotencyKey>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Lifecycle of an attendance session. `Flagged` is terminal and excluded
/// from hour totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
    Flagged,
}

impl SessionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
            SessionStatus::Flagged => "flagged",
        }
    }
}

/// One verified span of on-site presence. At most one open session per learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: SessionId,
    pub learner_id: LearnerId,
    pub placement_id: PlacementId,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub evidence_ref: String,
    pub notes: Option<String>,
    pub opened_with: IdempotencyKey,
    pub closed_with: Option<IdempotencyKey>,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Whole seconds between open and close, zero-clamped against skew.
    pub fn worked_seconds(&self) -> Option<i64> {
        self.closed_at
            .map(|closed_at| (closed_at - self.opened_at).num_seconds().max(0))
    }
}

/// Stipend banding derived from a month's verified minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StipendTier {
    Full,
    Prorata,
    None,
}

impl StipendTier {
    pub const fn label(self) -> &'static str {
        match self {
            StipendTier::Full => "full",
            StipendTier::Prorata => "prorata",
            StipendTier::None => "none",
        }
    }
}

/// Derived monthly rollup; recomputable from closed sessions at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyHoursSummary {
    pub learner_id: LearnerId,
    pub year: i32,
    pub month: u32,
    pub total_minutes: u64,
    pub stipend_tier: StipendTier,
}

/// Check-in proof bundle handed to the verification gateway. Which factors
/// a deployment requires is the gateway's policy, not the engine's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationFactors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_pin_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<QrPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selfie_ref: Option<String>,
}

/// Rotating QR token scanned at the host site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub token: String,
    pub issued_for: PlacementId,
    pub expires_at: DateTime<Utc>,
}

/// Device-reported location sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

/// Parameters for enrolling a learner into a placement. The learner's
/// programme comes from the caller; the engine keeps no learner roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub learner_id: LearnerId,
    pub placement_id: PlacementId,
    pub learner_program: ProgramId,
    pub idempotency_key: IdempotencyKey,
}

/// Parameters for ending a learner's active enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnenrollRequest {
    pub learner_id: LearnerId,
    pub placement_id: PlacementId,
    pub idempotency_key: IdempotencyKey,
}

/// Parameters for opening an attendance session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub learner_id: LearnerId,
    pub placement_id: PlacementId,
    pub factors: VerificationFactors,
    pub idempotency_key: IdempotencyKey,
}

/// Parameters for closing an open attendance session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutRequest {
    pub learner_id: LearnerId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub idempotency_key: IdempotencyKey,
}

/// Raised when stored state contradicts a structural rule the engine is
/// supposed to uphold. Surfaced opaquely; the detail goes to the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant violated: {detail}")]
pub struct InvariantViolation {
    pub detail: String,
}

impl InvariantViolation {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Coarse failure classification exposed alongside every operation error so
/// callers can choose between fixing the request, retrying, or paging someone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Contention,
    Dependency,
    Invariant,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Contention => "contention",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Invariant => "invariant",
        }
    }
}

/// Failures for the read-only views and monthly summary lookups.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("placement {0} not found")]
    PlacementNotFound(PlacementId),
    #[error("month {month} of {year} is not a valid reporting period")]
    InvalidPeriod { year: i32, month: u32 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ViewError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            ViewError::PlacementNotFound(_) | ViewError::InvalidPeriod { .. } => {
                ErrorKind::Validation
            }
            ViewError::StoreUnavailable(_) => ErrorKind::Dependency,
        }
    }
}

/// Sanitized placement snapshot for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementView {
    pub placement_id: PlacementId,
    pub program_id: ProgramId,
    pub capacity: u32,
    pub assigned_count: u32,
    pub status: &'static str,
    pub learners: Vec<LearnerId>,
}

/// Sanitized per-learner snapshot combining enrollment and session state.
#[derive(Debug, Clone, Serialize)]
pub struct LearnerStatusView {
    pub learner_id: LearnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_id: Option<PlacementId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_id: Option<ProgramId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_in_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_summary: Option<MonthlyHoursSummary>,
}
