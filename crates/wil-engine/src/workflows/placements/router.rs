use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::attendance::{CheckInError, CheckOutError};
use super::domain::{
    AdminPlacementStatus, CheckInRequest, CheckOutRequest, EnrollRequest, ErrorKind, LearnerId,
    PlacementId, ProgramId, UnenrollRequest, ViewError,
};
use super::engine::PlacementEngine;
use super::enrollment::{EnrollError, PlacementAdminError, UnenrollError};
use super::events::EventSink;
use super::ports::{PlacementStore, VerificationGateway};

/// Router builder exposing the engine operations under `/api/v1/wil`.
pub fn engine_router<S, V, E>(engine: Arc<PlacementEngine<S, V, E>>) -> Router
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    Router::new()
        .route("/api/v1/wil/placements", post(create_placement_handler::<S, V, E>))
        .route(
            "/api/v1/wil/placements/:placement_id",
            get(placement_view_handler::<S, V, E>).delete(delete_placement_handler::<S, V, E>),
        )
        .route(
            "/api/v1/wil/placements/:placement_id/status",
            post(placement_status_handler::<S, V, E>),
        )
        .route("/api/v1/wil/enrollments", post(enroll_handler::<S, V, E>))
        .route(
            "/api/v1/wil/enrollments/unenroll",
            post(unenroll_handler::<S, V, E>),
        )
        .route(
            "/api/v1/wil/attendance/check-in",
            post(check_in_handler::<S, V, E>),
        )
        .route(
            "/api/v1/wil/attendance/check-out",
            post(check_out_handler::<S, V, E>),
        )
        .route(
            "/api/v1/wil/learners/:learner_id/hours/:year/:month",
            get(hours_handler::<S, V, E>),
        )
        .with_state(engine)
}

/// Payload for registering a placement. Status defaults to `active`.
#[derive(Debug, Deserialize)]
pub struct CreatePlacementPayload {
    pub placement_id: String,
    pub program_id: String,
    pub capacity: u32,
    #[serde(default)]
    pub status: Option<AdminPlacementStatus>,
}

/// Payload for the administrative status change.
#[derive(Debug, Deserialize)]
pub struct PlacementStatusPayload {
    pub status: AdminPlacementStatus,
}

fn error_body(kind: ErrorKind, detail: String) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "error": {
            "kind": kind.label(),
            "detail": detail,
        }
    }))
}

/// Invariant details stay in the server log; callers get a fixed phrase.
fn invariant_body() -> axum::Json<serde_json::Value> {
    error_body(ErrorKind::Invariant, "internal error".to_string())
}

fn view_error_response(error: ViewError) -> Response {
    let status = match &error {
        ViewError::PlacementNotFound(_) => StatusCode::NOT_FOUND,
        ViewError::InvalidPeriod { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ViewError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, error_body(error.kind(), error.to_string())).into_response()
}

fn admin_error_response(error: PlacementAdminError) -> Response {
    let status = match &error {
        PlacementAdminError::InvalidCapacity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PlacementAdminError::DuplicatePlacement(_)
        | PlacementAdminError::PlacementOccupied { .. } => StatusCode::CONFLICT,
        PlacementAdminError::PlacementNotFound(_) => StatusCode::NOT_FOUND,
        PlacementAdminError::Conflict | PlacementAdminError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PlacementAdminError::Invariant(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, invariant_body()).into_response();
        }
    };
    (status, error_body(error.kind(), error.to_string())).into_response()
}

pub(crate) async fn enroll_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    axum::Json(request): axum::Json<EnrollRequest>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    match engine.enroll(&request, Utc::now()).await {
        Ok(enrollment) => (StatusCode::CREATED, axum::Json(enrollment)).into_response(),
        Err(error) => {
            let status = match &error {
                EnrollError::PlacementUnavailable { .. } | EnrollError::ProgramMismatch { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EnrollError::AlreadyEnrolled { .. } | EnrollError::CapacityExceeded { .. } => {
                    StatusCode::CONFLICT
                }
                EnrollError::Conflict | EnrollError::StoreUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                EnrollError::Invariant(_) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, invariant_body()).into_response();
                }
            };
            (status, error_body(error.kind(), error.to_string())).into_response()
        }
    }
}

pub(crate) async fn unenroll_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    axum::Json(request): axum::Json<UnenrollRequest>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    match engine.unenroll(&request, Utc::now()).await {
        Ok(enrollment) => (StatusCode::OK, axum::Json(enrollment)).into_response(),
        Err(error) => {
            let status = match &error {
                UnenrollError::NotEnrolled { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                UnenrollError::Conflict | UnenrollError::StoreUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                UnenrollError::Invariant(_) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, invariant_body()).into_response();
                }
            };
            (status, error_body(error.kind(), error.to_string())).into_response()
        }
    }
}

pub(crate) async fn check_in_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    axum::Json(request): axum::Json<CheckInRequest>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    match engine.check_in(&request, Utc::now()).await {
        Ok(session) => (StatusCode::CREATED, axum::Json(session)).into_response(),
        Err(error) => {
            let status = match &error {
                CheckInError::VerificationFailed { .. } | CheckInError::NotAssignedHere { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                CheckInError::AlreadyCheckedIn { .. } => StatusCode::CONFLICT,
                CheckInError::Conflict
                | CheckInError::VerificationTimeout(_)
                | CheckInError::VerifierUnavailable(_)
                | CheckInError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, error_body(error.kind(), error.to_string())).into_response()
        }
    }
}

pub(crate) async fn check_out_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    axum::Json(request): axum::Json<CheckOutRequest>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    match engine.check_out(&request, Utc::now()).await {
        Ok(session) => (StatusCode::OK, axum::Json(session)).into_response(),
        Err(error) => {
            let status = match &error {
                CheckOutError::NoOpenSession { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                CheckOutError::Conflict | CheckOutError::StoreUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            (status, error_body(error.kind(), error.to_string())).into_response()
        }
    }
}

pub(crate) async fn hours_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    Path((learner_id, year, month)): Path<(String, i32, u32)>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    let learner_id = LearnerId(learner_id);
    match engine.monthly_summary(&learner_id, year, month).await {
        Ok(summary) => (StatusCode::OK, axum::Json(summary)).into_response(),
        Err(error) => view_error_response(error),
    }
}

pub(crate) async fn placement_view_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    Path(placement_id): Path<String>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    let placement_id = PlacementId(placement_id);
    match engine.placement_view(&placement_id).await {
        Ok(view) => (StatusCode::OK, axum::Json(view)).into_response(),
        Err(error) => view_error_response(error),
    }
}

pub(crate) async fn create_placement_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    axum::Json(payload): axum::Json<CreatePlacementPayload>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    let status = payload.status.unwrap_or(AdminPlacementStatus::Active);
    match engine
        .create_placement(
            PlacementId(payload.placement_id),
            ProgramId(payload.program_id),
            payload.capacity,
            status,
        )
        .await
    {
        Ok(placement) => (StatusCode::CREATED, axum::Json(placement)).into_response(),
        Err(error) => admin_error_response(error),
    }
}

pub(crate) async fn placement_status_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    Path(placement_id): Path<String>,
    axum::Json(payload): axum::Json<PlacementStatusPayload>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    let placement_id = PlacementId(placement_id);
    match engine
        .set_placement_status(&placement_id, payload.status)
        .await
    {
        Ok(placement) => (StatusCode::OK, axum::Json(placement)).into_response(),
        Err(error) => admin_error_response(error),
    }
}

pub(crate) async fn delete_placement_handler<S, V, E>(
    State(engine): State<Arc<PlacementEngine<S, V, E>>>,
    Path(placement_id): Path<String>,
) -> Response
where
    S: PlacementStore + 'static,
    V: VerificationGateway + 'static,
    E: EventSink + 'static,
{
    let placement_id = PlacementId(placement_id);
    match engine.delete_placement(&placement_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => admin_error_response(error),
    }
}
