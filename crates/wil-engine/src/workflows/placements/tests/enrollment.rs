use std::sync::Arc;

use crate::workflows::placements::domain::{
    AdminPlacementStatus, EnrollRequest, ErrorKind, PlacementStatus, UnenrollRequest, ViewError,
};
use crate::workflows::placements::engine::PlacementEngine;
use crate::workflows::placements::enrollment::{EnrollError, PlacementAdminError, UnenrollError};

use crate::workflows::placements::memory::MemoryStore;

use super::common::{
    at, engine, enroll_learner, fast_settings, key, lid, pid, prog, seed_placement,
    AcceptAllVerifier, FailingSink, RecordingSink, UnavailableStore,
};

fn enroll_request(learner: &str, placement: &str, program: &str, idem: &str) -> EnrollRequest {
    EnrollRequest {
        learner_id: lid(learner),
        placement_id: pid(placement),
        learner_program: prog(program),
        idempotency_key: key(idem),
    }
}

fn unenroll_request(learner: &str, placement: &str, idem: &str) -> UnenrollRequest {
    UnenrollRequest {
        learner_id: lid(learner),
        placement_id: pid(placement),
        idempotency_key: key(idem),
    }
}

#[tokio::test]
async fn seat_frees_only_after_unenroll() {
    let (engine, store, sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "enroll-a", now).await;
    enroll_learner(&engine, "lrn-b", "pl-clinic", "prog-nursing", "enroll-b", now).await;

    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 2);
    assert_eq!(placement.status, PlacementStatus::Full);

    let refusal = engine
        .enroll(&enroll_request("lrn-c", "pl-clinic", "prog-nursing", "enroll-c"), now)
        .await
        .expect_err("no seat left");
    assert!(matches!(refusal, EnrollError::CapacityExceeded { capacity: 2, .. }));
    assert_eq!(refusal.kind(), ErrorKind::Validation);

    engine
        .unenroll(
            &unenroll_request("lrn-a", "pl-clinic", "leave-a"),
            at(2026, 3, 9, 17, 0),
        )
        .await
        .expect("unenroll accepted");
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 1);
    assert_eq!(placement.status, PlacementStatus::Active);

    // A refused attempt records nothing, so the same key works once a seat
    // opens up.
    enroll_learner(
        &engine,
        "lrn-c",
        "pl-clinic",
        "prog-nursing",
        "enroll-c",
        at(2026, 3, 10, 8, 0),
    )
    .await;
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 2);
    assert_eq!(placement.status, PlacementStatus::Full);

    assert_eq!(
        sink.kinds(),
        vec!["enrolled", "enrolled", "unenrolled", "enrolled"]
    );
}

#[tokio::test]
async fn enrollment_requires_an_open_placement() {
    let (engine, _store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);

    let missing = engine
        .enroll(&enroll_request("lrn-a", "pl-ghost", "prog-nursing", "k1"), now)
        .await
        .expect_err("unknown placement refused");
    assert!(matches!(&missing, EnrollError::PlacementUnavailable { .. }));
    assert_eq!(missing.kind(), ErrorKind::Validation);

    seed_placement(&engine, "pl-depot", "prog-logistics", 3).await;
    engine
        .set_placement_status(&pid("pl-depot"), AdminPlacementStatus::Inactive)
        .await
        .expect("status change");
    let inactive = engine
        .enroll(&enroll_request("lrn-a", "pl-depot", "prog-logistics", "k2"), now)
        .await
        .expect_err("inactive placement refused");
    assert!(matches!(&inactive, EnrollError::PlacementUnavailable { .. }));

    engine
        .set_placement_status(&pid("pl-depot"), AdminPlacementStatus::Suspended)
        .await
        .expect("status change");
    let suspended = engine
        .enroll(&enroll_request("lrn-a", "pl-depot", "prog-logistics", "k3"), now)
        .await
        .expect_err("suspended placement refused");
    assert!(matches!(&suspended, EnrollError::PlacementUnavailable { .. }));
}

#[tokio::test]
async fn a_learner_holds_at_most_one_active_enrollment() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-first", "prog-nursing", 2).await;
    seed_placement(&engine, "pl-second", "prog-nursing", 2).await;

    enroll_learner(&engine, "lrn-a", "pl-first", "prog-nursing", "k1", now).await;
    let refused = engine
        .enroll(&enroll_request("lrn-a", "pl-second", "prog-nursing", "k2"), now)
        .await
        .expect_err("second active enrollment refused");
    match refused {
        EnrollError::AlreadyEnrolled { placement_id, .. } => {
            assert_eq!(placement_id, pid("pl-first"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let untouched = store.placement_snapshot(&pid("pl-second")).expect("placement");
    assert_eq!(untouched.assigned_count, 0);
}

#[tokio::test]
async fn programme_mismatch_is_refused() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    let refused = engine
        .enroll(&enroll_request("lrn-a", "pl-clinic", "prog-welding", "k1"), now)
        .await
        .expect_err("programme mismatch refused");
    assert!(matches!(
        &refused,
        EnrollError::ProgramMismatch { learner_program, placement_program }
            if learner_program == &prog("prog-welding") && placement_program == &prog("prog-nursing")
    ));
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 0);
}

#[tokio::test]
async fn enroll_replay_returns_the_recorded_row() {
    let (engine, store, sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    let first = enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "enroll-a", now).await;
    let replay = engine
        .enroll(
            &enroll_request("lrn-a", "pl-clinic", "prog-nursing", "enroll-a"),
            at(2026, 3, 2, 8, 5),
        )
        .await
        .expect("replay accepted");

    assert_eq!(replay.id, first.id);
    assert_eq!(replay.started_at, first.started_at);
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 1);
    assert_eq!(sink.kinds(), vec!["enrolled"]);
}

#[tokio::test]
async fn enroll_replay_survives_the_enrollment_ending() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    let created = enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "enroll-a", now).await;
    engine
        .unenroll(
            &unenroll_request("lrn-a", "pl-clinic", "leave-a"),
            at(2026, 3, 20, 17, 0),
        )
        .await
        .expect("unenroll accepted");

    // The key still resolves to the same row, now in its ended state, and
    // no seat is consumed again.
    let replay = engine
        .enroll(
            &enroll_request("lrn-a", "pl-clinic", "prog-nursing", "enroll-a"),
            at(2026, 3, 21, 8, 0),
        )
        .await
        .expect("replay accepted");
    assert_eq!(replay.id, created.id);
    assert!(replay.ended_at.is_some());
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 0);
}

#[tokio::test]
async fn unenroll_requires_an_active_enrollment_here() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-first", "prog-nursing", 2).await;
    seed_placement(&engine, "pl-second", "prog-nursing", 2).await;

    let never_enrolled = engine
        .unenroll(&unenroll_request("lrn-a", "pl-first", "k1"), now)
        .await
        .expect_err("no enrollment to end");
    assert!(matches!(&never_enrolled, UnenrollError::NotEnrolled { .. }));
    assert_eq!(never_enrolled.kind(), ErrorKind::Validation);

    enroll_learner(&engine, "lrn-a", "pl-first", "prog-nursing", "k2", now).await;
    let wrong_placement = engine
        .unenroll(&unenroll_request("lrn-a", "pl-second", "k3"), now)
        .await
        .expect_err("enrollment is elsewhere");
    assert!(matches!(&wrong_placement, UnenrollError::NotEnrolled { .. }));
    let placement = store.placement_snapshot(&pid("pl-first")).expect("placement");
    assert_eq!(placement.assigned_count, 1);
}

#[tokio::test]
async fn unenroll_replay_releases_the_seat_once() {
    let (engine, store, sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;
    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "enroll-a", now).await;

    let ended = engine
        .unenroll(
            &unenroll_request("lrn-a", "pl-clinic", "leave-a"),
            at(2026, 3, 20, 17, 0),
        )
        .await
        .expect("unenroll accepted");
    let replay = engine
        .unenroll(
            &unenroll_request("lrn-a", "pl-clinic", "leave-a"),
            at(2026, 3, 20, 17, 30),
        )
        .await
        .expect("replay accepted");

    assert_eq!(replay.id, ended.id);
    assert_eq!(replay.ended_at, ended.ended_at);
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 0);
    assert_eq!(sink.kinds(), vec!["enrolled", "unenrolled"]);
}

#[tokio::test]
async fn conflicts_are_retried_until_the_store_settles() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    store.force_conflicts(2);
    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "k1", now).await;
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 1);
}

#[tokio::test]
async fn exhausted_retries_report_contention() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;

    store.force_conflicts(5);
    let error = engine
        .enroll(&enroll_request("lrn-a", "pl-clinic", "prog-nursing", "k1"), now)
        .await
        .expect_err("every attempt conflicted");
    assert!(matches!(error, EnrollError::Conflict));
    assert_eq!(error.kind(), ErrorKind::Contention);
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 0);
}

#[tokio::test]
async fn an_unreachable_store_is_a_dependency_failure() {
    let sink = Arc::new(RecordingSink::new());
    let engine = PlacementEngine::new(
        Arc::new(UnavailableStore),
        Arc::new(AcceptAllVerifier),
        sink,
        fast_settings(),
    );

    let error = engine
        .enroll(
            &enroll_request("lrn-a", "pl-clinic", "prog-nursing", "k1"),
            at(2026, 3, 2, 8, 0),
        )
        .await
        .expect_err("store offline");
    assert!(matches!(&error, EnrollError::StoreUnavailable(_)));
    assert_eq!(error.kind(), ErrorKind::Dependency);
}

#[tokio::test]
async fn a_broken_event_sink_never_blocks_writes() {
    let store = MemoryStore::new();
    let engine = PlacementEngine::new(
        Arc::new(store.clone()),
        Arc::new(AcceptAllVerifier),
        Arc::new(FailingSink),
        fast_settings(),
    );
    let now = at(2026, 3, 2, 8, 0);

    engine
        .create_placement(pid("pl-clinic"), prog("prog-nursing"), 2, AdminPlacementStatus::Active)
        .await
        .expect("placement registered");
    engine
        .enroll(&enroll_request("lrn-a", "pl-clinic", "prog-nursing", "k1"), now)
        .await
        .expect("enrollment accepted despite the sink");
    engine
        .unenroll(&unenroll_request("lrn-a", "pl-clinic", "k2"), now)
        .await
        .expect("unenroll accepted despite the sink");

    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.assigned_count, 0);
}

#[tokio::test]
async fn placement_registration_validates_input() {
    let (engine, store, _sink) = engine();

    let zero_capacity = engine
        .create_placement(pid("pl-void"), prog("prog-nursing"), 0, AdminPlacementStatus::Active)
        .await
        .expect_err("zero capacity refused");
    assert!(matches!(
        zero_capacity,
        PlacementAdminError::InvalidCapacity { capacity: 0, .. }
    ));

    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;
    let duplicate = engine
        .create_placement(pid("pl-clinic"), prog("prog-nursing"), 4, AdminPlacementStatus::Active)
        .await
        .expect_err("duplicate identifier refused");
    assert!(matches!(duplicate, PlacementAdminError::DuplicatePlacement(_)));
    // The original registration is untouched.
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.capacity, 2);

    engine
        .create_placement(pid("pl-dormant"), prog("prog-nursing"), 3, AdminPlacementStatus::Inactive)
        .await
        .expect("inactive registration accepted");
    let dormant = store.placement_snapshot(&pid("pl-dormant")).expect("placement");
    assert_eq!(dormant.status, PlacementStatus::Inactive);
}

#[tokio::test]
async fn suspension_keeps_seats_reserved() {
    let (engine, store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 1).await;
    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "k1", now).await;

    engine
        .set_placement_status(&pid("pl-clinic"), AdminPlacementStatus::Suspended)
        .await
        .expect("suspension accepted");
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.status, PlacementStatus::Suspended);
    assert_eq!(placement.assigned_count, 1);

    let refused = engine
        .enroll(&enroll_request("lrn-b", "pl-clinic", "prog-nursing", "k2"), now)
        .await
        .expect_err("suspended placement refused");
    assert!(matches!(refused, EnrollError::PlacementUnavailable { .. }));

    // Reactivating a placement with every seat taken lands on Full, not
    // Active.
    engine
        .set_placement_status(&pid("pl-clinic"), AdminPlacementStatus::Active)
        .await
        .expect("reactivation accepted");
    let placement = store.placement_snapshot(&pid("pl-clinic")).expect("placement");
    assert_eq!(placement.status, PlacementStatus::Full);
    assert_eq!(placement.assigned_count, 1);
}

#[tokio::test]
async fn occupied_placements_cannot_be_deleted() {
    let (engine, _store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 2).await;
    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "k1", now).await;

    let refused = engine
        .delete_placement(&pid("pl-clinic"))
        .await
        .expect_err("occupied placement kept");
    assert!(matches!(
        refused,
        PlacementAdminError::PlacementOccupied { assigned_count: 1, .. }
    ));

    engine
        .unenroll(&unenroll_request("lrn-a", "pl-clinic", "k2"), now)
        .await
        .expect("unenroll accepted");
    engine
        .delete_placement(&pid("pl-clinic"))
        .await
        .expect("empty placement deleted");

    let gone = engine
        .placement_view(&pid("pl-clinic"))
        .await
        .expect_err("deleted placement gone");
    assert!(matches!(gone, ViewError::PlacementNotFound(_)));
}

#[tokio::test]
async fn placement_view_lists_active_learners() {
    let (engine, _store, _sink) = engine();
    let now = at(2026, 3, 2, 8, 0);
    seed_placement(&engine, "pl-clinic", "prog-nursing", 3).await;
    enroll_learner(&engine, "lrn-a", "pl-clinic", "prog-nursing", "k1", now).await;
    enroll_learner(&engine, "lrn-b", "pl-clinic", "prog-nursing", "k2", now).await;

    let view = engine
        .placement_view(&pid("pl-clinic"))
        .await
        .expect("view available");
    assert_eq!(view.placement_id, pid("pl-clinic"));
    assert_eq!(view.capacity, 3);
    assert_eq!(view.assigned_count, 2);
    assert_eq!(view.status, "active");

    let mut names: Vec<String> = view.learners.iter().map(ToString::to_string).collect();
    names.sort();
    assert_eq!(names, vec!["lrn-a".to_string(), "lrn-b".to_string()]);
}
