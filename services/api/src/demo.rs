use crate::infra::{RecordingEventSink, SitePassVerifier};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use wil_engine::error::AppError;
use wil_engine::workflows::placements::{
    AdminPlacementStatus, CheckInRequest, CheckOutRequest, DomainEvent, EngineSettings,
    EnrollRequest, IdempotencyKey, LearnerId, MemoryStore, PlacementEngine, PlacementId, ProgramId,
    UnenrollRequest, VerificationFactors,
};
use wil_engine::workflows::roster::PlacementRosterImporter;

const DEMO_PIN_HASH: &str = "sha256:demo-site-pin";

type DemoEngine = PlacementEngine<MemoryStore, SitePassVerifier, RecordingEventSink>;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Month to simulate as YYYY-MM (defaults to the current month)
    #[arg(long, value_parser = crate::infra::parse_month)]
    pub(crate) month: Option<(i32, u32)>,
    /// Number of eight-hour days the featured learner attends (1-28)
    #[arg(long, default_value_t = 17)]
    pub(crate) days: u32,
}

#[derive(Args, Debug)]
pub(crate) struct RosterArgs {
    /// Path to the roster CSV export (Placement ID, Program, Capacity, Status)
    #[arg(long)]
    pub(crate) file: PathBuf,
}

/// Parses a roster export against a throwaway engine and prints what an
/// import would create and what it would reject.
pub(crate) async fn run_roster_check(args: RosterArgs) -> Result<(), AppError> {
    let (engine, _events) = demo_engine();
    let report = PlacementRosterImporter::from_path(engine.enrollment(), &args.file).await?;

    println!("Roster check: {}", args.file.display());
    println!("- {} placement(s) would be created", report.created.len());
    for id in &report.created {
        println!("    {id}");
    }
    println!("- {} row(s) would be skipped", report.skipped.len());
    for defect in &report.skipped {
        println!("    line {}: {}", defect.line, defect.reason);
    }
    Ok(())
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let (year, month) = args.month.unwrap_or_else(|| {
        let now = Utc::now();
        (now.year(), now.month())
    });
    let days = args.days.clamp(1, 28);
    let Some(first_day) = Utc.with_ymd_and_hms(year, month, 1, 8, 0, 0).single() else {
        println!("cannot build a timeline for {year}-{month:02}");
        return Ok(());
    };

    let (engine, events) = demo_engine();

    println!("Placement engine demo: {year}-{month:02}, {days} attendance day(s)");

    println!("\nPlacement registration");
    for (id, program, capacity) in [
        ("pl-mercy-clinic", "prog-nursing", 2u32),
        ("pl-metro-depot", "prog-logistics", 8u32),
    ] {
        let outcome = engine
            .create_placement(
                PlacementId(id.to_string()),
                ProgramId(program.to_string()),
                capacity,
                AdminPlacementStatus::Active,
            )
            .await;
        match outcome {
            Ok(placement) => println!(
                "- registered {} for {} with {} seat(s)",
                placement.id, placement.program_id, placement.capacity
            ),
            Err(error) => println!("- could not register {id}: {error}"),
        }
    }

    println!("\nEnrollment at pl-mercy-clinic (2 seats)");
    let clinic = PlacementId("pl-mercy-clinic".to_string());
    let depot = PlacementId("pl-metro-depot".to_string());
    let enroll_morning = first_day - Duration::hours(1);

    enroll_step(&engine, "lrn-amina", &clinic, "enroll-amina", enroll_morning).await;
    enroll_step(&engine, "lrn-brian", &clinic, "enroll-brian", enroll_morning).await;
    enroll_step(&engine, "lrn-chipo", &clinic, "enroll-chipo", enroll_morning).await;
    enroll_step(&engine, "lrn-davo", &depot, "enroll-davo", enroll_morning).await;

    let release = UnenrollRequest {
        learner_id: LearnerId("lrn-amina".to_string()),
        placement_id: clinic.clone(),
        idempotency_key: IdempotencyKey("unenroll-amina".to_string()),
    };
    match engine
        .unenroll(&release, enroll_morning + Duration::minutes(10))
        .await
    {
        Ok(_) => println!("- lrn-amina left and released a seat"),
        Err(error) => println!("- lrn-amina could not leave: {error}"),
    }
    enroll_step(
        &engine,
        "lrn-chipo",
        &clinic,
        "enroll-chipo-retry",
        enroll_morning + Duration::minutes(11),
    )
    .await;

    match engine.placement_view(&clinic).await {
        Ok(view) => println!(
            "- roster now {}/{} ({}): {}",
            view.assigned_count,
            view.capacity,
            view.status,
            view.learners
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Err(error) => println!("- roster view unavailable: {error}"),
    }

    println!("\nAttendance for lrn-brian, {days} eight-hour day(s)");
    let brian = LearnerId("lrn-brian".to_string());
    for day in 0..days {
        let opened = first_day + Duration::days(i64::from(day));
        work_day(&engine, &brian, &clinic, day + 1, opened).await;
    }
    match engine.monthly_summary(&brian, year, month).await {
        Ok(summary) => println!(
            "- {} logged {} minute(s) in {year}-{month:02}, stipend tier {}",
            summary.learner_id,
            summary.total_minutes,
            summary.stipend_tier.label()
        ),
        Err(error) => println!("- monthly summary unavailable: {error}"),
    }
    for event in events.events() {
        if let DomainEvent::TierChanged {
            previous, current, ..
        } = event
        {
            println!(
                "- stipend tier moved from {} to {}",
                previous.label(),
                current.label()
            );
        }
    }

    println!("\nIdempotency and staleness");
    let replay = CheckInRequest {
        learner_id: brian.clone(),
        placement_id: clinic.clone(),
        factors: pin_factors(),
        idempotency_key: IdempotencyKey("open-day-1".to_string()),
    };
    let last_evening = first_day + Duration::days(i64::from(days - 1)) + Duration::hours(10);
    match engine.check_in(&replay, last_evening).await {
        Ok(session) => println!(
            "- replaying the day-1 check-in returned session {} unchanged",
            session.id
        ),
        Err(error) => println!("- day-1 replay refused: {error}"),
    }

    let forgotten = CheckInRequest {
        learner_id: LearnerId("lrn-chipo".to_string()),
        placement_id: clinic.clone(),
        factors: pin_factors(),
        idempotency_key: IdempotencyKey("open-chipo-evening".to_string()),
    };
    match engine.check_in(&forgotten, last_evening).await {
        Ok(session) => println!(
            "- lrn-chipo checked in at {} and never checked out",
            session.opened_at
        ),
        Err(error) => println!("- lrn-chipo could not check in: {error}"),
    }
    let duplicate = CheckInRequest {
        idempotency_key: IdempotencyKey("open-chipo-evening-2".to_string()),
        ..forgotten
    };
    match engine
        .check_in(&duplicate, last_evening + Duration::minutes(10))
        .await
    {
        Ok(session) => println!("- unexpected second session {}", session.id),
        Err(error) => println!("- a second check-in was refused: {error}"),
    }
    match engine
        .sweep_stale_sessions(last_evening + Duration::hours(18))
        .await
    {
        Ok(report) => println!(
            "- the sweep flagged {} session(s) opened before {}",
            report.flagged.len(),
            report.cutoff
        ),
        Err(error) => println!("- staleness sweep failed: {error}"),
    }

    match engine
        .learner_status(&brian, last_evening + Duration::hours(19))
        .await
    {
        Ok(view) => {
            let placement = view
                .placement_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "none".to_string());
            let minutes = view
                .latest_summary
                .map(|summary| summary.total_minutes)
                .unwrap_or(0);
            println!(
                "\nStatus for lrn-brian: placement {placement}, open session {}, {minutes} minute(s) on record",
                if view.open_session_id.is_some() {
                    "yes"
                } else {
                    "no"
                }
            );
        }
        Err(error) => println!("\nStatus for lrn-brian unavailable: {error}"),
    }

    render_event_rollup(&events.events());
    Ok(())
}

async fn enroll_step(
    engine: &DemoEngine,
    name: &str,
    placement: &PlacementId,
    key: &str,
    now: DateTime<Utc>,
) {
    let request = EnrollRequest {
        learner_id: LearnerId(name.to_string()),
        placement_id: placement.clone(),
        learner_program: ProgramId("prog-nursing".to_string()),
        idempotency_key: IdempotencyKey(key.to_string()),
    };
    match engine.enroll(&request, now).await {
        Ok(enrollment) => println!("- {name} took a seat (enrollment {})", enrollment.id),
        Err(error) => println!("- {name} was turned away: {error}"),
    }
}

async fn work_day(
    engine: &DemoEngine,
    learner: &LearnerId,
    placement: &PlacementId,
    day: u32,
    opened: DateTime<Utc>,
) {
    let check_in = CheckInRequest {
        learner_id: learner.clone(),
        placement_id: placement.clone(),
        factors: pin_factors(),
        idempotency_key: IdempotencyKey(format!("open-day-{day}")),
    };
    let session = match engine.check_in(&check_in, opened).await {
        Ok(session) => session,
        Err(error) => {
            println!("- day {day} check-in refused: {error}");
            return;
        }
    };
    let check_out = CheckOutRequest {
        learner_id: learner.clone(),
        session_id: session.id,
        notes: None,
        idempotency_key: IdempotencyKey(format!("close-day-{day}")),
    };
    if let Err(error) = engine.check_out(&check_out, opened + Duration::hours(8)).await {
        println!("- day {day} check-out refused: {error}");
    }
}

fn pin_factors() -> VerificationFactors {
    VerificationFactors {
        device_pin_hash: Some(DEMO_PIN_HASH.to_string()),
        qr_payload: None,
        geolocation: None,
        selfie_ref: None,
    }
}

fn demo_engine() -> (Arc<DemoEngine>, Arc<RecordingEventSink>) {
    let events = Arc::new(RecordingEventSink::default());
    let engine = Arc::new(PlacementEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SitePassVerifier::new(Some(DEMO_PIN_HASH.to_string()))),
        Arc::clone(&events),
        EngineSettings::default(),
    ));
    (engine, events)
}

fn render_event_rollup(events: &[DomainEvent]) {
    println!("\nRecorded domain events: {}", events.len());
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.kind()).or_default() += 1;
    }
    for (kind, count) in counts {
        println!("- {kind}: {count}");
    }
}
