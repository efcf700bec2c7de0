use crate::cli::ServeArgs;
use crate::infra::{AppState, SitePassVerifier, TracingEventSink};
use crate::routes::with_engine_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wil_engine::config::AppConfig;
use wil_engine::error::AppError;
use wil_engine::telemetry;
use wil_engine::workflows::placements::{EngineSettings, MemoryStore, PlacementEngine};

type ServerEngine = PlacementEngine<MemoryStore, SitePassVerifier, TracingEventSink>;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(secs) = args.sweep_interval_secs.take() {
        config.engine.sweep_interval_secs = secs;
    }

    telemetry::init(config.environment, &config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let engine = Arc::new(PlacementEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SitePassVerifier::from_env()),
        Arc::new(TracingEventSink),
        EngineSettings::from_config(&config.engine),
    ));
    spawn_staleness_sweeper(Arc::clone(&engine), config.engine.sweep_interval_secs);

    let app = with_engine_routes(engine)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "placement engine ready");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Background task that flags attendance sessions left open past the
/// staleness threshold. Skipped ticks are delayed, never bunched.
fn spawn_staleness_sweeper(engine: Arc<ServerEngine>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // The engine reports what it flagged; only failures need a log
            // line here.
            if let Err(error) = engine.sweep_stale_sessions(Utc::now()).await {
                warn!(%error, "staleness sweep failed");
            }
        }
    });
}
