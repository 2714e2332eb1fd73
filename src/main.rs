//! StreamRec Engine
//!
//! Hybrid content recommendation worker.
//!
//! # Commands
//!
//! - `streamrec-engine` - scheduled worker: retrains the neural scorer on an interval and
//!   warms the hybrid cache for the most active profiles
//! - `streamrec-engine train` - one training run, prints the report as JSON
//! - `streamrec-engine recommend <profile_id> [top_k] [region]` - prints recommendations as JSON
//!
//! # Graceful Shutdown
//!
//! The worker handles SIGTERM and SIGINT, letting an in-flight training cycle finish and
//! closing database connections cleanly.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use streamrec::config::Config;
use streamrec::database::{self, Database};
use streamrec::error::{Error, Result};
use streamrec::recommendation::{
    retrain, warm_cache, CacheStore, InteractionStore, MemoryCache, NeuralScorer,
    PostgresInteractionStore, RecommendationEngine, RedisCache, ResultCache,
};

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn InteractionStore>,
    pub engine: Arc<RecommendationEngine>,
    pub shutdown: broadcast::Sender<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  StreamRec Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    let config = Arc::new(Config::from_env()?);
    info!("Configuration loaded and validated");

    #[cfg(feature = "prometheus")]
    install_metrics_exporter();

    let db = Database::new(&config.database).await?;
    info!("Database connection pool established");

    info!("Running database migrations...");
    database::run_migrations(db.pool()).await?;
    info!("Database migrations applied");

    db.health_check().await?;
    let stats = db.stats();
    info!("Database healthy (pool size: {}, idle: {})", stats.size, stats.idle);

    let store: Arc<dyn InteractionStore> = Arc::new(PostgresInteractionStore::from_database(
        &db,
        config.database.query_timeout,
    ));
    let cache = Arc::new(ResultCache::new(connect_cache(&config).await, config.cache.ttl));
    let scorer = Arc::new(NeuralScorer::new(
        config.model.clone(),
        config.training.clone(),
    ));
    let engine = Arc::new(RecommendationEngine::new(
        store.clone(),
        cache,
        scorer,
        &config.recommendation,
    )?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        engine,
        shutdown: shutdown_tx.clone(),
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.first().map(String::as_str) {
        None | Some("worker") => run_worker(state, shutdown_tx).await,
        Some("train") => run_train(&state).await,
        Some("recommend") => run_recommend(&state, &args[1..]).await,
        Some(other) => Err(Error::config(format!(
            "unknown command '{}' (expected worker, train or recommend)",
            other
        ))),
    };

    db.close().await;
    info!("StreamRec Engine stopped");
    outcome
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("streamrec=debug,streamrec_engine=debug,sqlx=warn,info")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (plain, structured) = if json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .init();
}

#[cfg(feature = "prometheus")]
fn install_metrics_exporter() {
    let addr: std::net::SocketAddr = std::env::var("METRICS_ADDR")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 9000).into());

    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("Prometheus exporter listening on {}", addr),
        Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
    }
}

/// Redis when enabled and reachable, otherwise an in-process cache
async fn connect_cache(config: &Config) -> Arc<dyn CacheStore> {
    if !config.cache.enabled {
        info!("Redis disabled, using in-process cache");
        return Arc::new(MemoryCache::new());
    }

    match RedisCache::connect(&config.cache).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            warn!("Redis unavailable ({}), using in-process cache", e);
            Arc::new(MemoryCache::new())
        }
    }
}

/// One training run followed by cache warm-up
async fn run_training_cycle(state: &AppState) -> Result<()> {
    let window = state.config.recommendation.interaction_window_days;
    let report = retrain(state.store.as_ref(), state.engine.scorer(), window).await?;
    info!(
        "Model version {} trained on {} interactions",
        report.version, report.interactions
    );

    let training = &state.config.training;
    match warm_cache(
        state.engine.clone(),
        state.store.as_ref(),
        window,
        training.warmup_profiles,
        training.warmup_concurrency,
        state.config.recommendation.default_top_k,
    )
    .await
    {
        Ok(warmup) => info!("Warm-up: {}/{} profiles", warmup.warmed, warmup.profiles),
        Err(e) => warn!("Cache warm-up failed: {}", e),
    }
    Ok(())
}

fn log_cycle_error(e: &Error) {
    if e.is_error_level() {
        error!("Training cycle failed: {}", e);
    } else {
        warn!("Training cycle skipped: {}", e);
    }
}

/// Scheduled worker until a shutdown signal
async fn run_worker(state: Arc<AppState>, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    info!(
        "Starting scheduled retraining every {}s",
        state.config.training.interval.as_secs()
    );
    let handle = spawn_retrainer(state.clone());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        _ = wait_for_failure(&handle) => {
            warn!("Retraining task exited, initiating shutdown");
        }
    }

    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
        warn!("Shutdown timeout exceeded, forcing exit");
    }
    Ok(())
}

/// Spawn the retraining loop; the first tick trains immediately
fn spawn_retrainer(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = state.shutdown.subscribe();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.training.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("Running scheduled retraining...");
                    if let Err(e) = run_training_cycle(&state).await {
                        log_cycle_error(&e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Retraining task shutting down");
                    break;
                }
            }
        }
    })
}

async fn wait_for_failure(handle: &tokio::task::JoinHandle<()>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn run_train(state: &AppState) -> Result<()> {
    let window = state.config.recommendation.interaction_window_days;
    let report = retrain(state.store.as_ref(), state.engine.scorer(), window).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_recommend(state: &AppState, args: &[String]) -> Result<()> {
    let profile_id = args.first().ok_or_else(|| {
        Error::config("usage: streamrec-engine recommend <profile_id> [top_k] [region]")
    })?;
    let top_k = match args.get(1) {
        Some(raw) => raw.parse::<usize>().map_err(|e| Error::InvalidConfig {
            key: "top_k",
            message: format!("Invalid value '{}': {}", raw, e).into(),
        })?,
        None => state.config.recommendation.default_top_k,
    };
    let region = args.get(2).map(String::as_str);

    // Model state lives in process memory; train before scoring
    let window = state.config.recommendation.interaction_window_days;
    if let Err(e) = retrain(state.store.as_ref(), state.engine.scorer(), window).await {
        warn!("Neural scorer unavailable for this run: {}", e);
    }

    let recommendations = state
        .engine
        .recommend_in_region(profile_id, region, top_k)
        .await?;
    println!("{}", serde_json::to_string_pretty(&recommendations)?);
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
