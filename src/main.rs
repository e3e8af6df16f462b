//! CLI entry point for the tram delay tracker.
//!
//! Provides subcommands for running the live tracking pipeline against the
//! fleet position feed and for aggregating a previously recorded event log
//! offline.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use tram_delay_tracker::aggregate::{DefaultCostModel, HourlyAggregator};
use tram_delay_tracker::config::TrackerConfig;
use tram_delay_tracker::fetch::{BasicClient, HttpFeed};
use tram_delay_tracker::output::load_events;
use tram_delay_tracker::spatial::StaticSpatialIndex;
use tram_delay_tracker::store::{EventStore, MemoryEventStore, MemoryRollupStore};
use tram_delay_tracker::tracker::dispatcher::Dispatcher;
use tram_delay_tracker::tracker::registry::WorkerRegistry;

#[derive(Parser)]
#[command(name = "tram_delay_tracker")]
#[command(about = "Detects and aggregates abnormal tram stops from a position feed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Thresholds {
    /// Feed poll interval in milliseconds
    #[arg(long, default_value_t = 10_000)]
    poll_interval_ms: u64,

    /// Speed (km/h) below which a vehicle counts as stopped
    #[arg(long, default_value_t = 3.0)]
    speed_threshold_kmh: f64,

    /// Highest numeric identifier accepted as a tram line
    #[arg(long, default_value_t = 99)]
    max_tram_line: u32,

    /// Platform proximity radius in metres
    #[arg(long, default_value_t = 50.0)]
    stop_proximity_m: f64,

    /// Signal-controlled crossing proximity radius in metres
    #[arg(long, default_value_t = 50.0)]
    intersection_proximity_m: f64,

    /// Longest normal boarding dwell at a platform, in seconds
    #[arg(long, default_value_t = 180)]
    normal_dwell_max_s: i64,

    /// Shortest off-platform stop that counts as a delay, in seconds
    #[arg(long, default_value_t = 30)]
    delay_min_duration_s: i64,

    /// Maximum distance (m) between stops merged into one interruption
    #[arg(long, default_value_t = 60.0)]
    merge_distance_m: f64,

    /// Grace window (s) for the double-stop merge
    #[arg(long, default_value_t = 45)]
    merge_grace_period_s: i64,

    /// Stops strictly longer than this (s) may be flagged multi-cycle
    #[arg(long, default_value_t = 120)]
    multi_cycle_threshold_s: i64,

    /// Idle worker eviction timeout in milliseconds
    #[arg(long, default_value_t = 300_000)]
    worker_idle_timeout_ms: u64,

    /// Aggregator wake interval in milliseconds
    #[arg(long, default_value_t = 300_000)]
    aggregate_interval_ms: u64,
}

impl Thresholds {
    fn into_config(self) -> TrackerConfig {
        TrackerConfig {
            poll_interval_ms: self.poll_interval_ms,
            speed_threshold_kmh: self.speed_threshold_kmh,
            max_tram_line: self.max_tram_line,
            stop_proximity_m: self.stop_proximity_m,
            intersection_proximity_m: self.intersection_proximity_m,
            normal_dwell_max_s: self.normal_dwell_max_s,
            delay_min_duration_s: self.delay_min_duration_s,
            merge_distance_m: self.merge_distance_m,
            merge_grace_period_s: self.merge_grace_period_s,
            multi_cycle_threshold_s: self.multi_cycle_threshold_s,
            worker_idle_timeout_ms: self.worker_idle_timeout_ms,
            aggregate_interval_ms: self.aggregate_interval_ms,
            ..TrackerConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Track the live fleet feed and detect delays until interrupted
    Track {
        /// URL of the fleet position snapshot endpoint
        #[arg(value_name = "FEED_URL")]
        feed_url: String,

        /// Directory for the daily CSV event log
        #[arg(short, long, default_value = "events")]
        events_dir: PathBuf,

        /// Directory for rollup JSON files and the aggregation checkpoint
        #[arg(short, long, default_value = "rollups")]
        rollups_dir: PathBuf,

        /// CSV of platform coordinates (lat,lon)
        #[arg(long)]
        stops_file: Option<PathBuf>,

        /// CSV of signal-controlled crossing coordinates (lat,lon)
        #[arg(long)]
        intersections_file: Option<PathBuf>,

        #[command(flatten)]
        thresholds: Thresholds,
    },
    /// Aggregate a recorded event log into rollup JSON files
    Aggregate {
        /// Directory containing the daily CSV event log
        #[arg(short, long, default_value = "events")]
        events_dir: PathBuf,

        /// Directory for rollup JSON files
        #[arg(short, long, default_value = "rollups")]
        rollups_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/tram_delay_tracker.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("tram_delay_tracker.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Track {
            feed_url,
            events_dir,
            rollups_dir,
            stops_file,
            intersections_file,
            thresholds,
        } => {
            track(
                feed_url,
                events_dir,
                rollups_dir,
                stops_file,
                intersections_file,
                Arc::new(thresholds.into_config()),
            )
            .await?;
        }
        Commands::Aggregate {
            events_dir,
            rollups_dir,
        } => {
            aggregate_offline(&events_dir, &rollups_dir).await?;
        }
    }

    Ok(())
}

/// Runs the live pipeline: dispatcher, per-vehicle workers, and the
/// periodic catch-up aggregator, until Ctrl-C.
async fn track(
    feed_url: String,
    events_dir: PathBuf,
    rollups_dir: PathBuf,
    stops_file: Option<PathBuf>,
    intersections_file: Option<PathBuf>,
    cfg: Arc<TrackerConfig>,
) -> Result<()> {
    let spatial = StaticSpatialIndex::from_csv_files(
        stops_file.as_deref(),
        intersections_file.as_deref(),
        cfg.stop_proximity_m,
        cfg.intersection_proximity_m,
    )?;
    if stops_file.is_none() {
        info!("No stops file given; platform proximity disabled");
    }

    let store: Arc<dyn EventStore> =
        Arc::new(MemoryEventStore::new().with_csv_log(&events_dir));
    let rollups = Arc::new(MemoryRollupStore::with_persist_dir(&rollups_dir)?);
    let registry = Arc::new(WorkerRegistry::new());

    let dispatcher = Dispatcher::new(
        cfg.clone(),
        HttpFeed::new(BasicClient::new(), feed_url),
        registry,
        store.clone(),
        Arc::new(spatial),
    );

    let aggregator = HourlyAggregator::new(
        cfg.clone(),
        store,
        rollups,
        Arc::new(DefaultCostModel::default()),
    );
    let aggregator_task = tokio::spawn(async move { aggregator.run().await });

    info!(
        poll_interval_ms = cfg.poll_interval_ms,
        "Tracking started. Press Ctrl+C to stop."
    );

    tokio::select! {
        _ = dispatcher.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
    }

    info!("Shutting down; resolving in-flight delays");
    aggregator_task.abort();
    dispatcher.shutdown().await;

    Ok(())
}

/// Loads a recorded event log and aggregates every hour it spans.
async fn aggregate_offline(events_dir: &Path, rollups_dir: &Path) -> Result<()> {
    let events = load_events(events_dir)?;
    if events.is_empty() {
        info!(events_dir = %events_dir.display(), "No events to aggregate");
        return Ok(());
    }

    let from = events.iter().map(|e| e.started_at).min().unwrap();
    let to = events.iter().map(|e| e.started_at).max().unwrap();
    info!(count = events.len(), from = %from, to = %to, "Event log loaded");

    let aggregator = HourlyAggregator::new(
        Arc::new(TrackerConfig::default()),
        Arc::new(MemoryEventStore::with_events(events)),
        Arc::new(MemoryRollupStore::with_persist_dir(rollups_dir)?),
        Arc::new(DefaultCostModel::default()),
    );

    let summaries = aggregator.aggregate_span(from, to).await?;
    let hours_with_events = summaries.iter().filter(|(_, s)| s.event_count > 0).count();
    info!(
        hours = summaries.len(),
        hours_with_events,
        rollups_dir = %rollups_dir.display(),
        "Aggregation complete"
    );

    Ok(())
}
