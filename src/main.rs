//! MarketPipe Ingestion CLI
//!
//! Thin wrapper around the library: loads a JSON configuration record, wires
//! the pipeline together, runs one ingestion job, and maps the report to the
//! process exit code (0 = success, 1 = partial failure, 2 = total failure or
//! invalid inputs).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use marketpipe::bus::EventHandler;
use marketpipe::domain::events::EventKind;
use marketpipe::metrics::{serve_metrics, spawn_lag_probe};
use marketpipe::vendors::{build_fetcher, Credentials};
use marketpipe::{
    AggregationEngine, CheckpointStore, DomainEventBus, IngestionConfig, JobCoordinator,
    ParquetWriter, PipelineMetrics, RateLimiter, ValidationEngine,
};

#[derive(Parser, Debug)]
#[command(name = "marketpipe")]
#[command(about = "Minute-bar ingestion pipeline")]
struct Args {
    /// Path to the JSON ingestion configuration
    #[arg(short, long)]
    config: String,

    /// Prometheus metrics port (0 disables the endpoint)
    #[arg(short, long, default_value = "9102")]
    metrics_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Prune dataset files and persistence rows older than e.g. 30d, 6m, 1y
    /// after the job finishes
    #[arg(long)]
    prune_older_than: Option<String>,
}

/// Vendor-specific request budgets.
fn rate_limiter_for(provider: &str) -> Option<Arc<RateLimiter>> {
    match provider {
        "alpaca" => Some(Arc::new(RateLimiter::per_minute(200))),
        "iex" => Some(Arc::new(RateLimiter::new(100, Duration::from_secs(1)))),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("failed to read config {}", args.config))?;
    let config: IngestionConfig =
        serde_json::from_str(&raw).context("failed to parse config JSON")?;
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        std::process::exit(2);
    }

    info!(
        provider = config.provider,
        symbols = config.symbols.len(),
        start = %config.start,
        end = %config.end,
        "starting ingestion"
    );

    let metrics = PipelineMetrics::new();
    let bus = DomainEventBus::new();
    let writer = ParquetWriter::new(config.output_path.clone(), config.compression);
    let checkpoints = Arc::new(
        CheckpointStore::new(config.output_path.join("marketpipe.db"))
            .context("failed to open checkpoint store")?,
    );

    if args.metrics_port != 0 {
        tokio::spawn(serve_metrics(metrics.clone(), args.metrics_port));
    }
    let _lag_probe = spawn_lag_probe(metrics.clone(), Duration::from_secs(5));

    let credentials = match Credentials::from_env(&config.provider) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    let fetcher = match build_fetcher(
        &config.provider,
        &config.feed_type,
        config.batch_size,
        Duration::from_secs(config.request_timeout_secs),
        credentials,
        rate_limiter_for(&config.provider),
        metrics.clone(),
    ) {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    // Subscribers resolved at startup; the Arcs must outlive the run.
    let validation: Arc<dyn EventHandler> = Arc::new(ValidationEngine::new(
        config.output_path.clone(),
        config.reports_root(),
        metrics.clone(),
        bus.clone(),
    ));
    let aggregation: Arc<dyn EventHandler> =
        Arc::new(AggregationEngine::new(writer.clone(), bus.clone()));
    bus.subscribe(EventKind::IngestionJobCompleted, &validation);
    bus.subscribe(EventKind::IngestionJobCompleted, &aggregation);

    let coordinator = JobCoordinator::new(
        config.clone(),
        fetcher,
        writer,
        checkpoints.clone(),
        bus.clone(),
        metrics.clone(),
    );

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling job");
            cancel.cancel();
        }
    });

    let report = match coordinator.run().await {
        Ok(report) => report,
        Err(e) => {
            error!("ingestion failed: {}", e);
            std::process::exit(2);
        }
    };

    info!(
        job_id = %report.job_id,
        state = ?report.state,
        success = report.success_count,
        failed = report.failed_count,
        skipped = report.skipped_count,
        rows = report.rows_written,
        "job finished"
    );
    for line in &report.errors {
        error!("{}", line);
    }

    if let Some(expr) = &args.prune_older_than {
        let files = marketpipe::retention::prune_files(&config.output_path, expr, false)
            .context("file prune failed")?;
        let db = marketpipe::retention::prune_database(&checkpoints, expr, false)
            .context("database prune failed")?;
        info!(
            files = files.deleted,
            checkpoints = db.checkpoints,
            jobs = db.jobs,
            "retention pass complete"
        );
    }

    std::process::exit(report.exit_code());
}
