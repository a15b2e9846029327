use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::config::RunnerConfig;
use tessera_common::types::{JobId, JobState, Status};
use tessera_runner::catalog::CatalogHost;
use tessera_runner::JobQueue;
use tokio::signal;
use tracing::{error, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `TESSERA_LOG_FORMAT=json` switches to one JSON object per line.
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn init_tracing(format: LogFormat) {
    // Logs go to stderr; stdout only carries result documents
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_format = LogFormat::from_env_value(std::env::var("TESSERA_LOG_FORMAT").ok().as_deref());
    init_tracing(log_format);

    info!("Tessera worker booting...");

    let specs: Vec<String> = std::env::args().skip(1).collect();
    if specs.is_empty() {
        bail!("usage: tessera-worker <spec> [<spec> ...]");
    }

    let config_path = env_path("TESSERA_CONFIG", "config/runner.json");
    if !config_path.exists() {
        warn!(path = %config_path.display(), "Runner config not found; using defaults");
    }
    let config = RunnerConfig::load_or_default(&config_path)?;

    let catalog_path = env_path("TESSERA_CATALOG", "config/catalog.json");
    let host = CatalogHost::load(&catalog_path).map_err(|e| {
        error!("Failed to load class catalog: {:#}", e);
        error!("Set TESSERA_CATALOG or create config/catalog.json");
        e
    })?;
    info!(
        classes = host.class_count(),
        catalog = %catalog_path.display(),
        "Loaded class catalog"
    );

    let qualifiers = std::env::var("TESSERA_QUALIFIERS").unwrap_or_default();
    let root_path = std::env::var("TESSERA_ROOT").unwrap_or_default();

    let queue = JobQueue::new(Arc::new(host), config).context("Failed to start job queue")?;

    let mut jobs = Vec::new();
    for spec in &specs {
        match queue.enqueue(spec, &qualifiers, &root_path) {
            Ok(accepted) => jobs.push(accepted.job_id),
            Err(e) => error!(spec = %spec, error = %e, "Rejected test spec"),
        }
    }

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, cancelling jobs...");
    };

    tokio::select! {
        result = wait_for_jobs(&queue, &jobs) => result?,
        _ = shutdown => {},
    }

    queue.shutdown().await;

    let mut all_passed = jobs.len() == specs.len();
    for job_id in &jobs {
        let response = queue.poll(job_id)?;
        let passed = response.status == JobState::Completed
            && matches!(response.result_status, Some(Status::Passed | Status::Skipped));
        all_passed &= passed;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    info!("Worker shutdown complete");
    if !all_passed {
        std::process::exit(1);
    }
    Ok(())
}

#[instrument(skip_all, fields(jobs = jobs.len()))]
async fn wait_for_jobs(queue: &JobQueue, jobs: &[JobId]) -> Result<()> {
    for job_id in jobs {
        loop {
            let job = queue.job(job_id)?;
            if job.state.is_terminal() {
                let elapsed_ms = job
                    .started_at
                    .zip(job.completed_at)
                    .map(|(start, end)| (end - start).num_milliseconds())
                    .unwrap_or(0);
                info!(
                    job_id = %job_id,
                    spec = %job.spec,
                    state = %job.state,
                    elapsed_ms,
                    "Job reached terminal state"
                );
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    Ok(())
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
