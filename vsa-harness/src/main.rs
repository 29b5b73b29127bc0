//! vsa-harness - run a TOML scenario against the simulated hypervisor.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use vsa_harness::config::HarnessConfig;
use vsa_harness::db::connection::{close_pool, create_pool};
use vsa_harness::db::migrate::migrate;
use vsa_harness::{Scenario, ScenarioRunner, SqliteStore};
use vsa_orchestrator::{utils, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (TOML)
    #[arg(value_name = "FILE")]
    scenario: PathBuf,

    /// Engine configuration file; overrides VSA_ENGINE_CONFIG
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let harness = HarnessConfig::from_env();

    let level = args.log_level.as_deref().unwrap_or(&harness.log_level);
    utils::logger::init(level)?;

    let engine_config = EngineConfig::load(args.config.as_deref().or(harness.engine_config.as_deref()))?;
    let scenario = Scenario::from_file(&args.scenario)
        .with_context(|| format!("loading scenario {}", args.scenario.display()))?;
    tracing::info!(scenario = %scenario.name, db = %harness.db_path.display(), "Starting harness");

    std::fs::create_dir_all(&harness.data_dir)?;
    let db_path = harness.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool, &harness.data_dir)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut runner = ScenarioRunner::new(
        scenario,
        engine_config,
        Arc::new(SqliteStore::new(pool.clone())),
        cancel.clone(),
    );
    let result = runner.run().await;
    cancel.cancel();
    close_pool(&pool);

    let report = result?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Scenario: {}", report.name);
        for step in &report.steps {
            let status = if step.passed { "ok" } else { "FAILED" };
            println!("  [{}] {:<16} {:<6} jobs={}", step.index, step.op, status, step.job_ids.join(","));
            if let Some(error) = &step.error {
                println!("      {error}");
            }
        }
    }

    let failed = report.failed_steps().count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} steps failed", report.steps.len());
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, cancelling running jobs"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling running jobs"),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}
