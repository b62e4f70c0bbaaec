//! Culprit CLI: runs the culprit-finding engine against recorded data.
//!
//! Builds, change logs and step logs come from a JSON fixture; try jobs are
//! recorded instead of submitted. With `--database-url` analyses persist to
//! Postgres, otherwise they live in memory for the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use culprit_engine::models::build::BuildKey;
use culprit_engine::models::failure::FailureKind;
use culprit_engine::models::flake::FlakeOccurrence;
use culprit_engine::models::try_job::{TryJobRange, TryJobReport};
use culprit_engine::providers::fixture::{
    FixtureData, RecordingScheduler, StaticBuildHistory, StaticChangeLogs, StaticDeps,
};
use culprit_engine::services::flake_aggregator::run_aggregation;
use culprit_engine::services::try_job_controller::identify_culprit;
use culprit_engine::store::memory::MemoryStore;
use culprit_engine::store::postgres::PgStore;
use culprit_engine::store::AnalysisStore;
use culprit_engine::{EngineConfig, FailureAnalyzer};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "culprit", about = "CI culprit finding")]
struct Cli {
    /// Engine configuration as JSON; defaults plus CULPRIT_* env vars otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics recorded during the run
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a failed build from a recorded fixture
    Analyze {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long)]
        builder: String,
        #[arg(long)]
        build: i64,
        #[arg(long, value_parser = parse_kind)]
        kind: FailureKind,
        /// Persist to Postgres instead of memory
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Read the culprit out of a try-job report
    #[command(name = "identify-culprit")]
    IdentifyCulprit {
        #[arg(long)]
        report: PathBuf,
        #[arg(long, value_parser = parse_kind, default_value = "compile")]
        kind: FailureKind,
    },
    /// Recompute flake scores from recorded occurrences
    #[command(name = "aggregate-flakes")]
    AggregateFlakes {
        #[arg(long)]
        occurrences: PathBuf,
        /// End of the window (RFC 3339); defaults to the current time
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Create the culprit tables
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

/// Input of `identify-culprit`.
#[derive(Deserialize)]
struct ReportFile {
    range: TryJobRange,
    report: TryJobReport,
}

fn parse_kind(s: &str) -> Result<FailureKind, String> {
    FailureKind::parse(s).ok_or_else(|| format!("unknown failure kind '{s}' (compile|test)"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> eyre::Result<T> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> eyre::Result<EngineConfig> {
    match path {
        Some(path) => read_json(path),
        None => Ok(EngineConfig::from_env()),
    }
}

fn open_store(database_url: Option<&str>) -> eyre::Result<Arc<dyn AnalysisStore>> {
    match database_url {
        Some(url) => {
            let store = PgStore::connect(url, 4).wrap_err("connecting to Postgres")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();
    let cli = Cli::parse();

    let metrics: Option<PrometheusHandle> = if cli.print_metrics {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .wrap_err("installing metrics recorder")?,
        )
    } else {
        None
    };
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Analyze {
            fixture,
            project,
            builder,
            build,
            kind,
            database_url,
        } => {
            let data: FixtureData = read_json(&fixture)?;
            let store = open_store(database_url.as_deref())?;
            let scheduler = Arc::new(RecordingScheduler::new());
            let analyzer = FailureAnalyzer::new(
                config,
                Arc::new(StaticBuildHistory::new(data.builds)),
                Arc::new(StaticChangeLogs::new(data.change_logs)),
                Arc::new(StaticDeps::new(data.deps)),
                scheduler.clone(),
                store,
            );
            let key = BuildKey::new(project, builder, build);
            tracing::info!(build = %key, kind = %kind, "Running analysis from fixture");
            let outcome = analyzer.analyze_failure(kind, &key, &data.logs).await?;
            print_json(&serde_json::json!({
                "analysis": outcome.analysis,
                "try_job": outcome.try_job,
                "try_job_requests": scheduler.requests().await,
            }))?;
        }
        Command::IdentifyCulprit { report, kind } => {
            let file: ReportFile = read_json(&report)?;
            let verdict = identify_culprit(kind, &file.report, &file.range);
            print_json(&verdict)?;
        }
        Command::AggregateFlakes {
            occurrences,
            now,
            database_url,
        } => {
            let occurrences: Vec<FlakeOccurrence> = read_json(&occurrences)?;
            let store = open_store(database_url.as_deref())?;
            let now = now.unwrap_or_else(Utc::now);
            let aggregates = run_aggregation(store.as_ref(), &config, &occurrences, now).await?;
            print_json(&aggregates)?;
        }
        Command::Migrate { database_url } => {
            let store = PgStore::connect(&database_url, 1).wrap_err("connecting to Postgres")?;
            tracing::info!("Running culprit migration...");
            store.migrate().await.map_err(|e| eyre::eyre!("{e:#}"))?;
            tracing::info!("Culprit migration completed.");
        }
    }

    if let Some(handle) = metrics {
        println!("{}", handle.render());
    }
    Ok(())
}
