use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use reel_sync::{Engine, EngineConfig, RunMode, RunReport};
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "reel_cli=info,reel_sync=info,reel_storage=info,reel_adapters=info";

/// Exit status of a run whose store rejected writes the engine believed safe.
const INVARIANT_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "reel-cli")]
#[command(about = "Reel picks consolidation engine")]
struct Cli {
    /// Workspace holding sources.yaml, rules/ and fixtures/ (overrides REEL_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RunFlags {
    /// Classify everything and write the report without touching the store.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every enabled source into the catalog.
    Ingest {
        #[command(flatten)]
        run: RunFlags,
        /// Never create participants or movies; only picks for known ones.
        #[arg(long)]
        no_create: bool,
    },
    /// Backfill empty notes and scores on existing picks.
    Reviews {
        #[command(flatten)]
        run: RunFlags,
    },
    /// Show duplicate-participant groups without merging them.
    Plan,
    /// Merge duplicate participants.
    Consolidate {
        #[command(flatten)]
        run: RunFlags,
    },
    /// Create the catalog tables in DATABASE_URL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(workspace) = cli.workspace {
        config = config.with_workspace_root(workspace);
    }

    let report = match cli.command {
        Commands::Migrate => {
            reel_sync::migrate(&config).await?;
            println!("migrate complete");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Plan => {
            let engine = Engine::connect(config).await?;
            let (plan, report) = engine.plan().await?;
            for group in &plan.groups {
                let names = group
                    .members
                    .iter()
                    .map(|m| format!("{} ({})", m.display_name, m.id))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{} keep={} members=[{}]", group.key, group.keep_id, names);
            }
            println!(
                "plan: groups={} deletions={} singletons={}",
                plan.groups.len(),
                plan.delete_count(),
                plan.singletons
            );
            finish(&engine, report)?
        }
        Commands::Ingest { run, no_create } => {
            let engine = Engine::connect(config).await?;
            let mut options = engine.ingest_options();
            if no_create {
                options.create_participants = false;
                options.create_items = false;
            }
            let report = engine
                .ingest(RunMode::from_dry_run(run.dry_run), options)
                .await?;
            finish(&engine, report)?
        }
        Commands::Reviews { run } => {
            let engine = Engine::connect(config).await?;
            let report = engine
                .backfill_reviews(RunMode::from_dry_run(run.dry_run))
                .await?;
            finish(&engine, report)?
        }
        Commands::Consolidate { run } => {
            let engine = Engine::connect(config).await?;
            let report = engine
                .consolidate(RunMode::from_dry_run(run.dry_run))
                .await?;
            finish(&engine, report)?
        }
    };

    if report.has_invariant_violations() {
        error!(
            run_id = %report.run_id,
            violations = report.invariant_violations,
            "store rejected writes during the run"
        );
        return Ok(ExitCode::from(INVARIANT_EXIT));
    }
    Ok(ExitCode::SUCCESS)
}

fn finish(engine: &Engine, report: RunReport) -> Result<RunReport> {
    let written = engine.write_report(&report)?;
    let counts = report
        .counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(category, count)| format!("{}={}", category.as_str(), count))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{} complete: run_id={} applied={} {} reports={}",
        report.operation,
        report.run_id,
        report.mutation_applied,
        counts,
        written.dir.display()
    );
    Ok(report)
}
