//! qaflow
//!
//! Command line front end: starts a guarded exploration and testing run
//! against a web application and answers its questions on the terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use qaflow_browser::PlaywrightDriver;
use qaflow_common::{AuthConfig, Database, RunState};
use qaflow_engine::artifacts::REPORT_DOC;
use qaflow_engine::config::StoreBackend;
use qaflow_engine::{
    ArtifactStore, Orchestrator, RunRequest, RunSnapshot, RunStore, SqliteRunStore,
    TEST_SCOPE_VARIABLE,
};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{error, info};

mod config;
mod interactive;
mod logging;

use config::Overrides;
use interactive::Console;

#[derive(Parser)]
#[command(name = "qaflow")]
#[command(about = "Interactive, guarded exploration and testing of web applications")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "QAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// State directory (database, artifacts)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore and test an application
    Run(RunArgs),

    /// List recorded runs
    Runs,

    /// Show a recorded run
    Show {
        run_id: String,
    },

    /// Delete artifacts older than the retention window
    Purge,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Base URL of the application under test
    #[arg(short, long)]
    url: String,

    /// Target environment name
    #[arg(short, long, default_value = "staging")]
    env: String,

    /// Flow id; defaults to the URL host
    #[arg(short, long)]
    flow: Option<String>,

    /// Run variable as key=value (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// Answer the scope question up front (`all` or a comma list)
    #[arg(long)]
    scope: Option<String>,

    /// Login username
    #[arg(long, env = "QAFLOW_USERNAME")]
    user: Option<String>,

    /// Login password
    #[arg(long, env = "QAFLOW_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Crawl budget override
    #[arg(long)]
    max_pages: Option<usize>,

    /// Keep run records in memory only
    #[arg(long)]
    memory: bool,

    /// Disable AI-assisted generation
    #[arg(long)]
    no_ai: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug, cli.log_json);

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut overrides = Overrides {
        store: cli.store.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Run(args) => {
            overrides.memory_store = args.memory;
            overrides.headed = args.headed;
            overrides.max_pages = args.max_pages;
            overrides.no_ai = args.no_ai;
            let engine_config = config::resolve(&config_path, &overrides)?;
            run(engine_config, args).await
        }
        Commands::Runs => {
            let engine_config = config::resolve(&config_path, &overrides)?;
            list_runs(&open_store(&engine_config.db_path())?)
        }
        Commands::Show { run_id } => {
            let engine_config = config::resolve(&config_path, &overrides)?;
            let store = open_store(&engine_config.db_path())?;
            match store.load(&run_id)? {
                Some(snapshot) => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    Ok(())
                }
                None => anyhow::bail!("no run {}", run_id),
            }
        }
        Commands::Purge => {
            let engine_config = config::resolve(&config_path, &overrides)?;
            let artifacts = ArtifactStore::new(engine_config.artifact_dir()).await?;
            let retention = Duration::from_secs(engine_config.artifacts.retention_days * 86_400);
            let purged = artifacts.purge_expired(retention).await?;
            if engine_config.store.backend == StoreBackend::Sqlite {
                let store = open_store(&engine_config.db_path())?;
                for run_id in &purged {
                    store.delete(run_id)?;
                }
            }
            println!("Purged {} run(s)", purged.len());
            Ok(())
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!("{} exists (use --force to overwrite)", config_path.display());
            }
            qaflow_engine::EngineConfig::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

fn open_store(path: &std::path::Path) -> anyhow::Result<SqliteRunStore> {
    let db = Database::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(SqliteRunStore::new(db))
}

fn list_runs(store: &SqliteRunStore) -> anyhow::Result<()> {
    let runs = store.list()?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    println!("{:<38} {:<24} {:<22} {}", "RUN", "FLOW", "STATE", "UPDATED");
    for run in runs {
        let updated = chrono::DateTime::from_timestamp(run.updated_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!("{:<38} {:<24} {:<22} {}", run.run_id, run.flow_id, run.state.as_str(), updated);
    }
    Ok(())
}

async fn run(engine_config: qaflow_engine::EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    info!("qaflow v{}", env!("CARGO_PKG_VERSION"));

    let driver = PlaywrightDriver::new(engine_config.browser.clone());
    driver.verify().await.context("Playwright is not usable")?;
    let orchestrator = Orchestrator::new(engine_config, Arc::new(driver)).await?;

    let mut variables = config::parse_variables(&args.vars)?;
    if let Some(scope) = args.scope {
        variables.insert(TEST_SCOPE_VARIABLE.to_string(), Value::String(scope));
    }
    let request = RunRequest {
        base_url: args.url,
        environment: args.env,
        flow_id: args.flow,
        variables,
        auth: AuthConfig {
            username: args.user,
            password: args.password,
            ..Default::default()
        },
    };

    let run_id = orchestrator.create_run(request)?;
    println!("Run {}", run_id);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            let _ = stop_tx.send(true);
        }
        // Keep the sender alive so the run is not treated as interrupted
        std::future::pending::<()>().await;
    });

    let mut console = Console::new(BufReader::new(tokio::io::stdin()), std::io::stdout());
    let snapshot = interactive::drive(&orchestrator, &run_id, &mut console, &mut stop_rx).await?;
    print_outcome(&orchestrator, &snapshot).await;

    match snapshot.state {
        RunState::Completed => Ok(()),
        state => anyhow::bail!("run {} ended in {}", run_id, state),
    }
}

async fn print_outcome(orchestrator: &Orchestrator, snapshot: &RunSnapshot) {
    println!();
    println!("State: {}", snapshot.state);
    if let Some(failure) = &snapshot.failure {
        println!("Failure ({:?} at {}): {}", failure.kind, failure.state, failure.message);
    }

    match orchestrator.fetch_artifact(&snapshot.run_id, REPORT_DOC).await {
        Ok(report) => {
            let totals = &report["totals"];
            println!(
                "Tests: {} total, {} passed, {} failed",
                totals["total"], totals["passed"], totals["failed"]
            );
        }
        Err(e) if snapshot.state == RunState::Completed => error!("Report unavailable: {}", e),
        Err(_) => {}
    }

    if let Ok(artifacts) = orchestrator.artifacts(&snapshot.run_id).await {
        for artifact in artifacts {
            println!("  {}", artifact.path.display());
        }
    }
}
