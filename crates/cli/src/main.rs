//! `ingest-pipelines` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: build declarations and report schema-alignment findings.
//! - `render`: print the operations a run would execute for a logical date.
//! - `run`: run one pipeline in process for a logical date.
//! - `history`: list recorded runs of a pipeline.
//! - `release`: free the slot of a run left `running` by a runner that died.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use db::models::RunStatus;
use db::{MemoryRunStore, PgRunStore, RunStore};
use engine::{
    HandlerRegistry, PipelineDeclaration, PipelineRunner, PipelineSpec, RenderContext, RunnerConfig,
    Variables,
};
use nodes::{LocalObjectStore, MemoryWarehouse};

#[derive(Parser)]
#[command(
    name = "ingest-pipelines",
    about = "Batch ingestion pipelines: download, transform, load, archive",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate one declaration file, or every declaration under a directory.
    Validate {
        path: PathBuf,
        /// Variables JSON file.
        #[arg(long)]
        vars: Option<PathBuf>,
    },
    /// Print every task's rendered operation in execution order.
    Render {
        /// Path to the pipeline declaration JSON file.
        path: PathBuf,
        #[arg(long)]
        vars: Option<PathBuf>,
        /// Logical date (YYYY-MM-DD), today if omitted.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run a pipeline in process.
    Run {
        path: PathBuf,
        #[arg(long)]
        vars: Option<PathBuf>,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Record run history in Postgres; kept in memory when unset.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// List recent runs of a pipeline with their task states.
    History {
        /// `dataset.pipeline`
        pipeline: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Mark a run whose runner died as cancelled so the pipeline can run again.
    Release {
        run_id: Uuid,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path, vars } => {
            let variables = load_variables(vars.as_deref())?;
            validate(&path, &variables)
        }
        Command::Render { path, vars, date } => {
            let variables = load_variables(vars.as_deref())?;
            let spec = load_pipeline(&path, &variables)?;
            render(&spec, &variables, date.unwrap_or_else(today))
        }
        Command::Run {
            path,
            vars,
            date,
            database_url,
        } => {
            let variables = load_variables(vars.as_deref())?;
            let spec = load_pipeline(&path, &variables)?;
            run(&spec, variables, date.unwrap_or_else(today), database_url).await
        }
        Command::History {
            pipeline,
            limit,
            database_url,
        } => history(&pipeline, limit, &database_url).await,
        Command::Release {
            run_id,
            database_url,
        } => release(run_id, &database_url).await,
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(())
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn load_variables(path: Option<&Path>) -> anyhow::Result<Variables> {
    match path {
        Some(path) => Variables::from_path(path)
            .with_context(|| format!("cannot load variables from {}", path.display())),
        None => Ok(Variables::new()),
    }
}

fn load_pipeline(path: &Path, variables: &Variables) -> anyhow::Result<PipelineSpec> {
    let declaration = PipelineDeclaration::from_path(path)
        .with_context(|| format!("cannot read declaration {}", path.display()))?;
    engine::build_pipeline(declaration, variables)
        .with_context(|| format!("invalid declaration {}", path.display()))
}

// ---------------------------------------------------------------------------
// Sub-commands
// ---------------------------------------------------------------------------

fn validate(path: &Path, variables: &Variables) -> anyhow::Result<()> {
    let declarations = if path.is_dir() {
        PipelineDeclaration::load_dir(path)
            .with_context(|| format!("cannot read declarations under {}", path.display()))?
    } else {
        let declaration = PipelineDeclaration::from_path(path)
            .with_context(|| format!("cannot read declaration {}", path.display()))?;
        vec![(path.to_path_buf(), declaration)]
    };

    let mut failed = 0;
    for (file, declaration) in declarations {
        let key = declaration.key();
        match engine::build_pipeline(declaration, variables) {
            Ok(spec) => {
                println!("ok      {key}: {}", spec.topological_order().join(" -> "));
                for finding in engine::lint(&spec) {
                    warn!(pipeline = %key, "{finding}");
                }
            }
            Err(e) => {
                failed += 1;
                println!("invalid {key} ({}): {e}", file.display());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} declaration(s) failed validation");
    }
    Ok(())
}

fn render(
    spec: &PipelineSpec,
    variables: &Variables,
    logical_date: NaiveDate,
) -> anyhow::Result<()> {
    let ctx = RenderContext::new(logical_date, variables);

    let mut rendered = Vec::with_capacity(spec.tasks().len());
    for task_id in spec.topological_order() {
        let Some(task) = spec.task(task_id) else {
            continue;
        };
        let operation = task
            .render(&ctx)
            .with_context(|| format!("cannot render task '{task_id}'"))?;
        let operation = serde_json::to_value(&operation)?;
        rendered.push(json!({ "task_id": task_id, "operation": operation }));
    }

    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn run(
    spec: &PipelineSpec,
    variables: Variables,
    logical_date: NaiveDate,
    database_url: Option<String>,
) -> anyhow::Result<()> {
    let config = RunnerConfig::from_env()?;
    config.validate()?;

    let store: Arc<dyn RunStore> = match database_url {
        Some(url) => {
            let pool = db::pool::create_pool(&url, 5)
                .await
                .context("failed to connect to database")?;
            Arc::new(PgRunStore::new(pool))
        }
        None => Arc::new(MemoryRunStore::new()),
    };

    let objects = Arc::new(LocalObjectStore::new(config.object_root.clone()));
    let registry = HandlerRegistry::builtin(&config, objects, Arc::new(MemoryWarehouse::new()));
    let runner = PipelineRunner::new(store, registry, Arc::new(variables), config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = runner.run(spec, logical_date, cancel).await?;

    println!(
        "run {} of {} for {}: {}",
        report.run_id, report.pipeline, report.logical_date, report.status
    );
    for task in &report.tasks {
        match &task.error {
            Some(error) => {
                println!("  {:<48} {:<16} {error}", task.task_id, task.status.to_string())
            }
            None => println!("  {:<48} {}", task.task_id, task.status),
        }
    }

    if report.status != RunStatus::Succeeded {
        bail!("run {} finished {}", report.run_id, report.status);
    }
    Ok(())
}

async fn history(pipeline: &str, limit: i64, database_url: &str) -> anyhow::Result<()> {
    let pool = db::pool::create_pool(database_url, 2)
        .await
        .context("failed to connect to database")?;
    let store = PgRunStore::new(pool);

    let runs = store.list_runs(pipeline, limit).await?;
    if runs.is_empty() {
        println!("no runs recorded for {pipeline}");
        return Ok(());
    }

    for run in runs {
        println!(
            "{} {} {:<10} started {}",
            run.id,
            run.logical_date,
            run.status,
            run.started_at.to_rfc3339()
        );
        for task in store.task_runs(run.id).await? {
            println!(
                "  {:<48} {:<16} attempts={}",
                task.task_id, task.status, task.attempts
            );
        }
    }
    Ok(())
}

async fn release(run_id: Uuid, database_url: &str) -> anyhow::Result<()> {
    let pool = db::pool::create_pool(database_url, 2)
        .await
        .context("failed to connect to database")?;
    let store = PgRunStore::new(pool);

    match store.release_run(run_id).await {
        Ok(()) => {
            info!(%run_id, "run released");
            Ok(())
        }
        Err(db::DbError::NotFound) => bail!("run {run_id} does not exist or is not running"),
        Err(e) => Err(e.into()),
    }
}
