//! CLI entry point: logging, settings resolution, command dispatch and
//! exit-code mapping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::Result;
use tracing::error;

use rushti::analyze::{AnalyzerConfig, analyze};
use rushti::cli::{Cli, Command, RunArgs};
use rushti::estimate::Estimator;
use rushti::lock::{LockError, session_tag};
use rushti::parser::{emit_structured, resolve_dag};
use rushti::remote::ClientFactory;
use rushti::remote::http::HttpClientFactory;
use rushti::runner::{RunController, RunnerError, WorkflowSource};
use rushti::settings::Settings;
use rushti::validate::{validate_remote, validate_structural};
use statstore::StatsStore;

fn setup_logging(verbose: bool) {
    let default = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default.into()))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let settings_path = cli.settings.clone();
    match cli.command {
        Command::Run(args) => run_command(settings_path.as_deref(), args, false).await,
        Command::Resume(args) => run_command(settings_path.as_deref(), args, true).await,
        Command::Validate { tasks, remote } => validate_command(settings_path.as_deref(), &tasks, remote).await,
        Command::Expand { tasks, out } => expand_command(settings_path.as_deref(), &tasks, out).await,
        Command::Analyze {
            tasks,
            runs,
            sensitivity,
            out,
        } => analyze_command(settings_path.as_deref(), &tasks, runs, sensitivity, out).await,
    }
}

fn http_factory(settings: &Settings) -> Arc<dyn ClientFactory> {
    let instances: HashMap<_, _> = settings.instances.clone().into_iter().collect();
    Arc::new(HttpClientFactory::new(instances))
}

fn load_settings(settings_path: Option<&Path>, source: &WorkflowSource, args: Option<&RunArgs>) -> Result<Settings> {
    let file_overlay = Settings::load_file(settings_path)?;
    let cli_overlay = args.map(RunArgs::overlay).unwrap_or_default();
    Ok(Settings::resolve(file_overlay, source.parsed.settings.clone(), cli_overlay))
}

async fn run_command(settings_path: Option<&Path>, args: RunArgs, resume: bool) -> Result<i32> {
    let source = WorkflowSource::read(&args.tasks)?;
    let settings = load_settings(settings_path, &source, Some(&args))?;
    let force = args.force;
    let factory = http_factory(&settings);

    let controller = RunController::new(settings, factory);
    match controller.run(source, resume, force).await {
        Ok(report) => Ok(report.exit_code()),
        Err(RunnerError::Lock(LockError::Timeout(waited))) => {
            error!("Could not acquire exclusive mode within {waited:?}");
            Ok(5)
        }
        Err(RunnerError::Lock(e)) => Err(e.into()),
        Err(RunnerError::Fatal(e)) => Err(e),
    }
}

async fn validate_command(settings_path: Option<&Path>, tasks: &Path, remote: bool) -> Result<i32> {
    let source = WorkflowSource::read(tasks)?;
    let settings = load_settings(settings_path, &source, None)?;
    let factory = http_factory(&settings);
    let tag = session_tag(&source.workflow, false);

    for warning in &source.parsed.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }

    let (dag, warnings) = resolve_dag(source.parsed, factory.as_ref(), &tag).await?;
    for warning in warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }

    let mut report = validate_structural(&dag);
    if remote {
        report.merge(validate_remote(&dag, factory.as_ref(), &tag).await);
    }

    for warning in &report.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    for error in &report.errors {
        println!("{} {}", "error:".red(), error);
    }

    if report.is_ok() {
        println!("{} {} tasks across {} instance(s)", "valid:".green(), dag.len(), dag.instances().len());
        Ok(0)
    } else {
        Ok(1)
    }
}

async fn expand_command(settings_path: Option<&Path>, tasks: &Path, out: Option<PathBuf>) -> Result<i32> {
    let source = WorkflowSource::read(tasks)?;
    let settings_overlay = source.parsed.settings.clone();
    let resolved = load_settings(settings_path, &source, None)?;
    let factory = http_factory(&resolved);
    let tag = session_tag(&source.workflow, false);
    let workflow = source.workflow.clone();

    let (dag, warnings) = resolve_dag(source.parsed, factory.as_ref(), &tag).await?;
    for warning in warnings {
        eprintln!("{} {}", "warning:".yellow(), warning);
    }

    let payload = emit_structured(dag.tasks(), Some(&workflow), settings_overlay.as_ref());
    match out {
        Some(path) => std::fs::write(&path, payload)?,
        None => println!("{payload}"),
    }
    Ok(0)
}

async fn analyze_command(
    settings_path: Option<&Path>,
    tasks: &Path,
    runs: usize,
    sensitivity: f64,
    out: Option<PathBuf>,
) -> Result<i32> {
    let source = WorkflowSource::read(tasks)?;
    let mut settings_overlay = source.parsed.settings.clone().unwrap_or_default();
    let settings = load_settings(settings_path, &source, None)?;
    let factory = http_factory(&settings);
    let tag = session_tag(&source.workflow, false);
    let workflow = source.workflow.clone();

    let (dag, _) = resolve_dag(source.parsed, factory.as_ref(), &tag).await?;

    let store = Arc::new(StatsStore::open(settings.stats_db_path())?);
    let estimator = Estimator::new(store.clone(), settings.estimator.clone());
    let estimates = estimator.costs(&dag);
    let history = store.recent_runs(&workflow, runs)?;

    let analysis = analyze(
        dag.tasks(),
        &estimates,
        &history,
        Some(settings.max_workers),
        &AnalyzerConfig { sensitivity },
    );

    for note in &analysis.notes {
        eprintln!("{} {}", "note:".cyan(), note);
    }
    if let Some(workers) = analysis.recommended_workers {
        settings_overlay.max_workers = Some(workers);
    }

    let payload = emit_structured(&analysis.tasks, Some(&workflow), Some(&settings_overlay));
    match out {
        Some(path) => std::fs::write(&path, payload)?,
        None => println!("{payload}"),
    }
    Ok(0)
}
