//! Inspection CLI for the rushti stats store.

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::Result;
use statstore::StatsStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "statstore", about = "Inspect rushti execution history")]
struct Cli {
    /// Path to the stats database
    #[arg(long, default_value = "data/rushti_stats.sqlite")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recent run summaries for a workflow
    Runs {
        /// Workflow name
        #[arg(long)]
        workflow: String,

        /// Number of runs to show
        #[arg(short = 'k', long, default_value = "10")]
        count: usize,
    },

    /// Recent successful durations for a task signature
    Tasks {
        /// Task signature (instance|process|k=v|...)
        #[arg(long)]
        signature: String,

        /// Number of samples to show
        #[arg(short = 'k', long, default_value = "10")]
        count: usize,
    },
}

fn fmt_ts(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = StatsStore::open(&cli.db)?;

    match cli.command {
        Command::Runs { workflow, count } => {
            let runs = store.recent_runs(&workflow, count)?;
            if runs.is_empty() {
                println!("No runs recorded for workflow '{workflow}'");
                return Ok(());
            }
            println!(
                "{:<20} {:<20} {:>8} {:>6} {:>5} {:>5} {:>5} {:>5} {:>9}",
                "run", "started", "workers", "total", "ok", "fail", "skip", "canc", "elapsed"
            );
            for r in runs {
                let verdict = if r.success { "ok".green() } else { "fail".red() };
                println!(
                    "{:<20} {:<20} {:>8} {:>6} {:>5} {:>5} {:>5} {:>5} {:>8.1}s  {}",
                    r.run_id,
                    fmt_ts(r.started_at),
                    r.max_workers,
                    r.total,
                    r.succeeded,
                    r.failed,
                    r.skipped,
                    r.cancelled,
                    r.elapsed_secs(),
                    verdict,
                );
            }
        }
        Command::Tasks { signature, count } => {
            let samples = store.recent(&signature, count)?;
            if samples.is_empty() {
                println!("No successful executions recorded for '{signature}'");
                return Ok(());
            }
            println!("{:<20} {:>12}", "started", "duration");
            for s in samples {
                println!("{:<20} {:>11.1}s", fmt_ts(s.started_at), s.duration_secs);
            }
        }
    }

    Ok(())
}
