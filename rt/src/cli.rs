//! CLI command definitions and subcommands.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::scheduler::OrderingPolicy;
use crate::settings::SettingsOverlay;

/// rushti - parallel orchestrator for remote analytical processes
#[derive(Parser)]
#[command(
    name = "rushti",
    about = "Run workflows of remote processes in parallel, respecting dependencies",
    version
)]
pub struct Cli {
    /// Path to the settings file (default: rushti.yml, then
    /// ~/.config/rushti/rushti.yml)
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by `run` and `resume`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the task file
    #[arg(long)]
    pub tasks: PathBuf,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub max_workers: Option<u32>,

    /// Retries per task on transient remote failures
    #[arg(long)]
    pub retries: Option<u32>,

    /// Legacy flag, accepted and ignored
    #[arg(long, hide = true)]
    pub mode: Option<String>,

    /// Write the per-task result export to this path
    #[arg(long)]
    pub result: Option<PathBuf>,

    /// Require that no other tagged run overlaps this run's instances
    #[arg(long)]
    pub exclusive: bool,

    /// Override checkpoint-mismatch and unsafe-resume refusals
    #[arg(long)]
    pub force: bool,

    /// Ready-queue ordering policy (longest_first | shortest_first)
    #[arg(long, value_parser = parse_policy)]
    pub optimize: Option<OrderingPolicy>,

    /// Disable periodic checkpointing for this run
    #[arg(long)]
    pub no_checkpoint: bool,
}

fn parse_policy(s: &str) -> Result<OrderingPolicy, String> {
    s.parse()
}

impl RunArgs {
    /// The highest-precedence settings overlay.
    pub fn overlay(&self) -> SettingsOverlay {
        SettingsOverlay {
            max_workers: self.max_workers,
            retries: self.retries,
            optimize: self.optimize,
            checkpoint: self.no_checkpoint.then_some(false),
            exclusive: self.exclusive.then_some(true),
            result: self.result.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a workflow
    Run(RunArgs),

    /// Resume a workflow from its checkpoint
    Resume(RunArgs),

    /// Validate a workflow without executing it
    Validate {
        /// Path to the task file
        #[arg(long)]
        tasks: PathBuf,

        /// Additionally probe each (instance, process) pair remotely
        #[arg(long)]
        remote: bool,
    },

    /// Apply parametric expansion and emit the structured form
    Expand {
        /// Path to the task file
        #[arg(long)]
        tasks: PathBuf,

        /// Output path (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Rewrite a workflow with contention-aware edges and a worker
    /// recommendation
    Analyze {
        /// Path to the task file
        #[arg(long)]
        tasks: PathBuf,

        /// Run history window for the sweet-spot check
        #[arg(long, default_value = "30")]
        runs: usize,

        /// IQR multiplier for the heavy-group fence
        #[arg(long, default_value = "10.0")]
        sensitivity: f64,

        /// Output path (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "rushti",
            "run",
            "--tasks",
            "nightly.txt",
            "--max-workers",
            "8",
            "--retries",
            "2",
            "--exclusive",
            "--optimize",
            "longest_first",
            "--no-checkpoint",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.tasks, PathBuf::from("nightly.txt"));
        let overlay = args.overlay();
        assert_eq!(overlay.max_workers, Some(8));
        assert_eq!(overlay.retries, Some(2));
        assert_eq!(overlay.optimize, Some(OrderingPolicy::LongestFirst));
        assert_eq!(overlay.checkpoint, Some(false));
        assert_eq!(overlay.exclusive, Some(true));
    }

    #[test]
    fn test_unset_flags_defer_to_lower_precedence() {
        let cli = Cli::parse_from(["rushti", "run", "--tasks", "t.txt"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let overlay = args.overlay();
        assert_eq!(overlay.max_workers, None);
        assert_eq!(overlay.checkpoint, None, "absent flag must not force checkpointing on");
        assert_eq!(overlay.exclusive, None);
    }

    #[test]
    fn test_legacy_mode_flag_accepted() {
        let cli = Cli::parse_from(["rushti", "run", "--tasks", "t.txt", "--mode", "norm"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode.as_deref(), Some("norm"));
    }

    #[test]
    fn test_parse_resume_and_validate() {
        let cli = Cli::parse_from(["rushti", "resume", "--tasks", "t.txt", "--force"]);
        assert!(matches!(cli.command, Command::Resume(args) if args.force));

        let cli = Cli::parse_from(["rushti", "validate", "--tasks", "t.txt", "--remote"]);
        assert!(matches!(cli.command, Command::Validate { remote: true, .. }));
    }

    #[test]
    fn test_parse_analyze_defaults() {
        let cli = Cli::parse_from(["rushti", "analyze", "--tasks", "t.txt"]);
        let Command::Analyze { runs, sensitivity, out, .. } = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(runs, 30);
        assert!((sensitivity - 10.0).abs() < 1e-9);
        assert!(out.is_none());
    }

    #[test]
    fn test_bad_policy_rejected() {
        let result = Cli::try_parse_from(["rushti", "run", "--tasks", "t.txt", "--optimize", "fastest"]);
        assert!(result.is_err());
    }
}
