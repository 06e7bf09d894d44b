//! CLI command definitions and handling
//!
//! Uses `clap` derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// assetflow - front-end asset build orchestrator
#[derive(Parser, Debug)]
#[command(name = "assetflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to assetflow.toml config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory to run in
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Enable debug-only stages (source maps and other diagnostics)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Abort on the first failure (also enabled by CI, EXIT_ON_ERRORS, ASSETFLOW_STRICT)
    #[arg(long, global = true, conflicts_with = "lenient")]
    pub strict: bool,

    /// Keep going after failures even in CI
    #[arg(long, global = true)]
    pub lenient: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Task to run (defaults to `settings.default`)
    pub task: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more tasks
    Run {
        /// Tasks to run
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Show execution plan without running
        #[arg(long)]
        dry_run: bool,
    },

    /// List available tasks
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: ListFormat,

        /// Show task dependencies
        #[arg(long)]
        deps: bool,
    },

    /// Show task dependency graph
    Graph {
        /// Task to show graph for (all tasks if not specified)
        task: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: GraphFormat,
    },

    /// Print the files a named pattern set matches
    Files {
        /// Name of a `[patterns.*]` entry
        pattern_set: String,
    },

    /// Initialize a new assetflow.toml
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Validate assetflow.toml configuration
    Check,
}

#[derive(ValueEnum, Clone, Debug, Default)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
    Plain,
}

#[derive(ValueEnum, Clone, Debug, Default)]
pub enum GraphFormat {
    #[default]
    Text,
    Dot,
    Json,
}

impl Cli {
    /// Get the effective command, treating a bare task name as `run <task>`
    pub fn effective_command(&self) -> EffectiveCommand<'_> {
        match (&self.command, &self.task) {
            (Some(cmd), _) => EffectiveCommand::Subcommand(cmd),
            (None, Some(task)) => EffectiveCommand::RunTask(task),
            (None, None) => EffectiveCommand::RunDefault,
        }
    }
}

pub enum EffectiveCommand<'a> {
    Subcommand(&'a Commands),
    RunTask(&'a str),
    RunDefault,
}
