//! `routeload` CLI subcommands.
//!
//! Provides `run` (execute a load test) and `init` (generate starter config).

mod init;
mod run;

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Config file looked up by `run` and written by `init`.
pub const DEFAULT_CONFIG_FILE: &str = "routeload.toml";

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test against a routing service
    ///
    /// Executes the staged ramp defined in routeload.toml (or a custom config
    /// path). Prints a summary to stdout and writes a JSON summary to the
    /// configured `summary_path`.
    Run(RunArgs),

    /// Generate a starter routeload.toml
    Init {
        /// Where to write the config (default: ./routeload.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

/// Options for `routeload run`.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Path to config file (default: auto-discover routeload.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Routing service base URL (overrides config)
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Per-request timeout in milliseconds (overrides config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Target iteration period in milliseconds (overrides config)
    #[arg(long)]
    pub period_ms: Option<u64>,

    /// Write the JSON summary to this path (overrides config)
    #[arg(long)]
    pub summary_export: Option<PathBuf>,

    /// Disable JSON summary output
    #[arg(long)]
    pub no_report: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Hide the live progress line
    #[arg(long, short)]
    pub quiet: bool,
}

impl Command {
    /// Execute the selected subcommand and return the process exit code.
    pub fn execute(self) -> Result<ExitCode> {
        match self {
            Command::Run(args) => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(args))
            },
            Command::Init { path, force } => {
                init::execute_init(path, force)?;
                Ok(ExitCode::SUCCESS)
            },
        }
    }
}
