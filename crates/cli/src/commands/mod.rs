// CLI subcommand dispatch.
//
// Every command opens the stores it needs straight from the data
// directory. A running daemon picks the writes up through its reconciler.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Subcommand;
use thiserror::Error;
use tracing::debug;
use workloop_daemon::config::DaemonConfig;

use crate::output::OutputFormat;

pub mod autorun;
pub mod role;
pub mod work;

#[derive(Subcommand)]
pub enum Command {
    /// Create, inspect, and finish work items
    #[command(subcommand)]
    Work(work::WorkCommand),
    /// Manage agent roles (named system prompts)
    #[command(subcommand)]
    Role(role::RoleCommand),
    /// Turn automatic work pickup on or off
    #[command(subcommand)]
    Autorun(autorun::AutorunCommand),
}

/// A command line that parsed but asks for something that makes no sense.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Where a command reads and writes, and how it prints.
#[derive(Debug, Clone)]
pub struct Context {
    pub data_dir: PathBuf,
    pub format: OutputFormat,
}

impl Context {
    pub fn new(data_dir: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self { data_dir: data_dir.into(), format }
    }

    /// `--data-dir` wins; otherwise the environment and config file decide.
    pub fn resolve(flag: Option<PathBuf>, format: OutputFormat) -> anyhow::Result<Self> {
        let data_dir = match flag {
            Some(dir) => dir,
            None => DaemonConfig::load()
                .context("failed to load ~/.workloop/config.toml")?
                .resolve_data_dir(None)
                .context("failed to resolve data directory")?,
        };
        debug!(data_dir = %data_dir.display(), "resolved data directory");
        Ok(Self::new(data_dir, format))
    }
}

pub fn run(ctx: &Context, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Work(cmd) => work::run(ctx, cmd),
        Command::Role(cmd) => role::run(ctx, cmd),
        Command::Autorun(cmd) => autorun::run(ctx, cmd),
    }
}

/// Human-readable timestamp used in listings.
pub(crate) fn short_time(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}
