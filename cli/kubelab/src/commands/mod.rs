//! CLI commands.

mod down;
mod inventory;
mod plan;
mod status;
mod up;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use kubelab_orchestrator::local::{LocalExecutor, LocalProvider, LocalStore};
use kubelab_orchestrator::{ClusterConfig, Orchestrator};
use tracing::debug;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Config file picked up from the working directory when `--config` is not set.
const DEFAULT_CONFIG_FILE: &str = "kubelab.toml";

/// kubelab - declarative multi-node VM lab clusters.
#[derive(Debug, Parser)]
#[command(name = "kubelab")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cluster config file (TOML).
    #[arg(long, global = true, env = "KUBELAB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding cluster state.
    #[arg(long, global = true, env = "KUBELAB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision and converge the cluster.
    Up(up::UpCommand),

    /// Destroy every machine of the cluster.
    Down(down::DownCommand),

    /// Show provisioned machines.
    Status(status::StatusCommand),

    /// Show the machines `up` would create, without creating them.
    Plan(plan::PlanCommand),

    /// Show the inventory of provisioned hosts.
    Inventory(inventory::InventoryCommand),

    /// Show CLI version.
    Version,
}

/// How a successful command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Degraded,
}

impl CommandStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Degraded => 1,
        }
    }
}

impl Cli {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<CommandStatus> {
        if let Commands::Version = self.command {
            println!("kubelab {}", env!("CARGO_PKG_VERSION"));
            return Ok(CommandStatus::Success);
        }

        let ctx = CommandContext {
            config: load_config(self.config.as_deref())?,
            state_dir: resolve_state_dir(self.state_dir)?,
            format: self.format,
        };
        debug!(state_dir = %ctx.state_dir.display(), cluster = %ctx.config.name, "Resolved context");

        match self.command {
            Commands::Up(cmd) => cmd.run(ctx).await,
            Commands::Down(cmd) => cmd.run(ctx).await,
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::Plan(cmd) => cmd.run(ctx),
            Commands::Inventory(cmd) => cmd.run(ctx).await,
            Commands::Version => Ok(CommandStatus::Success),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: ClusterConfig,
    pub state_dir: PathBuf,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Apply a `--workers` override and re-validate.
    pub fn with_workers(mut self, workers: Option<u32>) -> Result<Self> {
        if let Some(workers) = workers {
            self.config.topology.worker_count = workers;
            self.config.validate()?;
        }
        Ok(self)
    }

    /// Orchestrator over the local state directory.
    pub fn orchestrator(&self) -> Result<Orchestrator<LocalProvider, LocalExecutor>> {
        let store = Arc::new(LocalStore::open(&self.state_dir)?);
        let provider = Arc::new(LocalProvider::new(Arc::clone(&store)));
        let executor = Arc::new(LocalExecutor::new(store));
        Ok(Orchestrator::new(self.config.clone(), provider, executor))
    }
}

fn load_config(path: Option<&Path>) -> Result<ClusterConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(CliError::ConfigNotFound(path.to_path_buf()).into());
            }
            Ok(ClusterConfig::load(path)?)
        }
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                ClusterConfig::load(fallback)
                    .with_context(|| format!("Failed to load {DEFAULT_CONFIG_FILE}"))
            } else {
                Ok(ClusterConfig::default())
            }
        }
    }
}

fn resolve_state_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }

    ProjectDirs::from("io", "kubelab", "kubelab")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not determine state directory; pass --state-dir"))
}
