//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use kubelab_orchestrator::local::StoreError;
use kubelab_orchestrator::{ConfigError, OrchestratorError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(err) = err.downcast_ref::<OrchestratorError>() {
        return match err {
            OrchestratorError::ResourceExhausted { .. } => {
                Some("Lower `--workers` or `topology.memory_mb` to fit the host.")
            }
            OrchestratorError::ProviderUnavailable { .. } => {
                Some("The provider kept failing; check it is running and retry `kubelab up`.")
            }
            OrchestratorError::SpecConflict { .. } => {
                Some("The topology changed since the last `up`. Run `kubelab down` first.")
            }
            OrchestratorError::IncompleteTopology(_) => {
                Some("Run `kubelab up` to finish provisioning, or `kubelab down` to start over.")
            }
            OrchestratorError::Teardown { .. } => Some("Run `kubelab down` again to retry."),
            OrchestratorError::Config(_) | OrchestratorError::InvalidSpec(_) => {
                Some("Check the topology section of your config file.")
            }
            _ => None,
        };
    }

    if err.downcast_ref::<ConfigError>().is_some() {
        return Some("See `kubelab --help` for config file discovery.");
    }

    if let Some(StoreError::Corrupt { .. }) = err.downcast_ref::<StoreError>() {
        return Some("Remove the state file, or point `--state-dir` elsewhere.");
    }

    if err.downcast_ref::<CliError>().is_some() {
        return Some("Pass an existing file to `--config` or unset KUBELAB_CONFIG.");
    }

    None
}
