//! `kubelab down`.

use anyhow::Result;
use clap::Args;

use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::{CommandContext, CommandStatus};

#[derive(Debug, Args)]
pub struct DownCommand {}

impl DownCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<CommandStatus> {
        let report = ctx.orchestrator()?.down().await?;

        match ctx.format {
            OutputFormat::Json => print_single(&report),
            OutputFormat::Table if report.destroyed.is_empty() => {
                print_info("Nothing to destroy")
            }
            OutputFormat::Table => print_success(&format!(
                "Destroyed {} machine(s): {}",
                report.destroyed.len(),
                report.destroyed.join(", ")
            )),
        }

        Ok(CommandStatus::Success)
    }
}
