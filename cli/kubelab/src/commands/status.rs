//! `kubelab status`.

use anyhow::Result;
use clap::Args;
use kubelab_orchestrator::ProvisionedMachine;
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::{CommandContext, CommandStatus};

#[derive(Debug, Args)]
pub struct StatusCommand {}

#[derive(Debug, Serialize, Tabled)]
struct MachineRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Address")]
    address: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Memory (MB)")]
    memory_mb: u32,

    #[tabled(rename = "vCPUs")]
    vcpus: u32,

    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<ProvisionedMachine> for MachineRow {
    fn from(machine: ProvisionedMachine) -> Self {
        Self {
            name: machine.spec.name,
            role: machine.spec.role.to_string(),
            address: machine.spec.ip.to_string(),
            state: machine.state.to_string(),
            memory_mb: machine.spec.memory_mb,
            vcpus: machine.spec.vcpus,
            id: machine.id.short(),
            created_at: machine.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<CommandStatus> {
        let machines = ctx.orchestrator()?.status().await?;
        let rows: Vec<MachineRow> = machines.into_iter().map(MachineRow::from).collect();
        print_output(&rows, ctx.format);
        Ok(CommandStatus::Success)
    }
}
