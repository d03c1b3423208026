//! `kubelab plan`.

use anyhow::Result;
use clap::Args;
use kubelab_orchestrator::{ResourceSpec, Topology};
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::{CommandContext, CommandStatus};

#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Number of worker nodes (overrides the config file).
    #[arg(long)]
    workers: Option<u32>,
}

#[derive(Debug, Serialize, Tabled)]
struct SpecRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Address")]
    address: String,

    #[tabled(rename = "Memory (MB)")]
    memory_mb: u32,

    #[tabled(rename = "vCPUs")]
    vcpus: u32,

    #[tabled(rename = "Image")]
    image: String,

    #[tabled(rename = "Ports")]
    ports: String,
}

impl From<ResourceSpec> for SpecRow {
    fn from(spec: ResourceSpec) -> Self {
        let ports = spec
            .forwarded_ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            name: spec.name,
            role: spec.role.to_string(),
            address: spec.ip.to_string(),
            memory_mb: spec.memory_mb,
            vcpus: spec.vcpus,
            image: spec.image,
            ports,
        }
    }
}

impl PlanCommand {
    pub fn run(self, ctx: CommandContext) -> Result<CommandStatus> {
        let ctx = ctx.with_workers(self.workers)?;
        let specs = Topology::from_config(&ctx.config.topology)?.expand()?;
        let rows: Vec<SpecRow> = specs.into_iter().map(SpecRow::from).collect();
        print_output(&rows, ctx.format);
        Ok(CommandStatus::Success)
    }
}
