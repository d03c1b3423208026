//! `kubelab inventory`.

use anyhow::Result;
use clap::Args;
use kubelab_orchestrator::InventoryEntry;
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::{CommandContext, CommandStatus};

#[derive(Debug, Args)]
pub struct InventoryCommand {
    /// Print an Ansible-style INI inventory instead.
    #[arg(long)]
    ini: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct EntryRow {
    #[tabled(rename = "Host")]
    host: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Address")]
    address: String,

    #[tabled(rename = "Port")]
    port: u16,

    #[tabled(rename = "Control Plane")]
    control_plane_ip: String,
}

impl From<&InventoryEntry> for EntryRow {
    fn from(entry: &InventoryEntry) -> Self {
        Self {
            host: entry.hostname.clone(),
            role: entry.role.to_string(),
            address: entry.address.to_string(),
            port: entry.port,
            control_plane_ip: entry
                .vars
                .get("control_plane_ip")
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string(),
        }
    }
}

impl InventoryCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<CommandStatus> {
        let orchestrator = ctx.orchestrator()?;
        let inventory = orchestrator.inventory().await?;

        if self.ini {
            print!("{}", inventory.render_ini(&ctx.config.connection.user));
        } else {
            let rows: Vec<EntryRow> = inventory.entries().iter().map(EntryRow::from).collect();
            print_output(&rows, ctx.format);
        }

        Ok(CommandStatus::Success)
    }
}
