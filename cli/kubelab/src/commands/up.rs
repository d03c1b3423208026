//! `kubelab up`.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use kubelab_orchestrator::{ClusterReport, ClusterStatus, HostOutcome, HostReport};
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::watch;
use tracing::warn;

use crate::output::{
    print_info, print_output, print_single, print_success, print_warning, OutputFormat,
};

use super::{CommandContext, CommandStatus};

#[derive(Debug, Args)]
pub struct UpCommand {
    /// Number of worker nodes (overrides the config file).
    #[arg(long)]
    workers: Option<u32>,
}

#[derive(Debug, Serialize, Tabled)]
struct HostRow {
    #[tabled(rename = "Host")]
    host: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Address")]
    address: String,

    #[tabled(rename = "Outcome")]
    outcome: String,

    #[tabled(rename = "Changed")]
    changed: String,

    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&HostReport> for HostRow {
    fn from(host: &HostReport) -> Self {
        let detail = match &host.outcome {
            HostOutcome::Converged => String::new(),
            HostOutcome::Failed { task, reason } => format!("{task}: {reason}"),
            HostOutcome::Skipped { reason } => reason.clone(),
        };

        Self {
            host: host.hostname.clone(),
            role: host.role.to_string(),
            address: host.address.to_string(),
            outcome: host.outcome.label().to_string(),
            changed: format!("{}/{}", host.changed_count(), host.tasks.len()),
            detail,
        }
    }
}

impl UpCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<CommandStatus> {
        let ctx = ctx.with_workers(self.workers)?;
        let orchestrator = ctx.orchestrator()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received interrupt, stopping after in-flight work");
                let _ = shutdown_tx.send(true);
            }
        });

        let result = orchestrator.up(shutdown_rx).await;
        signal.abort();
        let report = result?;

        print_report(&report, ctx.format);

        Ok(match report.status {
            ClusterStatus::Ready => CommandStatus::Success,
            ClusterStatus::Degraded { .. } => CommandStatus::Degraded,
        })
    }
}

fn print_report(report: &ClusterReport, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_single(report);
        return;
    }

    let rows: Vec<HostRow> = report.hosts.iter().map(HostRow::from).collect();
    print_output(&rows, format);

    if !report.removed.is_empty() {
        print_info(&format!(
            "Removed machines no longer in the topology: {}",
            report.removed.join(", ")
        ));
    }

    match &report.status {
        ClusterStatus::Ready => print_success(&format!(
            "Cluster {} is ready ({} node(s), {} created)",
            report.cluster.bold(),
            report.hosts.len(),
            report.created.len()
        )),
        ClusterStatus::Degraded { failed, skipped } => {
            if !failed.is_empty() {
                print_warning(&format!("Failed hosts: {}", failed.join(", ")));
            }
            if !skipped.is_empty() {
                print_warning(&format!("Skipped hosts: {}", skipped.join(", ")));
            }
            print_warning(&format!("Cluster {} is degraded", report.cluster));
        }
    }
}
