//! Inventory builder.
//!
//! Turns the set of provisioned machines into an ordered list of reachable
//! hosts with per-host variables. The control node always comes first so its
//! address is known before any worker variables are derived.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{MachineState, ProvisionedMachine};
use crate::spec::NodeRole;

/// Inventory errors.
///
/// These indicate a broken provider contract and are treated as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("incomplete topology: {host} is {state}, expected running")]
    IncompleteTopology { host: String, state: MachineState },

    #[error("incomplete topology: no control node")]
    MissingControl,

    #[error("topology has more than one control node ({first}, {second})")]
    DuplicateControl { first: String, second: String },
}

/// Per-host variables handed to every task on that host.
pub type HostVars = BTreeMap<String, serde_json::Value>;

/// Cluster-wide inputs to variable derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryContext {
    pub cluster_name: String,
    pub api_port: u16,

    /// Remote shell port on every host.
    pub ssh_port: u16,
}

/// A reachable host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub hostname: String,
    pub role: NodeRole,
    pub index: u32,
    pub address: Ipv4Addr,
    pub port: u16,
    pub vars: HostVars,
}

/// Ordered inventory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    entries: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.hostname == hostname)
    }

    /// The control node entry.
    pub fn control(&self) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.role == NodeRole::Control)
    }

    /// Render as an Ansible-style INI inventory.
    pub fn render_ini(&self, user: &str) -> String {
        let mut out = String::new();

        for (group, role) in [("control", NodeRole::Control), ("workers", NodeRole::Worker)] {
            let _ = writeln!(out, "[{group}]");
            for entry in self.entries.iter().filter(|e| e.role == role) {
                let _ = writeln!(
                    out,
                    "{} ansible_host={} ansible_port={} ansible_user={} node_ip={}",
                    entry.hostname, entry.address, entry.port, user, entry.address
                );
            }
            out.push('\n');
        }

        out.push_str("[cluster:children]\ncontrol\nworkers\n");
        out
    }
}

/// Build the inventory from provisioned machines.
///
/// Every machine must be `Running`. Entries are ordered control first, then
/// workers by index, regardless of input order.
pub fn build(
    machines: &[ProvisionedMachine],
    context: &InventoryContext,
) -> Result<Inventory, InventoryError> {
    if let Some(stuck) = machines.iter().find(|m| m.state != MachineState::Running) {
        return Err(InventoryError::IncompleteTopology {
            host: stuck.spec.name.clone(),
            state: stuck.state,
        });
    }

    let mut ordered: Vec<&ProvisionedMachine> = machines.iter().collect();
    ordered.sort_by_key(|m| m.spec.ordering_key());

    let mut controls = ordered.iter().filter(|m| m.spec.role == NodeRole::Control);
    let control = controls.next().ok_or(InventoryError::MissingControl)?;
    if let Some(second) = controls.next() {
        return Err(InventoryError::DuplicateControl {
            first: control.spec.name.clone(),
            second: second.spec.name.clone(),
        });
    }
    let control_ip = control.spec.ip;

    let entries = ordered
        .into_iter()
        .map(|machine| {
            let spec = &machine.spec;
            let mut vars = HostVars::new();
            vars.insert("node_ip".into(), spec.ip.to_string().into());
            vars.insert("node_name".into(), spec.name.clone().into());
            vars.insert("node_role".into(), spec.role.as_str().into());
            vars.insert("control_plane_ip".into(), control_ip.to_string().into());
            vars.insert("api_port".into(), context.api_port.into());
            vars.insert("cluster_name".into(), context.cluster_name.clone().into());

            InventoryEntry {
                hostname: spec.name.clone(),
                role: spec.role,
                index: spec.index,
                address: spec.ip,
                port: context.ssh_port,
                vars,
            }
        })
        .collect();

    Ok(Inventory { entries })
}
