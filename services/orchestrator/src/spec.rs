//! Resource spec model.
//!
//! A [`Topology`] describes the cluster shape (one control node plus N
//! workers). [`Topology::expand`] turns it into one [`ResourceSpec`] per node
//! with deterministic names and static addresses:
//!
//! ```text
//! master -> {subnet}.{control_host}
//! node1  -> {subnet}.{worker_offset + 1}
//! node2  -> {subnet}.{worker_offset + 2}
//! ```
//!
//! Expansion is pure; the resulting specs are validated as a batch before any
//! of them reach a provider.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use kubelab_networking::{check_host_ports, Ipv4Subnet, NetworkError, PortForward};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TopologyConfig;

/// Name of the single control node.
pub const CONTROL_NODE_NAME: &str = "master";

/// Prefix of worker node names (`node1`, `node2`, …).
pub const WORKER_NAME_PREFIX: &str = "node";

/// Spec validation errors. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpecError {
    #[error("invalid machine name {0:?}: use 1-63 lowercase letters, digits or '-'")]
    InvalidName(String),

    #[error("duplicate machine name: {0}")]
    DuplicateName(String),

    #[error("{name}: invalid address {ip}")]
    InvalidAddress { name: String, ip: String },

    #[error("{name}: address {ip} is outside subnet {subnet}")]
    OutsideSubnet {
        name: String,
        ip: Ipv4Addr,
        subnet: String,
    },

    #[error("address {ip} assigned to both {first} and {second}")]
    DuplicateAddress {
        ip: Ipv4Addr,
        first: String,
        second: String,
    },

    #[error("{0}: memory must be greater than zero")]
    ZeroMemory(String),

    #[error("{0}: vcpus must be greater than zero")]
    ZeroCpus(String),

    #[error("{0}: image reference must not be empty")]
    EmptyImage(String),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("topology: {0}")]
    Topology(String),
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Control,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Control => "control",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired shape of a single machine.
///
/// Immutable once handed to a provider; providers compare specs by value to
/// decide whether a create is a repeat or a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub role: NodeRole,

    /// 0 for the control node, 1-based for workers.
    pub index: u32,

    pub image: String,
    pub ip: Ipv4Addr,
    pub memory_mb: u32,
    pub vcpus: u32,

    #[serde(default)]
    pub forwarded_ports: Vec<PortForward>,

    /// Provider-specific knobs; never interpreted by the orchestrator.
    #[serde(default)]
    pub provider_options: BTreeMap<String, String>,
}

impl ResourceSpec {
    /// Sort key placing the control node first, then workers by index.
    pub fn ordering_key(&self) -> (NodeRole, u32) {
        (self.role, self.index)
    }

    /// Validate a single spec in isolation.
    pub fn validate(&self) -> Result<(), InvalidSpecError> {
        if !is_valid_hostname(&self.name) {
            return Err(InvalidSpecError::InvalidName(self.name.clone()));
        }
        if self.memory_mb == 0 {
            return Err(InvalidSpecError::ZeroMemory(self.name.clone()));
        }
        if self.vcpus == 0 {
            return Err(InvalidSpecError::ZeroCpus(self.name.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(InvalidSpecError::EmptyImage(self.name.clone()));
        }

        let last = self.ip.octets()[3];
        if self.ip.is_unspecified()
            || self.ip.is_broadcast()
            || self.ip.is_multicast()
            || last == 0
            || last == 255
        {
            return Err(InvalidSpecError::InvalidAddress {
                name: self.name.clone(),
                ip: self.ip.to_string(),
            });
        }

        check_host_ports([(self.name.as_str(), self.forwarded_ports.as_slice())])?;
        Ok(())
    }
}

/// Validate a batch of specs destined for one cluster.
///
/// Checks every spec individually, then names, addresses and host ports
/// for collisions across the batch.
pub fn validate_batch(specs: &[ResourceSpec], subnet: &Ipv4Subnet) -> Result<(), InvalidSpecError> {
    let mut names: HashSet<&str> = HashSet::new();
    let mut addresses: HashMap<Ipv4Addr, &str> = HashMap::new();

    for spec in specs {
        spec.validate()?;

        if !names.insert(spec.name.as_str()) {
            return Err(InvalidSpecError::DuplicateName(spec.name.clone()));
        }

        if !subnet.is_usable_host(spec.ip) {
            return Err(InvalidSpecError::OutsideSubnet {
                name: spec.name.clone(),
                ip: spec.ip,
                subnet: subnet.to_string(),
            });
        }

        if let Some(first) = addresses.insert(spec.ip, spec.name.as_str()) {
            return Err(InvalidSpecError::DuplicateAddress {
                ip: spec.ip,
                first: first.to_string(),
                second: spec.name.clone(),
            });
        }
    }

    check_host_ports(
        specs
            .iter()
            .map(|s| (s.name.as_str(), s.forwarded_ports.as_slice())),
    )?;

    Ok(())
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Cluster shape: one control node plus `worker_count` workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub worker_count: u32,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub base_image: String,
    pub subnet: Ipv4Subnet,
    pub api_port: u16,
    pub control_host: u32,
    pub worker_offset: u32,
    pub provider_options: BTreeMap<String, String>,
}

impl Topology {
    /// Build a topology from its configuration section.
    pub fn from_config(config: &TopologyConfig) -> Result<Self, InvalidSpecError> {
        let subnet = Ipv4Subnet::parse(&config.subnet_base)?;

        Ok(Self {
            worker_count: config.worker_count,
            memory_mb: config.memory_mb,
            vcpus: config.vcpus,
            base_image: config.base_image.clone(),
            subnet,
            api_port: config.api_port,
            control_host: config.control_host,
            worker_offset: config.worker_offset,
            provider_options: config.provider_options.clone(),
        })
    }

    /// Same topology with a different worker count.
    pub fn with_workers(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Name of the node with the given role and index.
    pub fn node_name(role: NodeRole, index: u32) -> String {
        match role {
            NodeRole::Control => CONTROL_NODE_NAME.to_string(),
            NodeRole::Worker => format!("{WORKER_NAME_PREFIX}{index}"),
        }
    }

    /// Static address of the control node.
    pub fn control_ip(&self) -> Result<Ipv4Addr, InvalidSpecError> {
        Ok(self.subnet.host(self.control_host)?)
    }

    /// Static address of worker `index` (1-based).
    pub fn worker_ip(&self, index: u32) -> Result<Ipv4Addr, InvalidSpecError> {
        let offset = self
            .worker_offset
            .checked_add(index)
            .ok_or_else(|| InvalidSpecError::Topology(format!("worker offset overflow at {index}")))?;
        Ok(self.subnet.host(offset)?)
    }

    /// Expand into validated per-node specs, control node first.
    pub fn expand(&self) -> Result<Vec<ResourceSpec>, InvalidSpecError> {
        let api_forward = PortForward::same(self.api_port)?;

        let control = ResourceSpec {
            name: Self::node_name(NodeRole::Control, 0),
            role: NodeRole::Control,
            index: 0,
            image: self.base_image.clone(),
            ip: self.control_ip()?,
            memory_mb: self.memory_mb,
            vcpus: self.vcpus,
            forwarded_ports: vec![api_forward],
            provider_options: self.provider_options.clone(),
        };

        let workers = (1..=self.worker_count).map(|index| {
            Ok(ResourceSpec {
                name: Self::node_name(NodeRole::Worker, index),
                role: NodeRole::Worker,
                index,
                image: self.base_image.clone(),
                ip: self.worker_ip(index)?,
                memory_mb: self.memory_mb,
                vcpus: self.vcpus,
                forwarded_ports: Vec::new(),
                provider_options: self.provider_options.clone(),
            })
        });

        let specs = std::iter::once(Ok(control))
            .chain(workers)
            .collect::<Result<Vec<_>, InvalidSpecError>>()?;

        validate_batch(&specs, &self.subnet)?;
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn topology(workers: u32) -> Topology {
        Topology::from_config(&TopologyConfig::default())
            .unwrap()
            .with_workers(workers)
    }

    fn spec(name: &str, ip: [u8; 4]) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            role: NodeRole::Worker,
            index: 1,
            image: "ubuntu/focal64".to_string(),
            ip: Ipv4Addr::from(ip),
            memory_mb: 1024,
            vcpus: 1,
            forwarded_ports: vec![],
            provider_options: BTreeMap::new(),
        }
    }

    #[test]
    fn test_expand_two_workers() {
        let specs = topology(2).expand().unwrap();
        let summary: Vec<_> = specs.iter().map(|s| (s.name.as_str(), s.ip.to_string())).collect();

        assert_eq!(
            summary,
            vec![
                ("master", "10.10.2.10".to_string()),
                ("node1", "10.10.2.21".to_string()),
                ("node2", "10.10.2.22".to_string()),
            ]
        );
        assert_eq!(specs[0].role, NodeRole::Control);
        assert_eq!(specs[0].forwarded_ports, vec![PortForward { guest: 6443, host: 6443 }]);
        assert!(specs[1].forwarded_ports.is_empty());
        assert!(specs.iter().all(|s| s.memory_mb == 2048 && s.vcpus == 2));
    }

    #[test]
    fn test_expand_control_only() {
        let specs = topology(0).expand().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "master");
    }

    #[test]
    fn test_provider_options_passed_through() {
        let mut config = TopologyConfig::default();
        config
            .provider_options
            .insert("linked_clone".to_string(), "true".to_string());
        let specs = Topology::from_config(&config).unwrap().expand().unwrap();
        assert!(specs
            .iter()
            .all(|s| s.provider_options.get("linked_clone") == Some(&"true".to_string())));
    }

    #[rstest]
    #[case::zero_memory(ResourceSpec { memory_mb: 0, ..spec("node1", [10, 10, 2, 21]) })]
    #[case::zero_cpus(ResourceSpec { vcpus: 0, ..spec("node1", [10, 10, 2, 21]) })]
    #[case::empty_image(ResourceSpec { image: " ".into(), ..spec("node1", [10, 10, 2, 21]) })]
    #[case::bad_name(spec("Node_1", [10, 10, 2, 21]))]
    #[case::network_address(spec("node1", [10, 10, 2, 0]))]
    #[case::broadcast_address(spec("node1", [10, 10, 2, 255]))]
    fn test_validate_rejects(#[case] bad: ResourceSpec) {
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_batch_rejects_duplicate_name() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        let specs = vec![spec("node1", [10, 10, 2, 21]), spec("node1", [10, 10, 2, 22])];
        assert_eq!(
            validate_batch(&specs, &subnet),
            Err(InvalidSpecError::DuplicateName("node1".to_string()))
        );
    }

    #[test]
    fn test_batch_rejects_duplicate_address() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        let specs = vec![spec("node1", [10, 10, 2, 21]), spec("node2", [10, 10, 2, 21])];
        assert!(matches!(
            validate_batch(&specs, &subnet),
            Err(InvalidSpecError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_batch_rejects_outside_subnet() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        let specs = vec![spec("node1", [10, 10, 3, 21])];
        assert!(matches!(
            validate_batch(&specs, &subnet),
            Err(InvalidSpecError::OutsideSubnet { .. })
        ));
    }

    #[test]
    fn test_batch_rejects_shared_host_port() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        let mut a = spec("node1", [10, 10, 2, 21]);
        let mut b = spec("node2", [10, 10, 2, 22]);
        a.forwarded_ports = vec![PortForward::same(8080).unwrap()];
        b.forwarded_ports = vec![PortForward::new(80, 8080).unwrap()];
        assert!(matches!(
            validate_batch(&[a, b], &subnet),
            Err(InvalidSpecError::Network(NetworkError::PortConflict { .. }))
        ));
    }

    #[test]
    fn test_expand_rejects_overflowing_workers() {
        assert!(topology(250).expand().is_err());
    }

    proptest! {
        #[test]
        fn prop_expand_unique_names_and_ips(workers in 0u32..=200) {
            let specs = topology(workers).expand().unwrap();
            prop_assert_eq!(specs.len() as u32, workers + 1);

            let names: HashSet<_> = specs.iter().map(|s| s.name.clone()).collect();
            let ips: HashSet<_> = specs.iter().map(|s| s.ip).collect();
            prop_assert_eq!(names.len(), specs.len());
            prop_assert_eq!(ips.len(), specs.len());
        }

        #[test]
        fn prop_expand_is_deterministic(workers in 0u32..=50) {
            prop_assert_eq!(topology(workers).expand().unwrap(), topology(workers).expand().unwrap());
        }
    }
}
