//! Cluster configuration.
//!
//! A [`ClusterConfig`] is loaded once (from a TOML file, or defaults) and
//! then handed to the orchestrator as an immutable value. Every section is
//! `#[serde(default)]`, so an empty file describes the default two-worker
//! cluster.
//!
//! ```toml
//! name = "lab"
//!
//! [topology]
//! worker_count = 2
//! subnet_base = "10.10.2"
//!
//! [[tasks]]
//! name = "install-containerd"
//! command = "apt-get install -y containerd"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kubelab_networking::{Ipv4Subnet, MAX_HOST_OCTET};
use kubelab_reconcile::{BackoffPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convergence::{ConvergenceTask, Credentials, EngineConfig, TaskScope};
use crate::orchestrator::ProvisioningPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name, exposed to tasks as `cluster_name`.
    pub name: String,

    pub topology: TopologyConfig,
    pub provisioning: ProvisioningConfig,
    pub convergence: ConvergenceConfig,
    pub connection: ConnectionConfig,

    /// Ordered convergence tasks.
    pub tasks: Vec<ConvergenceTask>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "kubelab".to_string(),
            topology: TopologyConfig::default(),
            provisioning: ProvisioningConfig::default(),
            convergence: ConvergenceConfig::default(),
            connection: ConnectionConfig::default(),
            tasks: default_tasks(),
        }
    }
}

/// Cluster shape and per-node sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyConfig {
    pub worker_count: u32,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub base_image: String,

    /// Three-octet base (`"10.10.2"`) or a /24 CIDR.
    pub subnet_base: String,

    /// Kubernetes API port forwarded from the control node.
    pub api_port: u16,

    /// Host octet of the control node.
    pub control_host: u32,

    /// Worker `i` (1-based) gets host octet `worker_offset + i`.
    pub worker_offset: u32,

    /// Opaque provider-specific options, passed through untouched.
    pub provider_options: BTreeMap<String, String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            memory_mb: 2048,
            vcpus: 2,
            base_image: "ubuntu/focal64".to_string(),
            subnet_base: "10.10.2".to_string(),
            api_port: 6443,
            control_host: 10,
            worker_offset: 20,
            provider_options: BTreeMap::new(),
        }
    }
}

/// VM creation retry and boot wait settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub boot_timeout_secs: u64,
    pub poll_interval_ms: u64,

    /// Concurrent creations; 0 means one per node.
    pub max_parallel: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_secs: 30,
            boot_timeout_secs: 300,
            poll_interval_ms: 500,
            max_parallel: 0,
        }
    }
}

/// Convergence worker pool and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergenceConfig {
    pub max_parallel_hosts: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_parallel_hosts: 4,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_secs: 30,
            task_timeout_secs: 600,
        }
    }
}

/// Remote connection parameters shared by all hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub user: String,
    pub port: u16,
    pub private_key: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: "vagrant".to_string(),
            port: 22,
            private_key: None,
        }
    }
}

/// Tasks modelled on the usual kubeadm control/worker playbooks.
pub fn default_tasks() -> Vec<ConvergenceTask> {
    let task = |name: &str, command: &str, scope| ConvergenceTask {
        name: name.to_string(),
        command: command.to_string(),
        scope,
    };

    vec![
        task(
            "base-packages",
            "apt-get install -y apt-transport-https ca-certificates curl gnupg",
            TaskScope::All,
        ),
        task("container-runtime", "apt-get install -y containerd", TaskScope::All),
        task("disable-swap", "swapoff -a && sed -i '/ swap / s/^/#/' /etc/fstab", TaskScope::All),
        task(
            "kube-packages",
            "apt-get install -y kubelet kubeadm kubectl",
            TaskScope::All,
        ),
        task(
            "kubelet-node-ip",
            "echo 'KUBELET_EXTRA_ARGS=--node-ip={{ node_ip }}' > /etc/default/kubelet",
            TaskScope::All,
        ),
        task(
            "kubeadm-init",
            "kubeadm init --apiserver-advertise-address={{ node_ip }} --node-name {{ node_name }}",
            TaskScope::Control,
        ),
        task(
            "kubeadm-join",
            "kubeadm join {{ control_plane_ip }}:{{ api_port }} --node-name {{ node_name }}",
            TaskScope::Workers,
        ),
    ]
}

impl ClusterConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let t = &self.topology;

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if t.memory_mb == 0 {
            return invalid("topology.memory_mb must be > 0".into());
        }
        if t.vcpus == 0 {
            return invalid("topology.vcpus must be > 0".into());
        }
        if t.base_image.trim().is_empty() {
            return invalid("topology.base_image must not be empty".into());
        }
        if t.api_port == 0 {
            return invalid("topology.api_port must be > 0".into());
        }
        if let Err(e) = Ipv4Subnet::parse(&t.subnet_base) {
            return invalid(format!("topology.subnet_base: {e}"));
        }
        if t.control_host == 0 || t.control_host > MAX_HOST_OCTET {
            return invalid(format!(
                "topology.control_host {} outside 1..={MAX_HOST_OCTET}",
                t.control_host
            ));
        }
        let last_worker = u64::from(t.worker_offset) + u64::from(t.worker_count);
        if t.worker_count > 0 && last_worker > u64::from(MAX_HOST_OCTET) {
            return invalid(format!(
                "{} workers at offset {} do not fit in the subnet",
                t.worker_count, t.worker_offset
            ));
        }
        if t.worker_count > 0
            && t.control_host > t.worker_offset
            && u64::from(t.control_host) <= last_worker
        {
            return invalid(format!(
                "topology.control_host {} collides with worker addresses",
                t.control_host
            ));
        }

        if self.provisioning.max_attempts == 0 {
            return invalid("provisioning.max_attempts must be >= 1".into());
        }
        if self.provisioning.poll_interval_ms == 0 {
            return invalid("provisioning.poll_interval_ms must be > 0".into());
        }
        if self.convergence.max_attempts == 0 {
            return invalid("convergence.max_attempts must be >= 1".into());
        }
        if self.convergence.max_parallel_hosts == 0 {
            return invalid("convergence.max_parallel_hosts must be >= 1".into());
        }
        if self.convergence.task_timeout_secs == 0 {
            return invalid("convergence.task_timeout_secs must be > 0".into());
        }

        let mut names = BTreeSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return invalid("task names must not be empty".into());
            }
            if !names.insert(task.name.as_str()) {
                return invalid(format!("duplicate task name: {}", task.name));
            }
        }

        Ok(())
    }

    /// Convergence engine settings.
    pub fn engine_config(&self) -> EngineConfig {
        let c = &self.convergence;
        EngineConfig {
            max_parallel_hosts: c.max_parallel_hosts,
            retry: RetryPolicy::new(
                c.max_attempts,
                BackoffPolicy {
                    base: Duration::from_millis(c.backoff_base_ms),
                    max: Duration::from_secs(c.backoff_max_secs),
                    ..BackoffPolicy::default()
                },
            ),
            task_timeout: Duration::from_secs(c.task_timeout_secs),
        }
    }

    /// VM creation settings.
    pub fn provisioning_policy(&self) -> ProvisioningPolicy {
        let p = &self.provisioning;
        ProvisioningPolicy {
            retry: RetryPolicy::new(
                p.max_attempts,
                BackoffPolicy {
                    base: Duration::from_millis(p.backoff_base_ms),
                    max: Duration::from_secs(p.backoff_max_secs),
                    ..BackoffPolicy::default()
                },
            ),
            boot_timeout: Duration::from_secs(p.boot_timeout_secs),
            poll_interval: Duration::from_millis(p.poll_interval_ms),
            max_parallel: p.max_parallel,
        }
    }

    /// Credentials used for every host.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.connection.user.clone(),
            private_key: self.connection.private_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = ClusterConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert_eq!(config.topology.worker_count, 2);
        assert_eq!(config.topology.memory_mb, 2048);
        assert_eq!(config.topology.vcpus, 2);
        assert_eq!(config.topology.api_port, 6443);
    }

    #[test]
    fn test_partial_override() {
        let config = ClusterConfig::from_toml_str(
            r#"
            name = "dev"

            [topology]
            worker_count = 3
            subnet_base = "192.168.56"
            provider_options = { cpuexecutioncap = "50" }

            [convergence]
            max_parallel_hosts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "dev");
        assert_eq!(config.topology.worker_count, 3);
        assert_eq!(config.topology.memory_mb, 2048);
        assert_eq!(
            config.topology.provider_options.get("cpuexecutioncap"),
            Some(&"50".to_string())
        );
        assert_eq!(config.engine_config().max_parallel_hosts, 2);
    }

    #[test]
    fn test_custom_tasks() {
        let config = ClusterConfig::from_toml_str(
            r#"
            [[tasks]]
            name = "hello"
            command = "echo hi"

            [[tasks]]
            name = "init"
            command = "kubeadm init"
            scope = "control"
            "#,
        )
        .unwrap();

        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].scope, TaskScope::All);
        assert_eq!(config.tasks[1].scope, TaskScope::Control);
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = ClusterConfig::from_toml_str("[topology]\nworkers = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_memory() {
        let err = ClusterConfig::from_toml_str("[topology]\nmemory_mb = 0\n").unwrap_err();
        assert!(err.to_string().contains("memory_mb"));
    }

    #[test]
    fn test_rejects_bad_subnet() {
        let err = ClusterConfig::from_toml_str("[topology]\nsubnet_base = \"10.10\"\n").unwrap_err();
        assert!(err.to_string().contains("subnet_base"));
    }

    #[test]
    fn test_rejects_control_collision() {
        let mut config = ClusterConfig::default();
        config.topology.control_host = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_workers_overflowing_subnet() {
        let mut config = ClusterConfig::default();
        config.topology.worker_count = 240;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_task_names() {
        let mut config = ClusterConfig::default();
        let first = config.tasks[0].clone();
        config.tasks.push(first);
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_default_tasks_cover_both_roles() {
        let tasks = default_tasks();
        assert!(tasks.iter().any(|t| t.scope == TaskScope::Control));
        assert!(tasks.iter().any(|t| t.scope == TaskScope::Workers));
    }

    #[test]
    fn test_policies_follow_config() {
        let mut config = ClusterConfig::default();
        config.provisioning.max_attempts = 5;
        config.convergence.task_timeout_secs = 42;

        assert_eq!(config.provisioning_policy().retry.max_attempts(), 5);
        assert_eq!(config.engine_config().task_timeout, Duration::from_secs(42));
        assert_eq!(config.credentials().user, "vagrant");
    }
}
