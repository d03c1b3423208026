//! Cluster orchestrator.
//!
//! Drives a full `up`:
//!
//! ```text
//! Topology -> ResourceSpecs -> Provider (concurrent create + boot wait)
//!          -> Inventory (barrier: every machine Running)
//!          -> ConvergenceEngine -> ClusterReport
//! ```
//!
//! Provisioning is all-or-nothing: the first fatal provider error aborts the
//! remaining creations and rolls back machines created by this invocation.
//! Convergence failures are partial and only degrade the cluster.
//!
//! Machines the provider holds that the topology no longer names (a smaller
//! `--workers`) are destroyed once the planned machines are up. A stale
//! machine that cannot be destroyed is reported as skipped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kubelab_id::{MachineId, RunId};
use kubelab_reconcile::RetryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, ConfigError};
use crate::convergence::{ConvergenceEngine, HostOutcome, HostReport, RemoteExecutor};
use crate::inventory::{self, Inventory, InventoryContext, InventoryError};
use crate::provider::{MachineState, ProvisionedMachine, Provider, ProviderError};
use crate::shutdown::cancelled;
use crate::spec::{InvalidSpecError, ResourceSpec, Topology};

/// Orchestrator errors. Every variant is fatal to the operation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] InvalidSpecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("provider unavailable for {name} after {attempts} attempt(s): {message}")]
    ProviderUnavailable {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("resources exhausted for {} ({} MB, {} vCPU): {reason}", spec.name, spec.memory_mb, spec.vcpus)]
    ResourceExhausted {
        spec: Box<ResourceSpec>,
        reason: String,
    },

    #[error("machine {name} already exists with a different spec")]
    SpecConflict { name: String },

    #[error("machine {name} failed to boot")]
    MachineFailed { name: String },

    #[error("machine {name} not running after {waited:?}")]
    BootTimeout { name: String, waited: Duration },

    #[error(transparent)]
    IncompleteTopology(#[from] InventoryError),

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("provisioning worker failed: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to destroy: {}", failed.join(", "))]
    Teardown { failed: Vec<String> },
}

impl OrchestratorError {
    /// Map a create error for `spec` after `attempts` tries.
    fn from_create(spec: &ResourceSpec, attempts: u32, err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(message) => Self::ProviderUnavailable {
                name: spec.name.clone(),
                attempts,
                message,
            },
            ProviderError::ResourceExhausted { reason, .. } => Self::ResourceExhausted {
                spec: Box::new(spec.clone()),
                reason,
            },
            ProviderError::SpecConflict { name } => Self::SpecConflict { name },
            other => Self::Provider(other),
        }
    }
}

/// VM creation retry and boot wait settings.
#[derive(Debug, Clone)]
pub struct ProvisioningPolicy {
    pub retry: RetryPolicy,

    /// How long a created machine may take to reach `Running`.
    pub boot_timeout: Duration,

    pub poll_interval: Duration,

    /// Concurrent creations; 0 means one per node.
    pub max_parallel: usize,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            boot_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            max_parallel: 0,
        }
    }
}

/// Aggregate cluster status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Every host converged.
    Ready,
    /// At least one host failed or was skipped.
    Degraded {
        failed: Vec<String>,
        skipped: Vec<String>,
    },
}

impl ClusterStatus {
    /// Ready only if every host converged.
    pub fn from_hosts(hosts: &[HostReport]) -> Self {
        if hosts.iter().all(HostReport::is_converged) {
            return Self::Ready;
        }

        let names = |pred: fn(&HostOutcome) -> bool| -> Vec<String> {
            hosts
                .iter()
                .filter(|h| pred(&h.outcome))
                .map(|h| h.hostname.clone())
                .collect()
        };
        Self::Degraded {
            failed: names(|o| matches!(o, HostOutcome::Failed { .. })),
            skipped: names(|o| matches!(o, HostOutcome::Skipped { .. })),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ready => 0,
            Self::Degraded { .. } => 1,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Degraded { failed, skipped } => {
                write!(f, "degraded (failed: [{}]", failed.join(", "))?;
                if !skipped.is_empty() {
                    write!(f, ", skipped: [{}]", skipped.join(", "))?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Final report of an `up`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub run_id: RunId,
    pub cluster: String,
    pub status: ClusterStatus,

    /// Machines newly allocated by this invocation.
    pub created: Vec<String>,

    /// Machines destroyed because the topology no longer names them.
    #[serde(default)]
    pub removed: Vec<String>,

    /// Every node's outcome, control first.
    pub hosts: Vec<HostReport>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a `down`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub destroyed: Vec<String>,
}

/// Cluster orchestrator.
pub struct Orchestrator<P: Provider + 'static, E: RemoteExecutor + 'static> {
    config: ClusterConfig,
    provider: Arc<P>,
    engine: ConvergenceEngine<E>,
    policy: ProvisioningPolicy,
}

impl<P: Provider + 'static, E: RemoteExecutor + 'static> Orchestrator<P, E> {
    pub fn new(config: ClusterConfig, provider: Arc<P>, executor: Arc<E>) -> Self {
        let engine = ConvergenceEngine::new(executor, config.engine_config());
        let policy = config.provisioning_policy();
        Self {
            config,
            provider,
            engine,
            policy,
        }
    }

    /// Override the provisioning policy from the config.
    pub fn with_policy(mut self, policy: ProvisioningPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn inventory_context(&self) -> InventoryContext {
        InventoryContext {
            cluster_name: self.config.name.clone(),
            api_port: self.config.topology.api_port,
            ssh_port: self.config.connection.port,
        }
    }

    /// Expand the configured topology without touching the provider.
    pub fn plan(&self) -> Result<Vec<ResourceSpec>, OrchestratorError> {
        Ok(Topology::from_config(&self.config.topology)?.expand()?)
    }

    /// Provision and converge the cluster.
    ///
    /// Returns a report for Ready and Degraded clusters alike; errors are
    /// reserved for failures that prevent convergence from starting.
    pub async fn up(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ClusterReport, OrchestratorError> {
        let started_at = Utc::now();
        let run_id = RunId::new();
        let specs = self.plan()?;

        info!(
            run_id = %run_id,
            cluster = %self.config.name,
            nodes = specs.len(),
            "Bringing cluster up"
        );

        let before = self.provider.list().await.map_err(OrchestratorError::Provider)?;
        let existing: HashSet<MachineId> = before.iter().map(|m| m.id).collect();
        let planned: HashSet<String> = specs.iter().map(|s| s.name.clone()).collect();

        let machines = match self.provision_all(specs, &mut shutdown).await {
            Ok(machines) => machines,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Provisioning failed");
                self.rollback(&existing).await;
                return Err(e);
            }
        };

        let inventory = match inventory::build(&machines, &self.inventory_context()) {
            Ok(inventory) => inventory,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Inventory build failed");
                self.rollback(&existing).await;
                return Err(e.into());
            }
        };

        let mut fresh: Vec<&ProvisionedMachine> =
            machines.iter().filter(|m| !existing.contains(&m.id)).collect();
        fresh.sort_by_key(|m| m.spec.ordering_key());
        let created: Vec<String> = fresh.into_iter().map(|m| m.spec.name.clone()).collect();

        let stale: Vec<ProvisionedMachine> = before
            .into_iter()
            .filter(|m| !planned.contains(&m.spec.name))
            .collect();
        let (removed, leftover) = self.remove_stale(stale).await;

        let run = self
            .engine
            .run(
                run_id,
                &inventory,
                &self.config.tasks,
                &self.config.credentials(),
                shutdown,
            )
            .await;

        let mut hosts = run.hosts;
        hosts.extend(leftover);
        let status = ClusterStatus::from_hosts(&hosts);

        info!(
            run_id = %run_id,
            status = %status,
            created = created.len(),
            removed = removed.len(),
            "Cluster up finished"
        );

        Ok(ClusterReport {
            run_id,
            cluster: self.config.name.clone(),
            status,
            created,
            removed,
            hosts,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Destroy every machine the provider knows about.
    pub async fn down(&self) -> Result<TeardownReport, OrchestratorError> {
        let mut machines = self.provider.list().await.map_err(OrchestratorError::Provider)?;
        // Workers first, control last.
        machines.sort_by_key(|m| std::cmp::Reverse(m.spec.ordering_key()));

        info!(cluster = %self.config.name, machines = machines.len(), "Tearing cluster down");

        let mut report = TeardownReport::default();
        let mut failed = Vec::new();

        for machine in machines {
            match self.destroy_with_retry(&machine).await {
                Ok(()) => report.destroyed.push(machine.spec.name),
                Err(e) => {
                    error!(name = %machine.spec.name, id = %machine.id, error = %e, "Destroy failed");
                    failed.push(machine.spec.name);
                }
            }
        }

        if !failed.is_empty() {
            return Err(OrchestratorError::Teardown { failed });
        }

        info!(destroyed = report.destroyed.len(), "Teardown complete");
        Ok(report)
    }

    /// Machines currently held by the provider, control first.
    pub async fn status(&self) -> Result<Vec<ProvisionedMachine>, OrchestratorError> {
        let mut machines = self.provider.list().await.map_err(OrchestratorError::Provider)?;
        machines.sort_by_key(|m| m.spec.ordering_key());
        Ok(machines)
    }

    /// Inventory of the machines currently held by the provider.
    pub async fn inventory(&self) -> Result<Inventory, OrchestratorError> {
        let machines = self.status().await?;
        Ok(inventory::build(&machines, &self.inventory_context())?)
    }

    async fn provision_all(
        &self,
        specs: Vec<ResourceSpec>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<ProvisionedMachine>, OrchestratorError> {
        let limit = match self.policy.max_parallel {
            0 => specs.len().max(1),
            n => n,
        };
        let pool = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for spec in specs {
            let provider = Arc::clone(&self.provider);
            let policy = self.policy.clone();
            let pool = Arc::clone(&pool);

            tasks.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                provision_one(provider.as_ref(), spec, &policy).await
            });
        }

        let mut machines = Vec::new();
        let failure = loop {
            tokio::select! {
                biased;
                _ = cancelled(shutdown) => {
                    warn!("Cancellation requested, aborting provisioning");
                    break OrchestratorError::Cancelled;
                }
                joined = tasks.join_next() => match joined {
                    None => return Ok(machines),
                    Some(Ok(Ok(machine))) => machines.push(machine),
                    Some(Ok(Err(e))) => break e,
                    Some(Err(e)) => break OrchestratorError::Internal(e.to_string()),
                },
            }
        };

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Err(failure)
    }

    /// Destroy machines outside the topology, workers first.
    ///
    /// Returns the names destroyed and a skipped report for every machine
    /// that survived.
    async fn remove_stale(
        &self,
        mut stale: Vec<ProvisionedMachine>,
    ) -> (Vec<String>, Vec<HostReport>) {
        stale.sort_by_key(|m| std::cmp::Reverse(m.spec.ordering_key()));

        let mut removed = Vec::new();
        let mut leftover = Vec::new();
        for machine in stale {
            info!(name = %machine.spec.name, id = %machine.id, "Removing machine not in topology");
            match self.destroy_with_retry(&machine).await {
                Ok(()) => removed.push(machine.spec.name),
                Err(e) => {
                    error!(name = %machine.spec.name, id = %machine.id, error = %e, "Stale machine destroy failed");
                    leftover.push(HostReport::skipped(
                        &machine.spec.name,
                        machine.spec.role,
                        machine.spec.ip,
                        format!("not in topology, destroy failed: {e}"),
                    ));
                }
            }
        }
        (removed, leftover)
    }

    /// Destroy machines that did not exist before this invocation.
    async fn rollback(&self, existing: &HashSet<MachineId>) {
        let machines = match self.provider.list().await {
            Ok(machines) => machines,
            Err(e) => {
                error!(error = %e, "Rollback could not list machines");
                return;
            }
        };

        for machine in machines.into_iter().filter(|m| !existing.contains(&m.id)) {
            info!(name = %machine.spec.name, id = %machine.id, "Rolling back machine");
            if let Err(e) = self.destroy_with_retry(&machine).await {
                error!(name = %machine.spec.name, id = %machine.id, error = %e, "Rollback destroy failed");
            }
        }
    }

    async fn destroy_with_retry(&self, machine: &ProvisionedMachine) -> Result<(), ProviderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.destroy(&machine.id).await {
                Ok(()) => {
                    debug!(name = %machine.spec.name, id = %machine.id, "Machine destroyed");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match self.policy.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(name = %machine.spec.name, attempt, error = %e, "Destroy failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Create one machine and wait for it to boot.
async fn provision_one<P: Provider + ?Sized>(
    provider: &P,
    spec: ResourceSpec,
    policy: &ProvisioningPolicy,
) -> Result<ProvisionedMachine, OrchestratorError> {
    info!(name = %spec.name, ip = %spec.ip, "Provisioning machine");

    let mut attempt = 0;
    let machine = loop {
        attempt += 1;
        match provider.create(&spec).await {
            Ok(machine) => break machine,
            Err(e) if e.is_retryable() => {
                let Some(delay) = policy.retry.next_delay(attempt) else {
                    return Err(OrchestratorError::from_create(&spec, attempt, e));
                };
                warn!(
                    name = %spec.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Create failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(OrchestratorError::from_create(&spec, attempt, e)),
        }
    };

    let machine = wait_running(provider, machine, policy).await?;
    info!(name = %machine.spec.name, id = %machine.id, "Machine running");
    Ok(machine)
}

/// Poll until `machine` is `Running`.
async fn wait_running<P: Provider + ?Sized>(
    provider: &P,
    mut machine: ProvisionedMachine,
    policy: &ProvisioningPolicy,
) -> Result<ProvisionedMachine, OrchestratorError> {
    let poll = async {
        loop {
            match provider.inspect(&machine.id).await {
                Ok(MachineState::Running) => return Ok(MachineState::Running),
                Ok(MachineState::Failed | MachineState::Destroyed) => {
                    return Err(OrchestratorError::MachineFailed {
                        name: machine.spec.name.clone(),
                    })
                }
                Ok(state) => debug!(name = %machine.spec.name, state = %state, "Waiting for boot"),
                Err(e) if e.is_retryable() => {
                    debug!(name = %machine.spec.name, error = %e, "Inspect failed, polling again")
                }
                Err(e) => return Err(OrchestratorError::Provider(e)),
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    };

    let state = tokio::time::timeout(policy.boot_timeout, poll)
        .await
        .map_err(|_| OrchestratorError::BootTimeout {
            name: machine.spec.name.clone(),
            waited: policy.boot_timeout,
        })??;

    machine.state = state;
    Ok(machine)
}
