//! Convergence engine.
//!
//! Applies an ordered task list to every inventory host:
//!
//! - hosts run concurrently, bounded by `max_parallel_hosts`
//! - tasks on one host run strictly in order
//! - a failed task fails its host only; other hosts keep going
//! - transient errors are retried with backoff, task failures are not
//!
//! ## Host State Machine
//!
//! ```text
//! Pending -> Running -> Converged
//!               |
//!               +-----> Failed
//! ```
//!
//! Cancellation stops a host between tasks, never during one. Hosts stopped
//! this way are reported as `Skipped`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kubelab_id::RunId;
use kubelab_reconcile::RetryPolicy;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::executor::{ConvergenceTask, Credentials, ExecError, RemoteExecutor, TaskOutcome};
use crate::inventory::{Inventory, InventoryEntry};
use crate::shutdown::{cancelled, is_cancelled};
use crate::spec::NodeRole;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hosts converged at the same time.
    pub max_parallel_hosts: usize,

    /// Retry policy for transient errors.
    pub retry: RetryPolicy,

    /// Upper bound on a single task attempt.
    pub task_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_hosts: 4,
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(600),
        }
    }
}

/// Per-host convergence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Pending,
    Running,
    Converged,
    Failed,
}

/// Final outcome for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    Converged,
    Failed { task: String, reason: String },
    Skipped { reason: String },
}

impl HostOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// What happened to one task on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    Changed,
    Unchanged,
    Failed { reason: String },
}

impl From<TaskOutcome> for TaskResult {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Changed => Self::Changed,
            TaskOutcome::Unchanged => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub result: TaskResult,
    pub attempts: u32,
}

/// Convergence report for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
    pub hostname: String,
    pub role: NodeRole,
    pub address: Ipv4Addr,

    /// Last state reached.
    pub state: HostState,
    pub outcome: HostOutcome,
    pub tasks: Vec<TaskRecord>,
}

impl HostReport {
    fn pending(host: &InventoryEntry) -> Self {
        Self {
            hostname: host.hostname.clone(),
            role: host.role,
            address: host.address,
            state: HostState::Pending,
            outcome: HostOutcome::Skipped {
                reason: "not started".to_string(),
            },
            tasks: Vec::new(),
        }
    }

    /// Report for a host that was never handed to the engine.
    pub fn skipped(hostname: &str, role: NodeRole, address: Ipv4Addr, reason: String) -> Self {
        Self {
            hostname: hostname.to_string(),
            role,
            address,
            state: HostState::Pending,
            outcome: HostOutcome::Skipped { reason },
            tasks: Vec::new(),
        }
    }

    fn transition(&mut self, to: HostState) {
        debug!(host = %self.hostname, from = ?self.state, to = ?to, "Host state transition");
        self.state = to;
    }

    fn converge(mut self) -> Self {
        self.transition(HostState::Converged);
        self.outcome = HostOutcome::Converged;
        self
    }

    fn fail(mut self, task: &str, reason: String) -> Self {
        self.transition(HostState::Failed);
        self.outcome = HostOutcome::Failed {
            task: task.to_string(),
            reason,
        };
        self
    }

    fn skip(mut self, reason: String) -> Self {
        info!(host = %self.hostname, reason = %reason, "Host skipped");
        self.outcome = HostOutcome::Skipped { reason };
        self
    }

    pub fn is_converged(&self) -> bool {
        self.outcome == HostOutcome::Converged
    }

    /// Tasks that modified the host.
    pub fn changed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.result == TaskResult::Changed)
            .count()
    }
}

/// Result of one engine invocation. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRun {
    pub run_id: RunId,
    pub inventory: Inventory,

    /// One report per inventory entry, in inventory order.
    pub hosts: Vec<HostReport>,

    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ConvergenceRun {
    pub fn host(&self, hostname: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.hostname == hostname)
    }

    pub fn is_converged(&self) -> bool {
        self.hosts.iter().all(HostReport::is_converged)
    }

    pub fn converged_hosts(&self) -> Vec<String> {
        self.hosts_where(|o| matches!(o, HostOutcome::Converged))
    }

    pub fn failed_hosts(&self) -> Vec<String> {
        self.hosts_where(|o| matches!(o, HostOutcome::Failed { .. }))
    }

    pub fn skipped_hosts(&self) -> Vec<String> {
        self.hosts_where(|o| matches!(o, HostOutcome::Skipped { .. }))
    }

    fn hosts_where(&self, pred: impl Fn(&HostOutcome) -> bool) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| pred(&h.outcome))
            .map(|h| h.hostname.clone())
            .collect()
    }
}

/// Convergence engine.
pub struct ConvergenceEngine<E: RemoteExecutor + 'static> {
    executor: Arc<E>,
    config: EngineConfig,
}

impl<E: RemoteExecutor + 'static> ConvergenceEngine<E> {
    pub fn new(executor: Arc<E>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converge every host in `inventory`.
    ///
    /// Each host receives the tasks whose scope matches its role, in list
    /// order. Always returns one report per host.
    pub async fn run(
        &self,
        run_id: RunId,
        inventory: &Inventory,
        tasks: &[ConvergenceTask],
        credentials: &Credentials,
        shutdown: watch::Receiver<bool>,
    ) -> ConvergenceRun {
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            hosts = inventory.len(),
            tasks = tasks.len(),
            max_parallel_hosts = self.config.max_parallel_hosts,
            "Starting convergence"
        );

        let pool = Arc::new(Semaphore::new(self.config.max_parallel_hosts.max(1)));
        let mut workers = JoinSet::new();

        for (slot, host) in inventory.entries().iter().enumerate() {
            let worker = HostWorker {
                executor: Arc::clone(&self.executor),
                host: host.clone(),
                tasks: tasks
                    .iter()
                    .filter(|t| t.applies_to(host.role))
                    .cloned()
                    .collect(),
                credentials: credentials.clone(),
                config: self.config.clone(),
            };
            let pool = Arc::clone(&pool);
            let shutdown = shutdown.clone();

            workers.spawn(async move { (slot, worker.run(pool, shutdown).await) });
        }

        // Each worker owns exactly one slot.
        let mut slots: Vec<Option<HostReport>> = vec![None; inventory.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((slot, report)) => slots[slot] = Some(report),
                Err(e) => error!(run_id = %run_id, error = %e, "Host worker panicked"),
            }
        }

        let hosts: Vec<HostReport> = slots
            .into_iter()
            .zip(inventory.entries())
            .map(|(report, host)| {
                report.unwrap_or_else(|| {
                    let reason = "host worker aborted".to_string();
                    HostReport::pending(host).fail("<none>", reason)
                })
            })
            .collect();

        let run = ConvergenceRun {
            run_id,
            inventory: inventory.clone(),
            hosts,
            cancelled: is_cancelled(&shutdown),
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            run_id = %run.run_id,
            converged = run.converged_hosts().len(),
            failed = run.failed_hosts().len(),
            skipped = run.skipped_hosts().len(),
            "Convergence finished"
        );

        run
    }
}

enum AttemptError {
    Failed { error: ExecError, attempts: u32 },
    Cancelled,
}

/// Converges a single host.
struct HostWorker<E: RemoteExecutor> {
    executor: Arc<E>,
    host: InventoryEntry,
    tasks: Vec<ConvergenceTask>,
    credentials: Credentials,
    config: EngineConfig,
}

impl<E: RemoteExecutor> HostWorker<E> {
    async fn run(self, pool: Arc<Semaphore>, mut shutdown: watch::Receiver<bool>) -> HostReport {
        let report = HostReport::pending(&self.host);

        let _permit = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => {
                return report.skip("cancelled before start".to_string());
            }
            permit = pool.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return report.skip("worker pool closed".to_string()),
            },
        };

        if is_cancelled(&shutdown) {
            return report.skip("cancelled before start".to_string());
        }

        self.apply_all(report, &mut shutdown).await
    }

    async fn apply_all(&self, mut report: HostReport, shutdown: &mut watch::Receiver<bool>) -> HostReport {
        report.transition(HostState::Running);
        let total = self.tasks.len();

        for (done, task) in self.tasks.iter().enumerate() {
            if is_cancelled(shutdown) {
                return report.skip(format!("cancelled after {done} of {total} tasks"));
            }

            match self.apply_with_retry(task, shutdown).await {
                Ok((outcome, attempts)) => {
                    debug!(
                        host = %self.host.hostname,
                        task = %task.name,
                        outcome = ?outcome,
                        attempts,
                        "Task applied"
                    );
                    report.tasks.push(TaskRecord {
                        task: task.name.clone(),
                        result: outcome.into(),
                        attempts,
                    });
                }
                Err(AttemptError::Failed { error, attempts }) => {
                    warn!(
                        host = %self.host.hostname,
                        task = %task.name,
                        attempts,
                        error = %error,
                        "Task failed"
                    );
                    report.tasks.push(TaskRecord {
                        task: task.name.clone(),
                        result: TaskResult::Failed {
                            reason: error.to_string(),
                        },
                        attempts,
                    });
                    return report.fail(&task.name, error.to_string());
                }
                Err(AttemptError::Cancelled) => {
                    return report.skip(format!("cancelled while retrying {}", task.name));
                }
            }
        }

        info!(host = %self.host.hostname, tasks = total, "Host converged");
        report.converge()
    }

    async fn apply_with_retry(
        &self,
        task: &ConvergenceTask,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(TaskOutcome, u32), AttemptError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::time::timeout(
                self.config.task_timeout,
                self.executor.apply(&self.host, &self.credentials, task),
            )
            .await
            .unwrap_or(Err(ExecError::Timeout(self.config.task_timeout)));

            let error = match result {
                Ok(outcome) => return Ok((outcome, attempt)),
                Err(error) if error.is_transient() => error,
                Err(error) => {
                    return Err(AttemptError::Failed {
                        error,
                        attempts: attempt,
                    })
                }
            };

            let Some(delay) = self.config.retry.next_delay(attempt) else {
                return Err(AttemptError::Failed {
                    error,
                    attempts: attempt,
                });
            };

            warn!(
                host = %self.host.hostname,
                task = %task.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Err(AttemptError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::convergence::executor::{ExecFault, MockExecutor, TaskScope};
    use crate::inventory::{build, InventoryContext};
    use crate::provider::{MachineState, ProvisionedMachine};
    use crate::shutdown::never;
    use crate::spec::Topology;
    use kubelab_reconcile::BackoffPolicy;

    fn inventory(workers: u32) -> Inventory {
        let machines: Vec<_> = Topology::from_config(&TopologyConfig::default())
            .unwrap()
            .with_workers(workers)
            .expand()
            .unwrap()
            .into_iter()
            .map(|spec| ProvisionedMachine {
                state: MachineState::Running,
                ..ProvisionedMachine::requested(spec)
            })
            .collect();
        let context = InventoryContext {
            cluster_name: "test".to_string(),
            api_port: 6443,
            ssh_port: 22,
        };
        build(&machines, &context).unwrap()
    }

    fn tasks(names: &[&str]) -> Vec<ConvergenceTask> {
        names
            .iter()
            .map(|n| ConvergenceTask {
                name: n.to_string(),
                command: format!("do {n}"),
                scope: TaskScope::All,
            })
            .collect()
    }

    fn credentials() -> Credentials {
        Credentials {
            user: "vagrant".to_string(),
            private_key: None,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            max_parallel_hosts: 4,
            retry: RetryPolicy::new(
                3,
                BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)),
            ),
            task_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_all_hosts_converge() {
        let executor = Arc::new(MockExecutor::new());
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());

        let run = engine
            .run(RunId::new(), &inventory(2), &tasks(&["a", "b"]), &credentials(), never())
            .await;

        assert!(run.is_converged());
        assert_eq!(run.hosts.len(), 3);
        assert!(run.hosts.iter().all(|h| h.state == HostState::Converged));
        assert_eq!(executor.side_effects(), 6);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let executor =
            Arc::new(MockExecutor::new().with_fault("node1", "a", ExecFault::Transient(2)));
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());

        let run = engine
            .run(RunId::new(), &inventory(1), &tasks(&["a"]), &credentials(), never())
            .await;

        assert!(run.is_converged());
        assert_eq!(run.host("node1").unwrap().tasks[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_retries() {
        let executor =
            Arc::new(MockExecutor::new().with_fault("node1", "a", ExecFault::Transient(10)));
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());

        let run = engine
            .run(RunId::new(), &inventory(1), &tasks(&["a", "b"]), &credentials(), never())
            .await;

        let node1 = run.host("node1").unwrap();
        assert_eq!(node1.state, HostState::Failed);
        assert_eq!(node1.tasks.len(), 1);
        assert_eq!(node1.tasks[0].attempts, 3);
        assert!(run.host("master").unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_task_failure_not_retried() {
        let executor = Arc::new(MockExecutor::new().with_fault("master", "b", ExecFault::Fail(1)));
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());

        let run = engine
            .run(RunId::new(), &inventory(1), &tasks(&["a", "b", "c"]), &credentials(), never())
            .await;

        let master = run.host("master").unwrap();
        assert!(matches!(&master.outcome, HostOutcome::Failed { task, .. } if task == "b"));
        assert_eq!(master.tasks.len(), 2);
        assert_eq!(master.tasks[1].attempts, 1);
        assert!(!executor.has_started("master", "c"));
        assert_eq!(run.failed_hosts(), vec!["master".to_string()]);
        assert_eq!(run.converged_hosts(), vec!["node1".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let executor = Arc::new(
            MockExecutor::new().with_fault("node1", "a", ExecFault::Slow(Duration::from_secs(5))),
        );
        let config = EngineConfig {
            task_timeout: Duration::from_millis(20),
            retry: RetryPolicy::new(
                2,
                BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(1)),
            ),
            ..fast_config()
        };
        let engine = ConvergenceEngine::new(Arc::clone(&executor), config);

        let run = engine
            .run(RunId::new(), &inventory(1), &tasks(&["a"]), &credentials(), never())
            .await;

        let node1 = run.host("node1").unwrap();
        assert_eq!(node1.tasks[0].attempts, 2);
        assert!(matches!(&node1.outcome, HostOutcome::Failed { reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_scoped_tasks() {
        let executor = Arc::new(MockExecutor::new());
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());
        let mut plan = tasks(&["common"]);
        plan.push(ConvergenceTask {
            name: "init".into(),
            command: "kubeadm init".into(),
            scope: TaskScope::Control,
        });
        plan.push(ConvergenceTask {
            name: "join".into(),
            command: "kubeadm join".into(),
            scope: TaskScope::Workers,
        });

        let run = engine
            .run(RunId::new(), &inventory(1), &plan, &credentials(), never())
            .await;

        let names = |host: &str| -> Vec<String> {
            run.host(host).unwrap().tasks.iter().map(|t| t.task.clone()).collect()
        };
        assert_eq!(names("master"), vec!["common", "init"]);
        assert_eq!(names("node1"), vec!["common", "join"]);
    }

    #[tokio::test]
    async fn test_rerun_has_no_new_side_effects() {
        let executor = Arc::new(MockExecutor::new());
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());
        let inv = inventory(2);
        let plan = tasks(&["a", "b"]);

        engine.run(RunId::new(), &inv, &plan, &credentials(), never()).await;
        let effects = executor.side_effects();
        let rerun = engine.run(RunId::new(), &inv, &plan, &credentials(), never()).await;

        assert!(rerun.is_converged());
        assert_eq!(executor.side_effects(), effects);
        assert!(rerun.hosts.iter().all(|h| h.changed_count() == 0));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let executor = Arc::new(MockExecutor::new());
        let engine = ConvergenceEngine::new(Arc::clone(&executor), fast_config());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let run = engine
            .run(RunId::new(), &inventory(2), &tasks(&["a"]), &credentials(), rx)
            .await;

        assert!(run.cancelled);
        assert_eq!(run.skipped_hosts().len(), 3);
        assert!(run.hosts.iter().all(|h| h.state == HostState::Pending));
        assert_eq!(executor.calls(), 0);
    }
}
