//! Remote execution interface and mock implementation.
//!
//! An executor applies one [`ConvergenceTask`] to one host. Tasks carry their
//! own precondition: an executor reports `Unchanged` when the host already
//! matches, so applying a task twice has the same effect as applying it once.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::inventory::{HostVars, InventoryEntry};
use crate::spec::NodeRole;

/// Which hosts a task applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    #[default]
    All,
    Control,
    Workers,
}

/// An idempotent unit of configuration work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvergenceTask {
    pub name: String,

    /// Command template; `{{ var }}` placeholders are filled from host vars.
    pub command: String,

    #[serde(default)]
    pub scope: TaskScope,
}

impl ConvergenceTask {
    pub fn applies_to(&self, role: NodeRole) -> bool {
        match self.scope {
            TaskScope::All => true,
            TaskScope::Control => role == NodeRole::Control,
            TaskScope::Workers => role == NodeRole::Worker,
        }
    }

    /// Command with host variables substituted.
    pub fn render(&self, vars: &HostVars) -> String {
        render_template(&self.command, vars)
    }
}

/// Substitute `{{ name }}` placeholders; unknown names are left as-is.
pub fn render_template(template: &str, vars: &HostVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + len].trim();
        out.push_str(&rest[..start]);

        match vars.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + len + 2]),
        }

        rest = &rest[start + len + 2..];
    }

    out.push_str(rest);
    out
}

/// Login material for remote hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub private_key: Option<PathBuf>,
}

/// Result of a successfully applied task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The host was modified.
    Changed,
    /// The host already matched; nothing was done.
    Unchanged,
}

/// Task execution errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("task exited with code {exit_code}: {message}")]
    TaskFailed { exit_code: i32, message: String },
}

impl ExecError {
    /// Connection-level failures are retried; task failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Remote execution interface.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Apply `task` to `host`. Must be safe to call again after success.
    async fn apply(
        &self,
        host: &InventoryEntry,
        credentials: &Credentials,
        task: &ConvergenceTask,
    ) -> Result<TaskOutcome, ExecError>;
}

// =============================================================================
// Mock executor
// =============================================================================

/// Injected behaviour for a (host, task) pair in [`MockExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFault {
    /// Fail with a non-zero exit code.
    Fail(i32),
    /// Fail with a transport error this many times, then succeed.
    Transient(u32),
    /// Take this long to complete.
    Slow(Duration),
}

/// Start/finish marker recorded by [`MockExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started { host: String, task: String },
    Finished { host: String, task: String },
}

#[derive(Default)]
struct MockExecState {
    faults: HashMap<(String, String), ExecFault>,
    applied: HashSet<(String, String)>,
    events: Vec<ExecEvent>,
}

/// In-memory executor for tests.
///
/// Remembers which tasks were applied to which host; repeats report
/// `Unchanged` and do not count as side effects.
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<MockExecState>,
    side_effects: AtomicU64,
    calls: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(self, host: &str, task: &str, fault: ExecFault) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .faults
                .insert((host.to_string(), task.to_string()), fault);
        }
        self
    }

    /// Tasks that actually changed a host.
    pub fn side_effects(&self) -> u64 {
        self.side_effects.load(Ordering::SeqCst)
    }

    /// All `apply` calls, including retries and no-ops.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Recorded start/finish events in order.
    pub fn events(&self) -> Vec<ExecEvent> {
        self.state.lock().map(|s| s.events.clone()).unwrap_or_default()
    }

    /// Events for one host.
    pub fn host_events(&self, host: &str) -> Vec<ExecEvent> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                ExecEvent::Started { host: h, .. } | ExecEvent::Finished { host: h, .. } => h == host,
            })
            .collect()
    }

    /// Returns true once `task` has started on `host`.
    pub fn has_started(&self, host: &str, task: &str) -> bool {
        self.events().iter().any(|e| {
            matches!(e, ExecEvent::Started { host: h, task: t } if h == host && t == task)
        })
    }

    fn record(&self, event: ExecEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.events.push(event);
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn apply(
        &self,
        host: &InventoryEntry,
        _credentials: &Credentials,
        task: &ConvergenceTask,
    ) -> Result<TaskOutcome, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (host.hostname.clone(), task.name.clone());

        self.record(ExecEvent::Started {
            host: key.0.clone(),
            task: key.1.clone(),
        });

        let fault = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ExecError::Transport("[MOCK] state poisoned".to_string()))?;
            match state.faults.get_mut(&key) {
                Some(ExecFault::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(ExecError::Transport("[MOCK] connection reset".to_string()));
                }
                other => other.copied(),
            }
        };

        match fault {
            Some(ExecFault::Fail(exit_code)) => {
                self.record(ExecEvent::Finished {
                    host: key.0.clone(),
                    task: key.1.clone(),
                });
                return Err(ExecError::TaskFailed {
                    exit_code,
                    message: format!("[MOCK] {} failed on {}", task.name, host.hostname),
                });
            }
            Some(ExecFault::Slow(delay)) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let first_time = self
            .state
            .lock()
            .map(|mut s| s.applied.insert(key.clone()))
            .unwrap_or(false);

        let outcome = if first_time {
            self.side_effects.fetch_add(1, Ordering::SeqCst);
            info!(
                host = %host.hostname,
                task = %task.name,
                command = %task.render(&host.vars),
                "[MOCK] Applied task"
            );
            TaskOutcome::Changed
        } else {
            debug!(host = %host.hostname, task = %task.name, "[MOCK] Task already applied");
            TaskOutcome::Unchanged
        };

        self.record(ExecEvent::Finished {
            host: key.0,
            task: key.1,
        });
        Ok(outcome)
    }
}
