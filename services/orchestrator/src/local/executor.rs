//! Local executor: records applied tasks instead of running them remotely.
//!
//! A task is considered applied to a host when the store holds a marker whose
//! fingerprint matches the task command and the host variables. Changing
//! either re-applies the task on the next run.

use std::sync::Arc;

use async_trait::async_trait;
use kubelab_reconcile::SpecHash;
use serde_json::json;
use tracing::{debug, info};

use super::store::{LocalStore, StoreError};
use crate::convergence::{ConvergenceTask, Credentials, ExecError, RemoteExecutor, TaskOutcome};
use crate::inventory::InventoryEntry;

pub struct LocalExecutor {
    store: Arc<LocalStore>,
}

impl LocalExecutor {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }
}

fn fingerprint(host: &InventoryEntry, task: &ConvergenceTask) -> SpecHash {
    SpecHash::from_json(&json!({
        "command": task.command,
        "vars": host.vars,
    }))
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn apply(
        &self,
        host: &InventoryEntry,
        credentials: &Credentials,
        task: &ConvergenceTask,
    ) -> Result<TaskOutcome, ExecError> {
        let hash = fingerprint(host, task);
        let transport = |e: StoreError| ExecError::Transport(e.to_string());

        if self.store.marker(&host.hostname, &task.name).map_err(transport)? == Some(hash.clone()) {
            debug!(host = %host.hostname, task = %task.name, "Task already applied");
            return Ok(TaskOutcome::Unchanged);
        }

        info!(
            host = %host.hostname,
            address = %host.address,
            port = host.port,
            user = %credentials.user,
            task = %task.name,
            command = %task.render(&host.vars),
            "Applying task"
        );

        self.store
            .update(|state| {
                state
                    .markers
                    .entry(host.hostname.clone())
                    .or_default()
                    .insert(task.name.clone(), hash);
            })
            .map_err(transport)?;

        Ok(TaskOutcome::Changed)
    }
}
