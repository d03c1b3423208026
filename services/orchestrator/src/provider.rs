//! Provider adapter interface and mock implementation.
//!
//! A provider turns a [`ResourceSpec`] into a running virtual machine. The
//! contract every implementation honours:
//!
//! - `create` is idempotent by machine name: the same spec returns the
//!   existing machine, a different spec fails with `SpecConflict`
//! - `destroy` of an unknown or already destroyed machine succeeds
//! - `Unavailable` is transient and retryable; every other error is fatal
//!
//! A mock implementation is provided for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kubelab_id::MachineId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::spec::ResourceSpec;

/// Provider errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider or transport failure; retryable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Host cannot fit the machine; not retryable.
    #[error("resources exhausted for {name}: {reason}")]
    ResourceExhausted { name: String, reason: String },

    /// A machine with this name exists with a different spec.
    #[error("machine {name} already exists with a different spec")]
    SpecConflict { name: String },

    /// No machine with this ID.
    #[error("machine not found: {0}")]
    NotFound(MachineId),
}

impl ProviderError {
    /// Returns true if the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Lifecycle state of a provisioned machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Requested,
    Creating,
    Running,
    Failed,
    Destroyed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    /// Returns true if the machine still holds compute resources.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Destroyed)
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine as known to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedMachine {
    pub id: MachineId,
    pub spec: ResourceSpec,
    pub state: MachineState,
    pub created_at: DateTime<Utc>,
}

impl ProvisionedMachine {
    /// New record for a just-requested machine.
    pub fn requested(spec: ResourceSpec) -> Self {
        Self {
            id: MachineId::new(),
            spec,
            state: MachineState::Requested,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// VM provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create (or return the existing) machine for `spec`.
    async fn create(&self, spec: &ResourceSpec) -> Result<ProvisionedMachine, ProviderError>;

    /// Destroy a machine and release its resources.
    async fn destroy(&self, id: &MachineId) -> Result<(), ProviderError>;

    /// Current lifecycle state of a machine.
    async fn inspect(&self, id: &MachineId) -> Result<MachineState, ProviderError>;

    /// All machines that still hold resources.
    async fn list(&self) -> Result<Vec<ProvisionedMachine>, ProviderError>;
}

/// Injected failure for [`MockProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Fail create with `Unavailable` this many times, then succeed.
    Unavailable(u32),
    /// Fail create with `ResourceExhausted`.
    Exhausted,
    /// Create succeeds but the machine boots into `Failed`.
    BootFailure,
    /// Create never completes.
    Hang,
    /// Destroy always fails with `Unavailable`.
    StuckOnDestroy,
}

#[derive(Default)]
struct MockState {
    /// Machines by name.
    machines: BTreeMap<String, ProvisionedMachine>,

    faults: HashMap<String, MockFault>,
}

/// In-memory provider for tests.
///
/// Machines start in `Creating` and move to `Running` (or `Failed`) on the
/// first `inspect`, so callers exercise their boot wait.
pub struct MockProvider {
    state: Mutex<MockState>,

    /// Host memory budget in MB; `None` is unlimited.
    capacity_mb: Option<u64>,

    create_delay: Duration,

    create_calls: AtomicU64,
    creates_in_flight: AtomicU64,
    peak_creates: AtomicU64,
    machines_created: AtomicU64,
    machines_destroyed: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            capacity_mb: None,
            create_delay: Duration::ZERO,
            create_calls: AtomicU64::new(0),
            creates_in_flight: AtomicU64::new(0),
            peak_creates: AtomicU64::new(0),
            machines_created: AtomicU64::new(0),
            machines_destroyed: AtomicU64::new(0),
        }
    }

    /// Limit total memory of live machines.
    pub fn with_capacity_mb(mut self, capacity_mb: u64) -> Self {
        self.capacity_mb = Some(capacity_mb);
        self
    }

    /// Delay every create call.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Inject a fault for the machine with this name.
    pub fn with_fault(mut self, name: &str, fault: MockFault) -> Self {
        self.state.get_mut().faults.insert(name.to_string(), fault);
        self
    }

    /// Number of `create` calls, including repeats and failures.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `create` calls running at once.
    pub fn peak_concurrent_creates(&self) -> u64 {
        self.peak_creates.load(Ordering::SeqCst)
    }

    /// Number of machines actually allocated.
    pub fn machines_created(&self) -> u64 {
        self.machines_created.load(Ordering::SeqCst)
    }

    /// Number of machines actually destroyed.
    pub fn machines_destroyed(&self) -> u64 {
        self.machines_destroyed.load(Ordering::SeqCst)
    }

    /// Names of machines still holding resources.
    pub async fn live_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .machines
            .values()
            .filter(|m| m.state.is_live())
            .map(|m| m.spec.name.clone())
            .collect()
    }
}

/// Decrements the in-flight create count when a create returns or is dropped.
struct CreateGuard<'a>(&'a AtomicU64);

impl Drop for CreateGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create(&self, spec: &ResourceSpec) -> Result<ProvisionedMachine, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.creates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_creates.fetch_max(running, Ordering::SeqCst);
        let _in_flight = CreateGuard(&self.creates_in_flight);

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let fault = {
            let mut state = self.state.lock().await;
            match state.faults.get_mut(&spec.name) {
                Some(MockFault::Unavailable(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(ProviderError::Unavailable(format!(
                        "[MOCK] transient failure creating {}",
                        spec.name
                    )));
                }
                Some(MockFault::Exhausted) => {
                    return Err(ProviderError::ResourceExhausted {
                        name: spec.name.clone(),
                        reason: "[MOCK] insufficient host memory".to_string(),
                    });
                }
                other => other.copied(),
            }
        };

        if fault == Some(MockFault::Hang) {
            debug!(name = %spec.name, "[MOCK] Create hanging");
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().await;

        if let Some(existing) = state.machines.get(&spec.name) {
            if existing.state.is_live() {
                if existing.spec != *spec {
                    return Err(ProviderError::SpecConflict {
                        name: spec.name.clone(),
                    });
                }
                debug!(name = %spec.name, id = %existing.id, "[MOCK] Machine already exists");
                return Ok(existing.clone());
            }
        }

        if let Some(capacity) = self.capacity_mb {
            let used: u64 = state
                .machines
                .values()
                .filter(|m| m.state.is_live())
                .map(|m| u64::from(m.spec.memory_mb))
                .sum();
            if used + u64::from(spec.memory_mb) > capacity {
                return Err(ProviderError::ResourceExhausted {
                    name: spec.name.clone(),
                    reason: format!(
                        "[MOCK] {} MB requested, {} of {} MB in use",
                        spec.memory_mb, used, capacity
                    ),
                });
            }
        }

        let mut machine = ProvisionedMachine::requested(spec.clone());
        machine.state = MachineState::Creating;

        info!(
            name = %spec.name,
            id = %machine.id,
            ip = %spec.ip,
            memory_mb = spec.memory_mb,
            vcpus = spec.vcpus,
            "[MOCK] Creating machine"
        );

        state.machines.insert(spec.name.clone(), machine.clone());
        self.machines_created.fetch_add(1, Ordering::SeqCst);
        Ok(machine)
    }

    async fn destroy(&self, id: &MachineId) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let MockState { machines, faults } = &mut *state;
        let Some(machine) = machines
            .values_mut()
            .find(|m| m.id == *id && m.state.is_live())
        else {
            return Ok(());
        };

        if faults.get(&machine.spec.name) == Some(&MockFault::StuckOnDestroy) {
            return Err(ProviderError::Unavailable(format!(
                "[MOCK] cannot destroy {}",
                machine.spec.name
            )));
        }

        info!(name = %machine.spec.name, id = %id, "[MOCK] Destroying machine");
        machine.state = MachineState::Destroyed;
        self.machines_destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect(&self, id: &MachineId) -> Result<MachineState, ProviderError> {
        let mut state = self.state.lock().await;
        let MockState { machines, faults } = &mut *state;

        let machine = machines
            .values_mut()
            .find(|m| m.id == *id)
            .ok_or(ProviderError::NotFound(*id))?;

        if machine.state == MachineState::Creating {
            machine.state = match faults.get(&machine.spec.name) {
                Some(MockFault::BootFailure) => MachineState::Failed,
                _ => MachineState::Running,
            };
        }

        Ok(machine.state)
    }

    async fn list(&self) -> Result<Vec<ProvisionedMachine>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .machines
            .values()
            .filter(|m| m.state.is_live())
            .cloned()
            .collect())
    }
}
