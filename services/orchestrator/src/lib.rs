//! kubelab Orchestrator Library
//!
//! Brings up a multi-node cluster of virtual machines from a declarative
//! topology and converges every node to a configured state.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── spec         (Topology -> ResourceSpecs, pure)
//! ├── Provider     (create / destroy / inspect / list VMs)
//! ├── inventory    (Running machines -> reachable hosts + vars)
//! └── ConvergenceEngine
//!     └── RemoteExecutor (one idempotent task on one host)
//! ```
//!
//! Provisioning runs concurrently across nodes; convergence starts only once
//! every machine is running.
//!
//! ## Modules
//!
//! - `config`: TOML cluster configuration
//! - `spec`: resource spec model and topology expansion
//! - `provider`: provider interface and mock provider
//! - `inventory`: inventory builder
//! - `convergence`: convergence engine, executor interface and mock executor
//! - `orchestrator`: the `up` / `down` sequence
//! - `local`: file-backed provider and executor for local use

pub mod config;
pub mod convergence;
pub mod inventory;
pub mod local;
pub mod orchestrator;
pub mod provider;
pub mod shutdown;
pub mod spec;

// Re-export commonly used types
pub use config::{ClusterConfig, ConfigError};
pub use convergence::{
    ConvergenceEngine, ConvergenceRun, ConvergenceTask, Credentials, EngineConfig, ExecError,
    HostOutcome, HostReport, MockExecutor, RemoteExecutor, TaskOutcome, TaskScope,
};
pub use inventory::{Inventory, InventoryContext, InventoryEntry, InventoryError};
pub use orchestrator::{
    ClusterReport, ClusterStatus, Orchestrator, OrchestratorError, ProvisioningPolicy,
    TeardownReport,
};
pub use provider::{MachineState, MockFault, MockProvider, ProvisionedMachine, Provider, ProviderError};
pub use spec::{InvalidSpecError, NodeRole, ResourceSpec, Topology};
