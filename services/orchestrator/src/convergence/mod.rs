//! Convergence: applying ordered, idempotent tasks to inventory hosts.
//!
//! ## Modules
//!
//! - `executor`: remote execution interface, task model, mock executor
//! - `engine`: per-host state machine and bounded worker pool

pub mod engine;
pub mod executor;

pub use engine::{
    ConvergenceEngine, ConvergenceRun, EngineConfig, HostOutcome, HostReport, HostState,
    TaskRecord, TaskResult,
};
pub use executor::{
    render_template, ConvergenceTask, Credentials, ExecError, ExecEvent, ExecFault, MockExecutor,
    RemoteExecutor, TaskOutcome, TaskScope,
};
