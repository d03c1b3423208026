//! Local development bindings.
//!
//! File-backed implementations of [`Provider`](crate::provider::Provider) and
//! [`RemoteExecutor`](crate::convergence::RemoteExecutor) that let the CLI run
//! a full `up`/`down` cycle without a hypervisor or remote hosts.

pub mod executor;
pub mod provider;
pub mod resources;
pub mod store;

pub use executor::LocalExecutor;
pub use provider::LocalProvider;
pub use resources::HostResources;
pub use store::{LocalStore, StoreError, StoreState, StoredMachine, STATE_FILE};
