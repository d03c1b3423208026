//! Local provider: machine records persisted in the state store.
//!
//! No hypervisor is driven; a machine is "running" as soon as its record is
//! written. Capacity is checked against the host's available memory, so an
//! oversized topology still fails with `ResourceExhausted`.

use std::sync::Arc;

use async_trait::async_trait;
use kubelab_id::MachineId;
use kubelab_reconcile::SpecHash;
use tracing::{debug, info};

use super::resources::HostResources;
use super::store::{LocalStore, StoreError, StoredMachine};
use crate::provider::{MachineState, ProvisionedMachine, Provider, ProviderError};
use crate::spec::ResourceSpec;

impl From<StoreError> for ProviderError {
    fn from(err: StoreError) -> Self {
        ProviderError::Unavailable(err.to_string())
    }
}

pub struct LocalProvider {
    store: Arc<LocalStore>,
    available_memory_mb: u64,
}

impl LocalProvider {
    /// Provider limited by the memory currently available on this host.
    pub fn new(store: Arc<LocalStore>) -> Self {
        let resources = HostResources::measure();
        debug!(
            cpu_cores = resources.cpu_cores,
            available_memory_mb = resources.available_memory_mb,
            "Measured host resources"
        );
        Self::with_available_memory_mb(store, resources.available_memory_mb)
    }

    pub fn with_available_memory_mb(store: Arc<LocalStore>, available_memory_mb: u64) -> Self {
        Self {
            store,
            available_memory_mb,
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn create(&self, spec: &ResourceSpec) -> Result<ProvisionedMachine, ProviderError> {
        let spec_hash =
            SpecHash::of(spec).map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let capacity = self.available_memory_mb;

        self.store.update(|state| {
            if let Some(existing) = state.machines.get(&spec.name) {
                if existing.spec_hash != spec_hash {
                    return Err(ProviderError::SpecConflict {
                        name: spec.name.clone(),
                    });
                }
                debug!(name = %spec.name, id = %existing.machine.id, "Machine already exists");
                return Ok(existing.machine.clone());
            }

            let used: u64 = state
                .machines
                .values()
                .map(|m| u64::from(m.machine.spec.memory_mb))
                .sum();
            if used + u64::from(spec.memory_mb) > capacity {
                return Err(ProviderError::ResourceExhausted {
                    name: spec.name.clone(),
                    reason: format!(
                        "{} MB requested, {used} MB allocated, {capacity} MB available on host",
                        spec.memory_mb
                    ),
                });
            }

            let mut machine = ProvisionedMachine::requested(spec.clone());
            machine.state = MachineState::Running;
            info!(name = %spec.name, id = %machine.id, ip = %spec.ip, "Created local machine");

            state.machines.insert(
                spec.name.clone(),
                StoredMachine {
                    machine: machine.clone(),
                    spec_hash: spec_hash.clone(),
                },
            );
            Ok(machine)
        })?
    }

    async fn destroy(&self, id: &MachineId) -> Result<(), ProviderError> {
        self.store.update(|state| {
            let name = state
                .machines
                .iter()
                .find(|(_, m)| m.machine.id == *id)
                .map(|(name, _)| name.clone());

            if let Some(name) = name {
                info!(name = %name, id = %id, "Destroyed local machine");
                state.machines.remove(&name);
                state.markers.remove(&name);
            }
        })?;
        Ok(())
    }

    async fn inspect(&self, id: &MachineId) -> Result<MachineState, ProviderError> {
        let state = self.store.snapshot()?;
        state
            .machines
            .values()
            .find(|m| m.machine.id == *id)
            .map(|m| m.machine.state)
            .ok_or(ProviderError::NotFound(*id))
    }

    async fn list(&self) -> Result<Vec<ProvisionedMachine>, ProviderError> {
        let state = self.store.snapshot()?;
        Ok(state.machines.into_values().map(|m| m.machine).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::spec::Topology;
    use tempfile::TempDir;

    fn specs() -> Vec<ResourceSpec> {
        Topology::from_config(&TopologyConfig::default())
            .unwrap()
            .expand()
            .unwrap()
    }

    fn provider(dir: &TempDir, memory_mb: u64) -> LocalProvider {
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        LocalProvider::with_available_memory_mb(store, memory_mb)
    }

    #[tokio::test]
    async fn test_create_persists_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let spec = &specs()[0];

        let first = provider(&dir, 8192).create(spec).await.unwrap();
        // A fresh provider over the same directory sees the same machine.
        let second = provider(&dir, 8192).create(spec).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.state, MachineState::Running);
    }

    #[tokio::test]
    async fn test_changed_spec_conflicts() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir, 8192);
        let mut spec = specs()[1].clone();
        p.create(&spec).await.unwrap();

        spec.vcpus = 4;
        let err = p.create(&spec).await.unwrap_err();
        assert!(matches!(err, ProviderError::SpecConflict { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_when_host_too_small() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir, 3000);
        let specs = specs();

        p.create(&specs[0]).await.unwrap();
        let err = p.create(&specs[1]).await.unwrap_err();
        assert!(matches!(err, ProviderError::ResourceExhausted { ref name, .. } if name == "node1"));
        assert_eq!(p.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_clears_markers() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir, 8192);
        let machine = p.create(&specs()[1]).await.unwrap();
        p.store
            .update(|s| {
                s.markers
                    .entry("node1".into())
                    .or_default()
                    .insert("t".into(), SpecHash::of("x").unwrap());
            })
            .unwrap();

        p.destroy(&machine.id).await.unwrap();
        p.destroy(&machine.id).await.unwrap();

        assert!(p.list().await.unwrap().is_empty());
        assert_eq!(p.store.marker("node1", "t").unwrap(), None);
        assert!(matches!(
            p.inspect(&machine.id).await,
            Err(ProviderError::NotFound(_))
        ));
    }
}
