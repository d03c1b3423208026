//! Integration tests for the full `up` / `down` flow.
//!
//! Drives the orchestrator against MockProvider and MockExecutor.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use kubelab_orchestrator::convergence::ExecFault;
use kubelab_orchestrator::shutdown::never;
use kubelab_orchestrator::{
    ClusterConfig, ClusterStatus, HostOutcome, MockExecutor, MockFault, MockProvider,
    NodeRole, Orchestrator, OrchestratorError, ProvisioningPolicy,
};
use kubelab_reconcile::{BackoffPolicy, RetryPolicy};
use rstest::rstest;

fn config(workers: u32) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.topology.worker_count = workers;
    config
}

fn fast_policy() -> ProvisioningPolicy {
    ProvisioningPolicy {
        retry: RetryPolicy::new(
            3,
            BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)),
        ),
        boot_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(5),
        max_parallel: 0,
    }
}

fn orchestrator(
    workers: u32,
    provider: &Arc<MockProvider>,
    executor: &Arc<MockExecutor>,
) -> Orchestrator<MockProvider, MockExecutor> {
    Orchestrator::new(config(workers), Arc::clone(provider), Arc::clone(executor))
        .with_policy(fast_policy())
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(5)]
fn test_plan_has_one_spec_per_node(#[case] workers: u32) {
    let orch = orchestrator(
        workers,
        &Arc::new(MockProvider::new()),
        &Arc::new(MockExecutor::new()),
    );

    let specs = orch.plan().unwrap();
    assert_eq!(specs.len(), workers as usize + 1);
    assert_eq!(specs[0].role, NodeRole::Control);
}

#[tokio::test]
async fn test_up_assigns_static_addresses() {
    let provider = Arc::new(MockProvider::new());
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    let report = orch.up(never()).await.unwrap();

    assert_eq!(report.status, ClusterStatus::Ready);
    let addresses: Vec<(String, Ipv4Addr)> = report
        .hosts
        .iter()
        .map(|h| (h.hostname.clone(), h.address))
        .collect();
    assert_eq!(
        addresses,
        vec![
            ("master".to_string(), Ipv4Addr::new(10, 10, 2, 10)),
            ("node1".to_string(), Ipv4Addr::new(10, 10, 2, 21)),
            ("node2".to_string(), Ipv4Addr::new(10, 10, 2, 22)),
        ]
    );
    assert_eq!(report.created, vec!["master", "node1", "node2"]);
}

#[tokio::test]
async fn test_second_up_is_a_noop() {
    let provider = Arc::new(MockProvider::new());
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    let first = orch.up(never()).await.unwrap();
    let effects = executor.side_effects();
    assert!(effects > 0);

    let second = orch.up(never()).await.unwrap();

    assert!(first.status.is_ready() && second.status.is_ready());
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(provider.machines_created(), 3);
    assert_eq!(executor.side_effects(), effects);
    assert!(second.created.is_empty());
    assert!(second.hosts.iter().all(|h| h.changed_count() == 0));
}

#[tokio::test]
async fn test_resource_exhausted_never_converges() {
    let provider = Arc::new(MockProvider::new().with_fault("node2", MockFault::Exhausted));
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    let err = orch.up(never()).await.unwrap_err();

    match err {
        OrchestratorError::ResourceExhausted { spec, .. } => {
            assert_eq!(spec.name, "node2");
            assert_eq!(spec.memory_mb, 2048);
        }
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }
    assert_eq!(executor.calls(), 0);
    assert!(provider.live_names().await.is_empty());
}

#[tokio::test]
async fn test_capacity_exhaustion_is_fatal() {
    let provider = Arc::new(MockProvider::new().with_capacity_mb(5000));
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    let err = orch.up(never()).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    assert_eq!(executor.calls(), 0);
    assert!(provider.live_names().await.is_empty());
}

#[tokio::test]
async fn test_one_failed_host_degrades_cluster() {
    let provider = Arc::new(MockProvider::new());
    let executor =
        Arc::new(MockExecutor::new().with_fault("node1", "kube-packages", ExecFault::Fail(100)));
    let orch = orchestrator(2, &provider, &executor);

    let report = orch.up(never()).await.unwrap();

    assert_eq!(
        report.status,
        ClusterStatus::Degraded {
            failed: vec!["node1".to_string()],
            skipped: vec![],
        }
    );
    assert_eq!(report.status.exit_code(), 1);

    for host in &report.hosts {
        match host.hostname.as_str() {
            "node1" => assert!(matches!(
                &host.outcome,
                HostOutcome::Failed { task, .. } if task == "kube-packages"
            )),
            _ => assert_eq!(host.outcome, HostOutcome::Converged),
        }
    }
}

#[tokio::test]
async fn test_rollback_keeps_preexisting_machines() {
    let provider = Arc::new(MockProvider::new().with_fault("node3", MockFault::Exhausted));
    let executor = Arc::new(MockExecutor::new());

    orchestrator(1, &provider, &executor).up(never()).await.unwrap();

    let err = orchestrator(3, &provider, &executor)
        .up(never())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    assert_eq!(provider.live_names().await, vec!["master", "node1"]);
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
    let provider = Arc::new(MockProvider::new().with_fault("node1", MockFault::Unavailable(2)));
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    let report = orch.up(never()).await.unwrap();

    assert!(report.status.is_ready());
    assert_eq!(provider.machines_created(), 3);
}

#[tokio::test]
async fn test_down_after_up() {
    let provider = Arc::new(MockProvider::new());
    let executor = Arc::new(MockExecutor::new());
    let orch = orchestrator(2, &provider, &executor);

    orch.up(never()).await.unwrap();
    let report = orch.down().await.unwrap();

    assert_eq!(report.destroyed.len(), 3);
    assert_eq!(provider.machines_destroyed(), 3);
    assert!(orch.down().await.unwrap().destroyed.is_empty());
}

#[tokio::test]
async fn test_shrinking_topology_removes_extra_workers() {
    let provider = Arc::new(MockProvider::new());
    let executor = Arc::new(MockExecutor::new());

    orchestrator(3, &provider, &executor).up(never()).await.unwrap();
    let orch = orchestrator(1, &provider, &executor);
    let report = orch.up(never()).await.unwrap();

    assert!(report.status.is_ready());
    assert_eq!(report.removed, vec!["node3", "node2"]);
    assert!(report.created.is_empty());
    assert_eq!(provider.live_names().await, vec!["master", "node1"]);

    let hosts: Vec<String> = orch
        .inventory()
        .await
        .unwrap()
        .entries()
        .iter()
        .map(|e| e.hostname.clone())
        .collect();
    assert_eq!(hosts, vec!["master", "node1"]);
}

#[tokio::test]
async fn test_stale_machine_that_survives_degrades_cluster() {
    let provider = Arc::new(MockProvider::new().with_fault("node2", MockFault::StuckOnDestroy));
    let executor = Arc::new(MockExecutor::new());

    orchestrator(2, &provider, &executor).up(never()).await.unwrap();
    let report = orchestrator(1, &provider, &executor)
        .up(never())
        .await
        .unwrap();

    assert_eq!(
        report.status,
        ClusterStatus::Degraded {
            failed: vec![],
            skipped: vec!["node2".to_string()],
        }
    );
    assert!(report.removed.is_empty());

    let node2 = report
        .hosts
        .iter()
        .find(|h| h.hostname == "node2")
        .unwrap();
    assert!(matches!(
        &node2.outcome,
        HostOutcome::Skipped { reason } if reason.starts_with("not in topology")
    ));
    assert_eq!(provider.live_names().await, vec!["master", "node1", "node2"]);
}

#[rstest]
#[case(1)]
#[case(2)]
#[tokio::test]
async fn test_provisioning_respects_parallel_limit(#[case] limit: usize) {
    let provider = Arc::new(MockProvider::new().with_create_delay(Duration::from_millis(20)));
    let executor = Arc::new(MockExecutor::new());
    let policy = ProvisioningPolicy {
        max_parallel: limit,
        ..fast_policy()
    };
    let orch = Orchestrator::new(config(4), Arc::clone(&provider), Arc::clone(&executor))
        .with_policy(policy);

    let report = orch.up(never()).await.unwrap();

    assert!(report.status.is_ready());
    assert_eq!(provider.machines_created(), 5);
    assert_eq!(provider.peak_concurrent_creates(), limit as u64);
}
