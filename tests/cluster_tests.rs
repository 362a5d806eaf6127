mod common;

use cluster_provisioner::cluster::{ClusterStage, FailurePolicy};
use cluster_provisioner::core::errors::ProvisionError;
use cluster_provisioner::core::fake::Call;

use common::{address, cluster, orchestrator, ScriptedTransport, JOIN_LINE, POOL};

const TOKEN_COMMAND: &str = "sudo kubeadm token create --print-join-command";

fn defined(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::DefineAndStart(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn head_then_workers_in_order_with_extracted_credential() -> anyhow::Result<()> {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new();
    let spec = cluster("head-1", &["worker-1", "worker-2"]);

    let report = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await?;

    assert_eq!(defined(&hv.calls()), vec!["head-1", "worker-1", "worker-2"]);
    assert_eq!(
        transport.commands(),
        vec![
            (address(0), TOKEN_COMMAND.to_string()),
            (address(1), format!("sudo {JOIN_LINE}")),
            (address(2), format!("sudo {JOIN_LINE}")),
        ]
    );

    assert_eq!(report.stage, ClusterStage::Joined);
    assert_eq!(report.head.name, "head-1");
    assert_eq!(report.head.address.to_string(), address(0));
    let workers: Vec<(String, String)> = report
        .workers
        .iter()
        .map(|w| (w.name.clone(), w.address.to_string()))
        .collect();
    assert_eq!(
        workers,
        vec![
            ("worker-1".to_string(), address(1)),
            ("worker-2".to_string(), address(2)),
        ]
    );

    // every session is closed, and the hypervisor connection released
    assert_eq!(transport.closes() as usize, transport.opens().len());
    assert!(!hv.is_connected());
    Ok(())
}

#[tokio::test]
async fn cluster_without_workers_is_just_the_head() -> anyhow::Result<()> {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new();

    let report = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&cluster("solo", &[]))
        .await?;

    assert!(report.workers.is_empty());
    assert_eq!(transport.commands().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_worker_stops_the_run_as_partial_cluster() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new().unreachable(&address(1));
    let spec = cluster("head-1", &["worker-1", "worker-2"]);

    let err = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::PartialCluster {
            cluster,
            ready,
            failed_node,
            ..
        } => {
            assert_eq!(cluster, "bench");
            assert_eq!(ready, &vec!["head-1".to_string()]);
            assert_eq!(failed_node, "worker-1");
        }
        other => panic!("unexpected {other:?}"),
    }
    match err.root_cause() {
        ProvisionError::ReadinessTimeout { host, elapsed } => {
            assert_eq!(host, &address(1));
            assert_eq!(elapsed.as_secs(), 20);
        }
        other => panic!("unexpected root cause {other:?}"),
    }

    assert_eq!(
        hv.count(|c| matches!(c, Call::CreateVolume(v) if v == "worker-2_disk")),
        0
    );
    assert_eq!(
        hv.count(|c| matches!(c, Call::DefineAndStart(n) if n == "worker-2")),
        0
    );
    // join never attempted on the unreachable worker
    assert!(transport.commands().iter().all(|(host, _)| host != &address(1)));
    // default policy leaves everything in place
    assert!(hv.domain_exists("head-1"));
    assert!(hv.domain_exists("worker-1"));
}

#[tokio::test]
async fn failed_join_command_is_partial_with_remote_status() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new().failing(&address(2), 1, "preflight checks failed");
    let spec = cluster("head-1", &["worker-1", "worker-2"]);

    let err = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::PartialCluster {
            ready, failed_node, ..
        } => {
            assert_eq!(ready, &vec!["head-1".to_string(), "worker-1".to_string()]);
            assert_eq!(failed_node, "worker-2");
        }
        other => panic!("unexpected {other:?}"),
    }
    match err.root_cause() {
        ProvisionError::RemoteCommand { status, stderr, .. } => {
            assert_eq!(*status, 1);
            assert_eq!(stderr, "preflight checks failed");
        }
        other => panic!("unexpected root cause {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_head_is_not_partial() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new().unreachable(&address(0));
    let spec = cluster("head-1", &["worker-1"]);

    let err = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    assert!(!err.is_partial());
    match &err {
        ProvisionError::Node { node, stage, .. } => {
            assert_eq!(node, "head-1");
            assert_eq!(*stage, ClusterStage::HeadProvisioning);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(defined(&hv.calls()), vec!["head-1"]);
    assert!(transport.commands().is_empty());
}

#[tokio::test]
async fn failed_credential_command_is_reported_at_head_ready() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new().failing(&address(0), 127, "kubeadm: not found");
    let spec = cluster("head-1", &["worker-1"]);

    let err = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    match &err {
        ProvisionError::Node { stage, source, .. } => {
            assert_eq!(*stage, ClusterStage::HeadReady);
            assert!(matches!(**source, ProvisionError::RemoteCommand { status: 127, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(defined(&hv.calls()), vec!["head-1"]);
}

#[tokio::test]
async fn invalid_cluster_touches_nothing() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new();
    let mut spec = cluster("head-1", &["dup"]);
    spec.compute_nodes.push(common::node("dup"));

    let err = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::InvalidSpec(_)), "unexpected {err:?}");
    assert!(hv.calls().is_empty());
    assert!(transport.opens().is_empty());
}

#[tokio::test]
async fn zero_cpu_head_touches_nothing() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new();
    let mut spec = cluster("head-1", &["worker-1"]);
    spec.head_nodes[0].resources[0].amount = 0;

    let err = orchestrator(&hv, &transport, FailurePolicy::Teardown)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::InvalidSpec(_)), "unexpected {err:?}");
    assert!(hv.calls().is_empty());
    assert!(!hv.volume_exists(POOL, "head-1_disk"));
}

#[tokio::test(start_paused = true)]
async fn teardown_policy_removes_created_nodes() {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new().unreachable(&address(1));
    let spec = cluster("head-1", &["worker-1", "worker-2"]);

    let err = orchestrator(&hv, &transport, FailurePolicy::Teardown)
        .provision_cluster(&spec)
        .await
        .unwrap_err();

    assert!(err.is_partial());
    assert!(!hv.domain_exists("head-1"));
    assert!(!hv.domain_exists("worker-1"));
    assert_eq!(hv.volume_count(POOL), 0);
    assert!(!hv.is_connected());
}

#[tokio::test]
async fn delete_cluster_reports_each_node_once() -> anyhow::Result<()> {
    let hv = common::hypervisor();
    let transport = ScriptedTransport::new();
    let orchestrator = orchestrator(&hv, &transport, FailurePolicy::Leave);
    orchestrator
        .provision_cluster(&cluster("head-1", &["worker-1"]))
        .await?;

    let results = orchestrator
        .delete_cluster(&cluster("head-1", &["worker-1", "worker-2"]))
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results["head-1"], true);
    assert_eq!(results["worker-1"], true);
    assert_eq!(results["worker-2"], false);
    assert_eq!(hv.count(|c| matches!(c, Call::Lookup(_))), 3);
    assert_eq!(hv.volume_count(POOL), 0);
    Ok(())
}

#[tokio::test]
async fn delete_cluster_keeps_going_when_the_hypervisor_refuses() {
    let hv = std::sync::Arc::new(
        cluster_provisioner::core::fake::FakeHypervisor::new().refusing_connections(),
    );
    let transport = ScriptedTransport::new();

    let results = orchestrator(&hv, &transport, FailurePolicy::Leave)
        .delete_cluster(&cluster("head-1", &["worker-1"]))
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.values().all(|deleted| !deleted));
    assert_eq!(hv.count(|c| matches!(c, Call::Connect)), 2);
}
