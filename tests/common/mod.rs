#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_provisioner::cluster::{ClusterOrchestrator, FailurePolicy, OrchestratorConfig};
use cluster_provisioner::core::errors::ProvisionResult;
use cluster_provisioner::core::fake::FakeHypervisor;
use cluster_provisioner::core::hypervisor::Hypervisor;
use cluster_provisioner::core::lifecycle::{LeasePolicy, VmLifecycleManager};
use cluster_provisioner::core::spec::{
    ClusterSpec, NetworkSpec, NodeSpec, ResourceKind, ResourceRequest, UserSpec,
};
use cluster_provisioner::remote::{
    CommandOutput, RemoteExecutor, RemoteSession, RetryPolicy, SshTarget, Transport,
};

pub const NETWORK: &str = "cluster-net";
pub const POOL: &str = "default";
pub const JOIN_LINE: &str = "kubeadm join 192.168.122.10:6443 --token abcdef.0123456789abcdef";

/// Addresses the fake hands out, in define order.
pub fn address(index: u8) -> String {
    format!("192.168.122.{}", 10 + index)
}

pub fn node(name: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        resources: vec![
            ResourceRequest::new(ResourceKind::Cpu, 2),
            ResourceRequest::new(ResourceKind::Ram, 4).with_unit("GiB"),
        ],
        network: NetworkSpec {
            name: NETWORK.to_string(),
            cidr: "192.168.122.0/24".to_string(),
            gateway: Some("192.168.122.1".to_string()),
            dns_servers: vec![],
        },
        user: UserSpec {
            name: "ops".to_string(),
            sudo: true,
            ssh_public_key_path: None,
            ssh_public_key: None,
        },
        disk_size_gb: 20,
        image: None,
    }
}

pub fn cluster(head: &str, workers: &[&str]) -> ClusterSpec {
    ClusterSpec {
        name: "bench".to_string(),
        head_nodes: vec![node(head)],
        compute_nodes: workers.iter().map(|w| node(w)).collect(),
    }
}

pub fn hypervisor() -> Arc<FakeHypervisor> {
    Arc::new(FakeHypervisor::new().with_network(NETWORK))
}

#[derive(Debug, Default)]
struct Script {
    unreachable: HashSet<String>,
    failing: HashMap<String, (u32, String)>,
    probes: HashMap<String, u32>,
    opens: Vec<String>,
    closes: u32,
    commands: Vec<(String, String)>,
}

/// Transport that never touches the network. The head's credential command
/// prints [`JOIN_LINE`]; everything else prints nothing.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.lock().unreachable.insert(host.to_string());
        self
    }

    pub fn failing(self, host: &str, status: u32, stderr: &str) -> Self {
        self.lock()
            .failing
            .insert(host.to_string(), (status, stderr.to_string()));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.lock().commands.clone()
    }

    pub fn opens(&self) -> Vec<String> {
        self.lock().opens.clone()
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    pub fn probes(&self, host: &str) -> u32 {
        self.lock().probes.get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn probe(&self, target: &SshTarget) -> bool {
        let mut script = self.lock();
        *script.probes.entry(target.host.clone()).or_default() += 1;
        !script.unreachable.contains(&target.host)
    }

    async fn open(&self, target: &SshTarget) -> ProvisionResult<Box<dyn RemoteSession>> {
        self.lock().opens.push(target.host.clone());
        Ok(Box::new(ScriptedSession {
            host: target.host.clone(),
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(&mut self, command: &str) -> ProvisionResult<CommandOutput> {
        let mut script = self.script.lock().unwrap();
        script.commands.push((self.host.clone(), command.to_string()));
        if let Some((status, stderr)) = script.failing.get(&self.host) {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: stderr.clone(),
                exit_status: *status,
            });
        }
        let stdout = if command.contains("token create") {
            format!("{JOIN_LINE}\n")
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_status: 0,
        })
    }

    async fn close(self: Box<Self>) {
        self.script.lock().unwrap().closes += 1;
    }
}

pub fn quick_readiness() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(20),
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(4),
    }
}

pub fn lifecycle(hypervisor: &Arc<FakeHypervisor>) -> VmLifecycleManager {
    let hypervisor: Arc<dyn Hypervisor> = hypervisor.clone();
    VmLifecycleManager::new(hypervisor, POOL, LeasePolicy::default())
}

pub fn orchestrator(
    hypervisor: &Arc<FakeHypervisor>,
    transport: &ScriptedTransport,
    on_failure: FailurePolicy,
) -> ClusterOrchestrator {
    let transport: Arc<dyn Transport> = Arc::new(transport.clone());
    ClusterOrchestrator::new(
        lifecycle(hypervisor),
        RemoteExecutor::new(transport),
        OrchestratorConfig {
            readiness: quick_readiness(),
            on_failure,
            ..Default::default()
        },
    )
}
