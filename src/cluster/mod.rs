use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::core::cloud_init::GenisoimageSeeder;
use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::hypervisor::Hypervisor;
use crate::core::lifecycle::VmLifecycleManager;
use crate::core::spec::{ClusterSpec, NodeSpec};
use crate::remote::{RemoteExecutor, RetryPolicy, SshTarget, Transport};

/// Where a cluster provisioning run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterStage {
    NotStarted,
    HeadProvisioning,
    HeadReady,
    TokenExtracted,
    WorkersProvisioning,
    Joined,
}

impl fmt::Display for ClusterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterStage::NotStarted => "not-started",
            ClusterStage::HeadProvisioning => "head-provisioning",
            ClusterStage::HeadReady => "head-ready",
            ClusterStage::TokenExtracted => "token-extracted",
            ClusterStage::WorkersProvisioning => "workers-provisioning",
            ClusterStage::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// What to do with already-created nodes when a run fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave everything for an explicit `delete_cluster`.
    #[default]
    Leave,
    /// Best-effort `delete_cluster` before returning the error.
    Teardown,
}

/// Scheduler-specific commands. The worker command may use `{token}`,
/// `{head_address}` and `{node}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapCommands {
    pub head_token: String,
    pub worker_join: String,
}

impl Default for BootstrapCommands {
    fn default() -> Self {
        // kubeadm prints a complete `kubeadm join ...` line; the worker runs it
        Self {
            head_token: "sudo kubeadm token create --print-join-command".to_string(),
            worker_join: "sudo {token}".to_string(),
        }
    }
}

impl BootstrapCommands {
    pub fn worker_command(&self, credential: &JoinCredential, head: Ipv4Addr, node: &str) -> String {
        self.worker_join
            .replace("{head_address}", &head.to_string())
            .replace("{node}", node)
            .replace("{token}", credential.expose())
    }
}

/// Secret handed out by the head node. Lives only in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential(String);

impl JoinCredential {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinCredential(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    pub name: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterReport {
    pub name: String,
    pub head: NodeAddress,
    pub workers: Vec<NodeAddress>,
    pub stage: ClusterStage,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub readiness: RetryPolicy,
    pub bootstrap: BootstrapCommands,
    pub base_image: Option<String>,
    pub on_failure: FailurePolicy,
    pub ssh_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::default(),
            bootstrap: BootstrapCommands::default(),
            base_image: None,
            on_failure: FailurePolicy::Leave,
            ssh_port: 22,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            readiness: settings.readiness.policy(),
            bootstrap: settings.bootstrap.clone(),
            base_image: settings.orchestrator.base_image.clone(),
            on_failure: settings.orchestrator.on_failure,
            ssh_port: settings.ssh.port,
        }
    }
}

/// Brings a cluster up head-first, then joins compute nodes one at a time.
///
/// One run at a time per instance; nothing here locks the hypervisor host
/// against other callers.
pub struct ClusterOrchestrator {
    lifecycle: VmLifecycleManager,
    executor: RemoteExecutor,
    config: OrchestratorConfig,
}

impl ClusterOrchestrator {
    pub fn new(lifecycle: VmLifecycleManager, executor: RemoteExecutor, config: OrchestratorConfig) -> Self {
        Self {
            lifecycle,
            executor,
            config,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        hypervisor: Arc<dyn Hypervisor>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut lifecycle =
            VmLifecycleManager::new(hypervisor, &settings.hypervisor.pool, settings.lease);
        if settings.cloud_init.enabled {
            lifecycle = lifecycle.with_seeder(Arc::new(GenisoimageSeeder::new(
                &settings.cloud_init.seed_dir,
                &settings.cloud_init.genisoimage,
            )));
        }
        Self::new(
            lifecycle,
            RemoteExecutor::new(transport),
            OrchestratorConfig::from_settings(settings),
        )
    }

    fn target(&self, node: &NodeSpec, address: Ipv4Addr) -> SshTarget {
        SshTarget::new(address.to_string(), node.user.name.clone()).with_port(self.config.ssh_port)
    }

    fn advance(cluster: &str, stage: &mut ClusterStage, next: ClusterStage) {
        info!(cluster, from = %stage, to = %next, "cluster stage");
        *stage = next;
    }

    /// Provisions and joins the whole cluster.
    ///
    /// A failure after the head has handed out its credential is reported as
    /// [`ProvisionError::PartialCluster`]; anything earlier is a plain node
    /// error. Nodes already up are left alone unless the failure policy says
    /// to tear down.
    pub async fn provision_cluster(&self, spec: &ClusterSpec) -> ProvisionResult<ClusterReport> {
        spec.validate()?;

        match self.run(spec).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(cluster = %spec.name, error = %e, "cluster provisioning failed");
                if self.config.on_failure == FailurePolicy::Teardown {
                    warn!(cluster = %spec.name, "tearing down after failure");
                    let results = self.delete_cluster(spec).await;
                    let removed = results.values().filter(|deleted| **deleted).count();
                    info!(cluster = %spec.name, removed, "teardown finished");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, spec: &ClusterSpec) -> ProvisionResult<ClusterReport> {
        let cluster = spec.name.as_str();
        let head = spec
            .head()
            .ok_or_else(|| ProvisionError::InvalidSpec(format!("cluster {cluster} declares no head node")))?;
        if spec.head_nodes.len() > 1 {
            warn!(
                cluster,
                coordinator = %head.name,
                ignored = spec.head_nodes.len() - 1,
                "only the first head node is provisioned"
            );
        }

        let mut stage = ClusterStage::NotStarted;
        let base_image = self.config.base_image.as_deref();

        Self::advance(cluster, &mut stage, ClusterStage::HeadProvisioning);
        let head_vm = self
            .lifecycle
            .provision(head, base_image)
            .await
            .map_err(|e| e.for_node(&head.name, stage))?;
        let head_target = self.target(head, head_vm.address);
        self.executor
            .await_reachable(&head_target, &self.config.readiness)
            .await
            .map_err(|e| e.for_node(&head.name, stage))?;

        Self::advance(cluster, &mut stage, ClusterStage::HeadReady);
        let credential = self
            .extract_credential(&head_target)
            .await
            .map_err(|e| e.for_node(&head.name, stage))?;

        Self::advance(cluster, &mut stage, ClusterStage::TokenExtracted);
        let mut ready = vec![head.name.clone()];
        let mut workers = Vec::with_capacity(spec.compute_nodes.len());

        Self::advance(cluster, &mut stage, ClusterStage::WorkersProvisioning);
        for worker in &spec.compute_nodes {
            match self.join_worker(worker, &credential, head_vm.address).await {
                Ok(address) => {
                    ready.push(worker.name.clone());
                    workers.push(NodeAddress {
                        name: worker.name.clone(),
                        address,
                    });
                }
                Err(e) => {
                    return Err(ProvisionError::PartialCluster {
                        cluster: cluster.to_string(),
                        ready,
                        failed_node: worker.name.clone(),
                        source: Box::new(e.for_node(&worker.name, stage)),
                    });
                }
            }
        }

        Self::advance(cluster, &mut stage, ClusterStage::Joined);
        info!(cluster, nodes = ready.len(), "cluster joined");
        Ok(ClusterReport {
            name: cluster.to_string(),
            head: NodeAddress {
                name: head.name.clone(),
                address: head_vm.address,
            },
            workers,
            stage,
        })
    }

    async fn extract_credential(&self, head: &SshTarget) -> ProvisionResult<JoinCredential> {
        let raw = self
            .executor
            .execute(head, &self.config.bootstrap.head_token)
            .await?;
        if raw.is_empty() {
            return Err(ProvisionError::RemoteCommand {
                host: head.host.clone(),
                status: 0,
                stderr: "join credential command printed nothing".to_string(),
            });
        }
        info!(host = %head.host, "join credential extracted");
        Ok(JoinCredential(raw))
    }

    async fn join_worker(
        &self,
        worker: &NodeSpec,
        credential: &JoinCredential,
        head: Ipv4Addr,
    ) -> ProvisionResult<Ipv4Addr> {
        let vm = self
            .lifecycle
            .provision(worker, self.config.base_image.as_deref())
            .await?;
        let target = self.target(worker, vm.address);
        self.executor
            .await_reachable(&target, &self.config.readiness)
            .await?;

        let command = self
            .config
            .bootstrap
            .worker_command(credential, head, &worker.name);
        self.executor.execute(&target, &command).await?;
        info!(node = %worker.name, address = %vm.address, "worker joined");
        Ok(vm.address)
    }

    /// Deletes every declared node with its storage.
    ///
    /// Never fails and never stops early: each node gets exactly one attempt
    /// and ends up `true` (deleted) or `false` (absent, or the attempt failed).
    pub async fn delete_cluster(&self, spec: &ClusterSpec) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for node in spec.all_nodes() {
            let deleted = match self.lifecycle.delete(&node.name, true).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!(cluster = %spec.name, node = %node.name, error = %e, "delete failed");
                    false
                }
            };
            results.insert(node.name.clone(), deleted);
        }

        info!(
            cluster = %spec.name,
            deleted = results.values().filter(|d| **d).count(),
            total = results.len(),
            "cluster delete finished"
        );
        results
    }
}
