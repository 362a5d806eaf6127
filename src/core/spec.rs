use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::resources::translate;
use crate::core::vm::GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Ram,
    Disk,
    Gpu,
    #[serde(alias = "lpu")]
    Accelerator,
}

impl ResourceKind {
    pub fn is_accelerator(self) -> bool {
        matches!(self, ResourceKind::Gpu | ResourceKind::Accelerator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorType {
    NvidiaA100,
    NvidiaH100,
    AmdMi250,
    IntelMax,
    XilinxAlveo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub amount: u64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub accelerator_type: Option<AcceleratorType>,
}

impl ResourceRequest {
    pub fn new(kind: ResourceKind, amount: u64) -> Self {
        Self {
            kind,
            amount,
            unit: None,
            accelerator_type: None,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_accelerator(mut self, accelerator: AcceleratorType) -> Self {
        self.accelerator_type = Some(accelerator);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub ssh_public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

fn default_disk_size_gb() -> u64 {
    16
}

/// A single machine of the cluster. Read-only once handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
    pub network: NetworkSpec,
    pub user: UserSpec,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u64,
    #[serde(default)]
    pub image: Option<String>,
}

impl NodeSpec {
    pub fn volume_name(&self) -> String {
        format!("{}_disk", self.name)
    }

    /// Rejects nodes that could never become a bootable domain, before
    /// anything is created on the host.
    pub fn validate(&self) -> ProvisionResult<()> {
        let invalid =
            |reason: String| ProvisionError::InvalidSpec(format!("node {}: {reason}", self.name));

        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidSpec("node name is empty".into()));
        }
        if self.disk_size_gb == 0 {
            return Err(invalid("zero disk size".into()));
        }
        if self.disk_size_gb.checked_mul(GIB).is_none() {
            return Err(invalid(format!(
                "disk of {} GiB does not fit in a byte count",
                self.disk_size_gb
            )));
        }
        for request in &self.resources {
            if request.kind.is_accelerator() != request.accelerator_type.is_some() {
                return Err(invalid(
                    "accelerator_type is required for gpu/accelerator entries and only for them".into(),
                ));
            }
            if request.kind == ResourceKind::Cpu && u32::try_from(request.amount).is_err() {
                return Err(invalid(format!(
                    "{} vCPUs is more than a domain can have",
                    request.amount
                )));
            }
        }

        let sizing = translate(&self.resources);
        if sizing.vcpus == 0 {
            return Err(invalid("vcpu count must be positive".into()));
        }
        if sizing.memory_mb == 0 {
            return Err(invalid("memory must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub head_nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub compute_nodes: Vec<NodeSpec>,
}

impl ClusterSpec {
    /// The join coordinator. Extra head nodes are provisioned by nobody.
    pub fn head(&self) -> Option<&NodeSpec> {
        self.head_nodes.first()
    }

    /// Every declared node, heads first, in declaration order.
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.head_nodes.iter().chain(self.compute_nodes.iter())
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.head_nodes.is_empty() {
            return Err(ProvisionError::InvalidSpec(format!(
                "cluster {} declares no head node",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for node in self.all_nodes() {
            node.validate()?;
            if !seen.insert(node.name.as_str()) {
                return Err(ProvisionError::InvalidSpec(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::node;
    use super::*;

    fn cluster() -> ClusterSpec {
        ClusterSpec {
            name: "bench".into(),
            head_nodes: vec![node("head-1")],
            compute_nodes: vec![node("worker-1"), node("worker-2")],
        }
    }

    #[test]
    fn valid_cluster_passes() {
        assert!(cluster().validate().is_ok());
        assert_eq!(cluster().head().map(|n| n.name.as_str()), Some("head-1"));
        let order: Vec<_> = cluster().all_nodes().map(|n| n.name.clone()).collect();
        assert_eq!(order, vec!["head-1", "worker-1", "worker-2"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut spec = cluster();
        spec.compute_nodes.push(node("worker-1"));
        assert!(matches!(spec.validate(), Err(ProvisionError::InvalidSpec(_))));
    }

    #[test]
    fn missing_head_rejected() {
        let mut spec = cluster();
        spec.head_nodes.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn gpu_without_subtype_rejected() {
        let mut spec = cluster();
        spec.compute_nodes[0]
            .resources
            .push(ResourceRequest::new(ResourceKind::Gpu, 1));
        assert!(spec.validate().is_err());

        spec.compute_nodes[0].resources.pop();
        spec.compute_nodes[0].resources.push(
            ResourceRequest::new(ResourceKind::Gpu, 1).with_accelerator(AcceleratorType::NvidiaH100),
        );
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn unbootable_sizing_rejected() {
        let mut no_cpu = node("head-1");
        no_cpu.resources[0].amount = 0;
        assert!(matches!(no_cpu.validate(), Err(ProvisionError::InvalidSpec(_))));

        let mut no_ram = node("head-1");
        no_ram.resources[1].amount = 0;
        assert!(no_ram.validate().is_err());

        let mut too_many_cpus = node("head-1");
        too_many_cpus.resources[0].amount = u64::from(u32::MAX) + 1;
        assert!(too_many_cpus.validate().is_err());

        let mut huge_disk = node("head-1");
        huge_disk.disk_size_gb = u64::MAX / 1024;
        assert!(huge_disk.validate().is_err());

        assert!(node("head-1").validate().is_ok());
    }

    #[test]
    fn volume_name_follows_node() {
        assert_eq!(node("head-1").volume_name(), "head-1_disk");
    }

    #[test]
    fn deserializes_from_toml() {
        let raw = r#"
            name = "bench"

            [[head_nodes]]
            name = "head-1"
            resources = [{ type = "cpu", amount = 2 }, { type = "ram", amount = 4, unit = "GB" }]
            network = { name = "default", cidr = "192.168.122.0/24" }
            user = { name = "ops", sudo = true }
        "#;
        let spec: ClusterSpec = toml::from_str(raw).unwrap();
        assert_eq!(spec.head_nodes[0].disk_size_gb, 16);
        assert_eq!(spec.head_nodes[0].resources[1].unit.as_deref(), Some("GB"));
        assert!(spec.compute_nodes.is_empty());
    }
}
