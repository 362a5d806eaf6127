use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::cloud_init::NodeSeeder;
use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::hypervisor::{ConnectionGuard, Hypervisor};
use crate::core::resources::translate;
use crate::core::spec::NodeSpec;
use crate::core::vm::{DomainDescriptor, VmHandle, VolumeDescriptor, VolumeHandle};

/// How long to wait for a DHCP lease after boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasePolicy {
    pub attempts: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub interval: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// A booted node with its lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    pub handle: VmHandle,
    pub volume: VolumeHandle,
    pub address: Ipv4Addr,
}

/// Creates and deletes a single node's volume and domain.
///
/// Provisioning does not roll back on failure: whatever was created before
/// the failing step stays on the host until `delete` is called.
pub struct VmLifecycleManager {
    hypervisor: Arc<dyn Hypervisor>,
    pool: String,
    lease: LeasePolicy,
    seeder: Option<Arc<dyn NodeSeeder>>,
}

impl VmLifecycleManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, pool: &str, lease: LeasePolicy) -> Self {
        Self {
            hypervisor,
            pool: pool.to_string(),
            lease,
            seeder: None,
        }
    }

    /// Boot every node with a cloud-init seed from `seeder`.
    pub fn with_seeder(mut self, seeder: Arc<dyn NodeSeeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Builds the domain definition for `node` backed by `disk_path`.
    pub fn describe(node: &NodeSpec, disk_path: &str) -> ProvisionResult<DomainDescriptor> {
        Self::describe_seeded(node, disk_path, None)
    }

    fn describe_seeded(
        node: &NodeSpec,
        disk_path: &str,
        seed: Option<&str>,
    ) -> ProvisionResult<DomainDescriptor> {
        let mut builder = DomainDescriptor::builder(&node.name)
            .resources(translate(&node.resources))
            .disk(disk_path)
            .network(&node.network.name);
        if let Some(seed) = seed {
            builder = builder.cdrom(seed);
        }
        builder.build()
    }

    /// The node's own image wins over the caller's default.
    ///
    /// An invalid node or a failed seed leaves the host untouched.
    pub async fn provision(
        &self,
        node: &NodeSpec,
        base_image: Option<&str>,
    ) -> ProvisionResult<ProvisionedVm> {
        node.validate()?;
        let seed = match &self.seeder {
            Some(seeder) => Some(seeder.seed(node).await?),
            None => None,
        };

        let conn = ConnectionGuard::acquire(self.hypervisor.as_ref()).await?;
        let image = node.image.as_deref().or(base_image);

        info!(node = %node.name, pool = %self.pool, image = ?image, "provisioning VM");
        let volume = conn
            .create_volume(
                &self.pool,
                &VolumeDescriptor {
                    name: node.volume_name(),
                    capacity_gb: node.disk_size_gb,
                },
                image,
            )
            .await?;

        let descriptor = Self::describe_seeded(node, &volume.path, seed.as_deref())?;
        let mut handle = conn.define_and_start(&descriptor).await?;
        let resources = descriptor.resources();
        info!(
            node = %node.name,
            id = %handle.id,
            vcpus = resources.vcpus,
            memory_mb = resources.memory_mb,
            "VM started, waiting for lease"
        );

        let address = self.wait_for_lease(&*conn, &node.name).await?;
        handle.address = Some(address);
        info!(node = %node.name, %address, "VM has an address");

        Ok(ProvisionedVm {
            handle,
            volume,
            address,
        })
    }

    async fn wait_for_lease(&self, conn: &dyn Hypervisor, name: &str) -> ProvisionResult<Ipv4Addr> {
        for attempt in 1..=self.lease.attempts {
            match conn.interface_addresses(name).await {
                Ok(addrs) => {
                    if let Some(v4) = first_ipv4(&addrs) {
                        return Ok(v4);
                    }
                    debug!(vm = name, attempt, "no IPv4 lease yet");
                }
                Err(e) => debug!(vm = name, attempt, error = %e, "address query failed"),
            }
            if attempt < self.lease.attempts {
                tokio::time::sleep(self.lease.interval).await;
            }
        }

        Err(ProvisionError::NoIpAssigned {
            node: name.to_string(),
            attempts: self.lease.attempts,
        })
    }

    /// Removes a domain and, if asked, its non-removable disks.
    ///
    /// Returns `false` when no such domain exists. Disk deletion failures are
    /// logged and do not change the result.
    pub async fn delete(&self, name: &str, delete_storage: bool) -> ProvisionResult<bool> {
        let conn = ConnectionGuard::acquire(self.hypervisor.as_ref()).await?;

        let Some(domain) = conn.lookup_domain(name).await? else {
            debug!(vm = name, "nothing to delete");
            return Ok(false);
        };
        let disks: Vec<String> = if delete_storage {
            domain.storage_paths().map(str::to_string).collect()
        } else {
            Vec::new()
        };

        if domain.state.is_active() {
            conn.destroy_domain(name).await?;
        }
        conn.undefine_domain(name).await?;

        for path in &disks {
            match conn.delete_volume(path).await {
                Ok(true) => {}
                Ok(false) => warn!(vm = name, path = %path, "disk was already gone"),
                Err(e) => warn!(vm = name, path = %path, error = %e, "failed to delete disk"),
            }
        }

        info!(vm = name, disks = disks.len(), "VM deleted");
        Ok(true)
    }
}

fn first_ipv4(addrs: &[IpAddr]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })
}
