use async_trait::async_trait;
use std::net::IpAddr;
use std::ops::Deref;

use crate::core::errors::ProvisionResult;
use crate::core::vm::{DomainDescriptor, DomainInfo, VmHandle, VolumeDescriptor, VolumeHandle};

/// The primitives we need from a hypervisor host.
///
/// Implementations talk to one named host. `connect` is idempotent: opening
/// an already open connection is a no-op.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn connect(&self) -> ProvisionResult<()>;

    fn disconnect(&self);

    /// `None` when no domain by that name exists.
    async fn lookup_domain(&self, name: &str) -> ProvisionResult<Option<DomainInfo>>;

    /// Creates an empty volume, or clones `base_image` when given.
    async fn create_volume(
        &self,
        pool: &str,
        volume: &VolumeDescriptor,
        base_image: Option<&str>,
    ) -> ProvisionResult<VolumeHandle>;

    /// `Ok(false)` when the volume was already gone.
    async fn delete_volume(&self, path: &str) -> ProvisionResult<bool>;

    async fn define_and_start(&self, descriptor: &DomainDescriptor) -> ProvisionResult<VmHandle>;

    /// Addresses currently leased to the domain's interfaces.
    async fn interface_addresses(&self, name: &str) -> ProvisionResult<Vec<IpAddr>>;

    /// Force-stop.
    async fn destroy_domain(&self, name: &str) -> ProvisionResult<()>;

    async fn undefine_domain(&self, name: &str) -> ProvisionResult<()>;
}

/// An open hypervisor connection, closed when dropped.
pub struct ConnectionGuard<'a> {
    hypervisor: &'a dyn Hypervisor,
}

impl<'a> ConnectionGuard<'a> {
    pub async fn acquire(hypervisor: &'a dyn Hypervisor) -> ProvisionResult<ConnectionGuard<'a>> {
        hypervisor.connect().await?;
        Ok(Self { hypervisor })
    }
}

impl<'a> Deref for ConnectionGuard<'a> {
    type Target = dyn Hypervisor + 'a;

    fn deref(&self) -> &Self::Target {
        self.hypervisor
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.hypervisor.disconnect();
    }
}
