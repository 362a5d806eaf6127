pub mod cloud_init;
pub mod errors;
pub mod fake;
pub mod hypervisor;
pub mod libvirt;
pub mod lifecycle;
pub mod resources;
pub mod spec;
pub mod vm;

pub use cloud_init::{GenisoimageSeeder, NodeSeeder};
pub use errors::{ObjectKind, ProvisionError, ProvisionResult};
pub use fake::FakeHypervisor;
pub use hypervisor::{ConnectionGuard, Hypervisor};
pub use libvirt::LibvirtManager;
pub use lifecycle::{LeasePolicy, ProvisionedVm, VmLifecycleManager};
pub use resources::{translate, VmResources};
pub use spec::{ClusterSpec, NodeSpec, ResourceKind, ResourceRequest};
pub use vm::{DomainDescriptor, DomainInfo, VmHandle, VmState, VolumeHandle};
