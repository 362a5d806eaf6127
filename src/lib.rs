pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod remote;

// Re-exports
pub use cluster::{ClusterOrchestrator, ClusterReport, ClusterStage, FailurePolicy};
pub use config::Settings;
pub use self::core::{ClusterSpec, Hypervisor, LibvirtManager, ProvisionError, VmLifecycleManager};
pub use remote::{RemoteExecutor, Transport};
