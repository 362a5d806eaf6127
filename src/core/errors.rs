use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::ClusterStage;

/// What kind of hypervisor object was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pool,
    Volume,
    Network,
    Domain,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Pool => write!(f, "storage pool"),
            ObjectKind::Volume => write!(f, "volume"),
            ObjectKind::Network => write!(f, "network"),
            ObjectKind::Domain => write!(f, "domain"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Hypervisor connection error: {0}")]
    Connection(String),

    #[error("{kind} not found: {name}")]
    ResourceNotFound { kind: ObjectKind, name: String },

    #[error("base image '{image}' not found in pool '{pool}'")]
    BaseImageNotFound { image: String, pool: String },

    #[error("no IPv4 address assigned to {node} after {attempts} attempts")]
    NoIpAssigned { node: String, attempts: u32 },

    #[error("{host} not reachable on ssh after {elapsed:?}")]
    ReadinessTimeout { host: String, elapsed: Duration },

    #[error("remote command on {host} exited with status {status}: {stderr}")]
    RemoteCommand {
        host: String,
        status: u32,
        stderr: String,
    },

    #[error("ssh error on {host}: {message}")]
    Ssh { host: String, message: String },

    #[error("hypervisor operation '{operation}' failed: {message}")]
    Hypervisor { operation: String, message: String },

    #[error("cloud-init seed for {node} failed: {message}")]
    Seed { node: String, message: String },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("node {node} failed during {stage}: {source}")]
    Node {
        node: String,
        stage: ClusterStage,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("cluster {cluster} partially provisioned ({} ready), failed at {failed_node}: {source}", .ready.len())]
    PartialCluster {
        cluster: String,
        ready: Vec<String>,
        failed_node: String,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn ssh(host: &str, err: impl fmt::Display) -> Self {
        ProvisionError::Ssh {
            host: host.to_string(),
            message: err.to_string(),
        }
    }

    pub fn hypervisor(operation: &str, message: impl Into<String>) -> Self {
        ProvisionError::Hypervisor {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Attach the node name and stage; already-annotated errors pass through.
    pub fn for_node(self, node: &str, stage: ClusterStage) -> Self {
        match self {
            e @ ProvisionError::Node { .. } | e @ ProvisionError::PartialCluster { .. } => e,
            other => ProvisionError::Node {
                node: node.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Strips `Node`/`PartialCluster` wrappers.
    pub fn root_cause(&self) -> &ProvisionError {
        match self {
            ProvisionError::Node { source, .. } | ProvisionError::PartialCluster { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, ProvisionError::PartialCluster { .. })
    }

    pub fn is_base_image_not_found(&self) -> bool {
        matches!(self.root_cause(), ProvisionError::BaseImageNotFound { .. })
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_annotations() {
        let err = ProvisionError::ReadinessTimeout {
            host: "10.0.0.2".into(),
            elapsed: Duration::from_secs(5),
        }
        .for_node("worker-1", ClusterStage::WorkersProvisioning);

        assert!(matches!(err, ProvisionError::Node { .. }));
        assert!(matches!(
            err.root_cause(),
            ProvisionError::ReadinessTimeout { .. }
        ));
        assert!(!err.is_partial());
    }

    #[test]
    fn annotation_is_not_doubled() {
        let err = ProvisionError::InvalidSpec("x".into())
            .for_node("a", ClusterStage::HeadProvisioning)
            .for_node("b", ClusterStage::HeadReady);
        match err {
            ProvisionError::Node { node, .. } => assert_eq!(node, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
