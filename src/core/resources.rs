use serde::Serialize;
use tracing::debug;

use crate::core::spec::{ResourceKind, ResourceRequest};

pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Concrete sizing for a domain definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VmResources {
    pub vcpus: u32,
    pub memory_mb: u64,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            vcpus: DEFAULT_VCPUS,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

/// Maps a node's resource list onto vCPU count and memory.
///
/// Single pass; a later entry of the same kind overwrites an earlier one.
/// CPU counts beyond `u32` saturate here; `NodeSpec::validate` refuses them.
/// Kinds that are absent keep their default. Disk entries are sized by the
/// node's `disk_size_gb` instead, and accelerators are not translated here.
pub fn translate(requests: &[ResourceRequest]) -> VmResources {
    let mut vcpus = None;
    let mut memory_mb = None;

    for request in requests {
        match request.kind {
            ResourceKind::Cpu => vcpus = Some(u32::try_from(request.amount).unwrap_or(u32::MAX)),
            ResourceKind::Ram => memory_mb = Some(memory_in_mb(request)),
            other => debug!(kind = ?other, amount = request.amount, "resource not mapped onto domain"),
        }
    }

    VmResources {
        vcpus: vcpus.unwrap_or(DEFAULT_VCPUS),
        memory_mb: memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
    }
}

fn memory_in_mb(request: &ResourceRequest) -> u64 {
    match request.unit.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("g") | Some("gb") | Some("gib") => request.amount.saturating_mul(1024),
        _ => request.amount,
    }
}
