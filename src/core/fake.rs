//! In-memory hypervisor for tests.
//!
//! Keeps pools, networks and domains in a map and records every call so
//! tests can assert on ordering and attempt counts.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};

use crate::core::errors::{ObjectKind, ProvisionError, ProvisionResult};
use crate::core::hypervisor::Hypervisor;
use crate::core::vm::{
    DiskDevice, DiskSource, DomainDescriptor, DomainInfo, VmHandle, VmState, VolumeDescriptor,
    VolumeHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Disconnect,
    Lookup(String),
    CreateVolume(String),
    DeleteVolume(String),
    DefineAndStart(String),
    InterfaceAddresses(String),
    Destroy(String),
    Undefine(String),
}

#[derive(Debug)]
struct FakeDomain {
    state: VmState,
    disks: Vec<DiskSource>,
    address: Ipv4Addr,
    polls_until_lease: Option<u32>,
}

#[derive(Debug, Default)]
struct FakeState {
    connected: bool,
    connect_count: u32,
    refuse_connection: bool,
    pools: HashMap<String, HashMap<String, String>>,
    networks: HashSet<String>,
    domains: HashMap<String, FakeDomain>,
    lease_delays: HashMap<String, Option<u32>>,
    failing_volume_deletes: HashSet<String>,
    next_octet: u8,
    calls: Vec<Call>,
}

pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    /// One pool named `default` and one network named `default`.
    pub fn new() -> Self {
        let mut state = FakeState {
            next_octet: 10,
            ..Default::default()
        };
        state.pools.insert("default".to_string(), HashMap::new());
        state.networks.insert("default".to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_network(self, name: &str) -> Self {
        self.lock().networks.insert(name.to_string());
        self
    }

    pub fn with_base_image(self, pool: &str, image: &str) -> Self {
        self.lock()
            .pools
            .entry(pool.to_string())
            .or_default()
            .insert(image.to_string(), format!("/pools/{pool}/{image}"));
        self
    }

    /// The domain's first `polls` address queries come back empty.
    pub fn with_lease_delay(self, domain: &str, polls: u32) -> Self {
        self.lock().lease_delays.insert(domain.to_string(), Some(polls));
        self
    }

    pub fn without_lease(self, domain: &str) -> Self {
        self.lock().lease_delays.insert(domain.to_string(), None);
        self
    }

    pub fn refusing_connections(self) -> Self {
        self.lock().refuse_connection = true;
        self
    }

    pub fn failing_volume_delete(self, path: &str) -> Self {
        self.lock().failing_volume_deletes.insert(path.to_string());
        self
    }

    /// Defines a running domain directly, as if left over from an earlier run.
    pub fn insert_domain(&self, name: &str, disk_path: &str) {
        let mut state = self.lock();
        let address = state.allocate_address();
        state.domains.insert(
            name.to_string(),
            FakeDomain {
                state: VmState::Running,
                disks: vec![DiskSource {
                    device: DiskDevice::Disk,
                    target: "vda".to_string(),
                    source: disk_path.to_string(),
                }],
                address,
                polls_until_lease: Some(0),
            },
        );
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    pub fn domain_exists(&self, name: &str) -> bool {
        self.lock().domains.contains_key(name)
    }

    pub fn domain_disks(&self, name: &str) -> Vec<DiskSource> {
        self.lock()
            .domains
            .get(name)
            .map(|d| d.disks.clone())
            .unwrap_or_default()
    }

    pub fn domain_address(&self, name: &str) -> Option<Ipv4Addr> {
        self.lock().domains.get(name).map(|d| d.address)
    }

    pub fn volume_exists(&self, pool: &str, name: &str) -> bool {
        self.lock()
            .pools
            .get(pool)
            .is_some_and(|vols| vols.contains_key(name))
    }

    pub fn volume_count(&self, pool: &str) -> usize {
        self.lock().pools.get(pool).map_or(0, HashMap::len)
    }
}

impl FakeState {
    fn record(&mut self, call: Call) -> ProvisionResult<()> {
        self.calls.push(call);
        if self.connected {
            Ok(())
        } else {
            Err(ProvisionError::Connection("not connected".to_string()))
        }
    }

    fn allocate_address(&mut self) -> Ipv4Addr {
        let octet = self.next_octet;
        self.next_octet = self.next_octet.wrapping_add(1);
        Ipv4Addr::new(192, 168, 122, octet)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn connect(&self) -> ProvisionResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Connect);
        if state.refuse_connection {
            return Err(ProvisionError::Connection("connection refused".to_string()));
        }
        if !state.connected {
            state.connected = true;
            state.connect_count += 1;
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        state.calls.push(Call::Disconnect);
        state.connected = false;
    }

    async fn lookup_domain(&self, name: &str) -> ProvisionResult<Option<DomainInfo>> {
        let mut state = self.lock();
        state.record(Call::Lookup(name.to_string()))?;
        Ok(state.domains.get(name).map(|d| DomainInfo {
            name: name.to_string(),
            state: d.state,
            disks: d.disks.clone(),
        }))
    }

    async fn create_volume(
        &self,
        pool: &str,
        volume: &VolumeDescriptor,
        base_image: Option<&str>,
    ) -> ProvisionResult<VolumeHandle> {
        let mut state = self.lock();
        state.record(Call::CreateVolume(volume.name.clone()))?;
        volume.capacity_bytes()?;

        let volumes = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ProvisionError::ResourceNotFound {
                kind: ObjectKind::Pool,
                name: pool.to_string(),
            })?;
        if let Some(image) = base_image {
            if !volumes.contains_key(image) {
                return Err(ProvisionError::BaseImageNotFound {
                    image: image.to_string(),
                    pool: pool.to_string(),
                });
            }
        }
        if volumes.contains_key(&volume.name) {
            return Err(ProvisionError::hypervisor(
                "vol-create",
                format!("volume {} already exists", volume.name),
            ));
        }

        let path = format!("/pools/{pool}/{}", volume.name);
        volumes.insert(volume.name.clone(), path.clone());
        Ok(VolumeHandle {
            name: volume.name.clone(),
            pool: pool.to_string(),
            path,
        })
    }

    async fn delete_volume(&self, path: &str) -> ProvisionResult<bool> {
        let mut state = self.lock();
        state.record(Call::DeleteVolume(path.to_string()))?;
        if state.failing_volume_deletes.contains(path) {
            return Err(ProvisionError::hypervisor("vol-delete", "volume is busy"));
        }
        for volumes in state.pools.values_mut() {
            if let Some(name) = volumes
                .iter()
                .find(|(_, p)| p.as_str() == path)
                .map(|(n, _)| n.clone())
            {
                volumes.remove(&name);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn define_and_start(&self, descriptor: &DomainDescriptor) -> ProvisionResult<VmHandle> {
        let mut state = self.lock();
        state.record(Call::DefineAndStart(descriptor.name().to_string()))?;

        for network in descriptor.networks() {
            if !state.networks.contains(network) {
                return Err(ProvisionError::ResourceNotFound {
                    kind: ObjectKind::Network,
                    name: network.clone(),
                });
            }
        }
        if state.domains.contains_key(descriptor.name()) {
            return Err(ProvisionError::hypervisor(
                "define",
                format!("domain {} already exists", descriptor.name()),
            ));
        }

        let address = state.allocate_address();
        let polls_until_lease = state
            .lease_delays
            .get(descriptor.name())
            .copied()
            .unwrap_or(Some(0));
        state.domains.insert(
            descriptor.name().to_string(),
            FakeDomain {
                state: VmState::Running,
                disks: descriptor
                    .disks()
                    .iter()
                    .enumerate()
                    .map(|(idx, path)| DiskSource {
                        device: DiskDevice::Disk,
                        target: format!("vd{}", (b'a' + idx as u8) as char),
                        source: path.clone(),
                    })
                    .chain(
                        descriptor
                            .cdroms()
                            .iter()
                            .enumerate()
                            .map(|(idx, path)| DiskSource {
                                device: DiskDevice::Cdrom,
                                target: format!("sd{}", (b'a' + idx as u8) as char),
                                source: path.clone(),
                            }),
                    )
                    .collect(),
                address,
                polls_until_lease,
            },
        );

        Ok(VmHandle {
            name: descriptor.name().to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            address: None,
        })
    }

    async fn interface_addresses(&self, name: &str) -> ProvisionResult<Vec<IpAddr>> {
        let mut state = self.lock();
        state.record(Call::InterfaceAddresses(name.to_string()))?;
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| ProvisionError::ResourceNotFound {
                kind: ObjectKind::Domain,
                name: name.to_string(),
            })?;

        match domain.polls_until_lease.as_mut() {
            Some(0) => Ok(vec![
                IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0x5054, 0xff, 0xfe00, 1)),
                IpAddr::V4(domain.address),
            ]),
            Some(remaining) => {
                *remaining -= 1;
                Ok(vec![])
            }
            None => Ok(vec![]),
        }
    }

    async fn destroy_domain(&self, name: &str) -> ProvisionResult<()> {
        let mut state = self.lock();
        state.record(Call::Destroy(name.to_string()))?;
        match state.domains.get_mut(name) {
            Some(domain) => {
                domain.state = VmState::ShutOff;
                Ok(())
            }
            None => Err(ProvisionError::ResourceNotFound {
                kind: ObjectKind::Domain,
                name: name.to_string(),
            }),
        }
    }

    async fn undefine_domain(&self, name: &str) -> ProvisionResult<()> {
        let mut state = self.lock();
        state.record(Call::Undefine(name.to_string()))?;
        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProvisionError::ResourceNotFound {
                kind: ObjectKind::Domain,
                name: name.to_string(),
            })
    }
}
