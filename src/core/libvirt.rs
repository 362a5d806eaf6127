use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::config::HypervisorSettings;
use crate::core::errors::{ObjectKind, ProvisionError, ProvisionResult};
use crate::core::hypervisor::Hypervisor;
use crate::core::vm::{
    DiskDevice, DiskSource, DomainDescriptor, DomainInfo, VmHandle, VmState, VolumeDescriptor,
    VolumeHandle,
};

type SharedConnect = Arc<Mutex<Option<Connect>>>;

/// libvirt connection to one hypervisor host (`qemu+ssh://...` for remote
/// ones).
///
/// The binding is blocking, so every call runs on tokio's blocking pool and
/// calls on one manager are serialized by the connection lock.
pub struct LibvirtManager {
    uri: String,
    conn: SharedConnect,
}

impl LibvirtManager {
    pub fn new(settings: &HypervisorSettings) -> Self {
        Self {
            uri: settings.connection_uri(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn with_conn<T, F>(&self, operation: &'static str, call: F) -> ProvisionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connect) -> ProvisionResult<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&shared);
            let conn = guard
                .as_ref()
                .ok_or_else(|| ProvisionError::Connection(format!("not connected to {uri}")))?;
            call(conn)
        })
        .await
        .map_err(|e| ProvisionError::hypervisor(operation, format!("libvirt task failed: {e}")))?
    }
}

fn lock(shared: &SharedConnect) -> MutexGuard<'_, Option<Connect>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failed(operation: &str, e: VirtError) -> ProvisionError {
    error!(operation, error = %e, "libvirt call failed");
    ProvisionError::hypervisor(operation, e.to_string())
}

/// Classifies by libvirt error code, never by message text.
fn is_missing(e: &VirtError, kind: ObjectKind) -> bool {
    matches!(
        (kind, e.code()),
        (ObjectKind::Domain, ErrorNumber::NoDomain)
            | (ObjectKind::Network, ErrorNumber::NoNetwork)
            | (ObjectKind::Pool, ErrorNumber::NoStoragePool)
            | (ObjectKind::Volume, ErrorNumber::NoStorageVolume)
    )
}

fn not_found_or(operation: &str, kind: ObjectKind, name: &str, e: VirtError) -> ProvisionError {
    if is_missing(&e, kind) {
        ProvisionError::ResourceNotFound {
            kind,
            name: name.to_string(),
        }
    } else {
        failed(operation, e)
    }
}

fn vm_state(state: sys::virDomainState) -> VmState {
    match state {
        sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED | sys::VIR_DOMAIN_SHUTDOWN => {
            VmState::Running
        }
        sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => VmState::Paused,
        sys::VIR_DOMAIN_SHUTOFF => VmState::ShutOff,
        sys::VIR_DOMAIN_CRASHED => VmState::Crashed,
        _ => VmState::Other,
    }
}

#[async_trait]
impl Hypervisor for LibvirtManager {
    async fn connect(&self) -> ProvisionResult<()> {
        let shared = Arc::clone(&self.conn);
        let uri = self.uri.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&shared);
            if guard.is_some() {
                return Ok(false);
            }
            match Connect::open(Some(uri.as_str())) {
                Ok(conn) => {
                    *guard = Some(conn);
                    Ok(true)
                }
                Err(e) => {
                    error!(uri = %uri, "Failed to connect to libvirt: {}", e);
                    Err(ProvisionError::Connection(format!("{uri}: {e}")))
                }
            }
        })
        .await
        .map_err(|e| ProvisionError::Connection(format!("libvirt task failed: {e}")))??;

        if opened {
            info!(uri = %self.uri, "Successfully connected to libvirt");
        }
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(mut conn) = lock(&self.conn).take() {
            match conn.close() {
                Ok(_) => debug!(uri = %self.uri, "libvirt connection released"),
                Err(e) => warn!(uri = %self.uri, error = %e, "closing libvirt connection failed"),
            }
        }
    }

    async fn lookup_domain(&self, name: &str) -> ProvisionResult<Option<DomainInfo>> {
        let name = name.to_string();
        self.with_conn("lookup", move |conn| {
            let domain = match Domain::lookup_by_name(conn, &name) {
                Ok(domain) => domain,
                Err(e) if is_missing(&e, ObjectKind::Domain) => return Ok(None),
                Err(e) => return Err(failed("lookup", e)),
            };
            let (state, _reason) = domain.get_state().map_err(|e| failed("get_state", e))?;
            let xml = domain
                .get_xml_desc(0)
                .map_err(|e| failed("get_xml_desc", e))?;

            let disks = parse_disks(&xml)?
                .into_iter()
                .filter_map(|disk| resolve_disk(conn, &name, disk))
                .collect();
            Ok(Some(DomainInfo {
                name,
                state: vm_state(state),
                disks,
            }))
        })
        .await
    }

    async fn create_volume(
        &self,
        pool: &str,
        volume: &VolumeDescriptor,
        base_image: Option<&str>,
    ) -> ProvisionResult<VolumeHandle> {
        let pool_name = pool.to_string();
        let volume_name = volume.name.clone();
        let base_image = base_image.map(str::to_string);
        let xml = volume.to_xml()?;

        self.with_conn("vol-create", move |conn| {
            let pool = StoragePool::lookup_by_name(conn, &pool_name)
                .map_err(|e| not_found_or("pool-lookup", ObjectKind::Pool, &pool_name, e))?;

            let created = match &base_image {
                Some(image) => {
                    let source = StorageVol::lookup_by_name(&pool, image).map_err(|e| {
                        if is_missing(&e, ObjectKind::Volume) {
                            ProvisionError::BaseImageNotFound {
                                image: image.clone(),
                                pool: pool_name.clone(),
                            }
                        } else {
                            failed("vol-lookup", e)
                        }
                    })?;
                    StorageVol::create_xml_from(&pool, &xml, &source, 0)
                }
                None => StorageVol::create_xml(&pool, &xml, 0),
            }
            .map_err(|e| failed("vol-create", e))?;

            let path = created.get_path().map_err(|e| failed("vol-path", e))?;
            info!(pool = %pool_name, volume = %volume_name, base = ?base_image, "volume created");
            Ok(VolumeHandle {
                name: volume_name,
                pool: pool_name,
                path,
            })
        })
        .await
    }

    async fn delete_volume(&self, path: &str) -> ProvisionResult<bool> {
        let path = path.to_string();
        self.with_conn("vol-delete", move |conn| {
            let volume = match StorageVol::lookup_by_path(conn, &path) {
                Ok(volume) => volume,
                Err(e) if is_missing(&e, ObjectKind::Volume) => return Ok(false),
                Err(e) => return Err(failed("vol-lookup", e)),
            };
            volume.delete(0).map_err(|e| failed("vol-delete", e))?;
            info!(path = %path, "volume deleted");
            Ok(true)
        })
        .await
    }

    async fn define_and_start(&self, descriptor: &DomainDescriptor) -> ProvisionResult<VmHandle> {
        let name = descriptor.name().to_string();
        let networks = descriptor.networks().to_vec();
        let xml = descriptor.to_xml();

        self.with_conn("define", move |conn| {
            for network in &networks {
                Network::lookup_by_name(conn, network)
                    .map_err(|e| not_found_or("net-lookup", ObjectKind::Network, network, e))?;
            }

            let domain = Domain::define_xml(conn, &xml).map_err(|e| failed("define", e))?;
            domain.create().map_err(|e| failed("start", e))?;
            let id = domain.get_uuid_string().map_err(|e| failed("uuid", e))?;
            info!(vm = %name, id = %id, "VM defined and started");
            Ok(VmHandle {
                name,
                id,
                address: None,
            })
        })
        .await
    }

    async fn interface_addresses(&self, name: &str) -> ProvisionResult<Vec<IpAddr>> {
        let name = name.to_string();
        self.with_conn("domifaddr", move |conn| {
            let domain = Domain::lookup_by_name(conn, &name)
                .map_err(|e| not_found_or("lookup", ObjectKind::Domain, &name, e))?;
            let interfaces = domain
                .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                .map_err(|e| failed("domifaddr", e))?;
            Ok(parse_addresses(
                interfaces
                    .iter()
                    .flat_map(|iface| iface.addrs.iter().map(|a| a.addr.as_str())),
            ))
        })
        .await
    }

    async fn destroy_domain(&self, name: &str) -> ProvisionResult<()> {
        let name = name.to_string();
        self.with_conn("destroy", move |conn| {
            let domain = Domain::lookup_by_name(conn, &name)
                .map_err(|e| not_found_or("lookup", ObjectKind::Domain, &name, e))?;
            if !domain.is_active().map_err(|e| failed("is_active", e))? {
                debug!(vm = %name, "already stopped");
                return Ok(());
            }
            domain.destroy().map_err(|e| failed("destroy", e))?;
            info!(vm = %name, "VM destroyed");
            Ok(())
        })
        .await
    }

    async fn undefine_domain(&self, name: &str) -> ProvisionResult<()> {
        let name = name.to_string();
        self.with_conn("undefine", move |conn| {
            let domain = Domain::lookup_by_name(conn, &name)
                .map_err(|e| not_found_or("lookup", ObjectKind::Domain, &name, e))?;
            domain
                .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_NVRAM)
                .map_err(|e| failed("undefine", e))?;
            info!(vm = %name, "VM undefined");
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct DomainXml {
    #[serde(default)]
    devices: DevicesXml,
}

#[derive(Debug, Default, Deserialize)]
struct DevicesXml {
    #[serde(rename = "disk", default)]
    disks: Vec<DiskXml>,
}

#[derive(Debug, Deserialize)]
struct DiskXml {
    #[serde(rename = "@device")]
    device: Option<String>,
    source: Option<SourceXml>,
    target: Option<TargetXml>,
}

#[derive(Debug, Deserialize)]
struct SourceXml {
    #[serde(rename = "@file")]
    file: Option<String>,
    #[serde(rename = "@dev")]
    dev: Option<String>,
    #[serde(rename = "@pool")]
    pool: Option<String>,
    #[serde(rename = "@volume")]
    volume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetXml {
    #[serde(rename = "@dev")]
    dev: String,
}

/// Where a disk's data lives, as written in the domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiskRef {
    Path(String),
    PoolVolume { pool: String, volume: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedDisk {
    pub device: DiskDevice,
    pub target: String,
    pub source: DiskRef,
}

/// Disks with a source from a domain's XML. Empty drives are skipped.
pub(crate) fn parse_disks(xml: &str) -> ProvisionResult<Vec<ParsedDisk>> {
    let domain: DomainXml = quick_xml::de::from_str(xml).map_err(|e| {
        ProvisionError::hypervisor("get_xml_desc", format!("unreadable domain XML: {e}"))
    })?;

    Ok(domain
        .devices
        .disks
        .into_iter()
        .filter_map(|disk| {
            let source = disk.source?;
            let source = match (source.file.or(source.dev), source.pool, source.volume) {
                (Some(path), _, _) => DiskRef::Path(path),
                (None, Some(pool), Some(volume)) => DiskRef::PoolVolume { pool, volume },
                _ => return None,
            };
            Some(ParsedDisk {
                device: DiskDevice::parse(disk.device.as_deref().unwrap_or("disk")),
                target: disk.target.map(|t| t.dev).unwrap_or_default(),
                source,
            })
        })
        .collect())
}

fn resolve_disk(conn: &Connect, vm: &str, disk: ParsedDisk) -> Option<DiskSource> {
    let source = match disk.source {
        DiskRef::Path(path) => path,
        DiskRef::PoolVolume { pool, volume } => {
            let resolved = StoragePool::lookup_by_name(conn, &pool)
                .and_then(|pool| StorageVol::lookup_by_name(&pool, &volume))
                .and_then(|vol| vol.get_path());
            match resolved {
                Ok(path) => path,
                Err(e) => {
                    warn!(vm, pool = %pool, volume = %volume, error = %e, "cannot resolve disk volume");
                    return None;
                }
            }
        }
    };
    Some(DiskSource {
        device: disk.device,
        target: disk.target,
        source,
    })
}

pub(crate) fn parse_addresses<'a>(addrs: impl Iterator<Item = &'a str>) -> Vec<IpAddr> {
    addrs
        .filter_map(|addr| addr.split('/').next())
        .filter_map(|addr| addr.parse().ok())
        .collect()
}
