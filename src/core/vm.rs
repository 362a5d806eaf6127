use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::resources::VmResources;

/// Identity of a defined domain plus its lease, once we have one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub name: String,
    pub id: String,
    pub address: Option<Ipv4Addr>,
}

/// Hypervisor-side path of a node's backing volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub name: String,
    pub pool: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Running,
    Paused,
    ShutOff,
    Crashed,
    Other,
}

impl VmState {
    /// Anything but a clean shut-off still has a qemu process behind it.
    /// Crashed domains kept around by `on_crash=preserve` count as active.
    pub fn is_active(self) -> bool {
        !matches!(self, VmState::ShutOff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

impl DiskDevice {
    pub fn parse(device: &str) -> Self {
        match device {
            "cdrom" => DiskDevice::Cdrom,
            "floppy" => DiskDevice::Floppy,
            "lun" => DiskDevice::Lun,
            _ => DiskDevice::Disk,
        }
    }

    pub fn is_removable(self) -> bool {
        matches!(self, DiskDevice::Cdrom | DiskDevice::Floppy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSource {
    pub device: DiskDevice,
    pub target: String,
    pub source: String,
}

/// What a lookup tells us about an existing domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    pub state: VmState,
    pub disks: Vec<DiskSource>,
}

impl DomainInfo {
    /// Disk sources that are safe to delete along with the domain.
    pub fn storage_paths(&self) -> impl Iterator<Item = &str> {
        self.disks
            .iter()
            .filter(|d| !d.device.is_removable())
            .map(|d| d.source.as_str())
    }
}

pub const GIB: u64 = 1024 * 1024 * 1024;

pub(crate) fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub name: String,
    pub capacity_gb: u64,
}

impl VolumeDescriptor {
    pub fn capacity_bytes(&self) -> ProvisionResult<u64> {
        self.capacity_gb.checked_mul(GIB).ok_or_else(|| {
            ProvisionError::InvalidDescriptor(format!(
                "{}: {} GiB does not fit in a byte count",
                self.name, self.capacity_gb
            ))
        })
    }

    pub fn to_xml(&self) -> ProvisionResult<String> {
        Ok(format!(
            r#"<volume>
  <name>{}</name>
  <capacity unit='bytes'>{}</capacity>
  <target>
    <format type='qcow2'/>
  </target>
</volume>
"#,
            xml_escape(&self.name),
            self.capacity_bytes()?
        ))
    }
}

/// A validated domain definition. Only obtainable through [`DomainBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    name: String,
    resources: VmResources,
    disks: Vec<String>,
    cdroms: Vec<String>,
    networks: Vec<String>,
}

impl DomainDescriptor {
    pub fn builder(name: &str) -> DomainBuilder {
        DomainBuilder {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> VmResources {
        self.resources
    }

    pub fn disks(&self) -> &[String] {
        &self.disks
    }

    /// Read-only media, e.g. a cloud-init seed.
    pub fn cdroms(&self) -> &[String] {
        &self.cdroms
    }

    pub fn networks(&self) -> &[String] {
        &self.networks
    }

    pub fn to_xml(&self) -> String {
        let mut devices = String::new();
        for (idx, path) in self.disks.iter().enumerate() {
            devices.push_str(&format!(
                r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{}'/>
      <target dev='vd{}' bus='virtio'/>
    </disk>
"#,
                xml_escape(path),
                (b'a' + idx as u8) as char
            ));
        }
        for (idx, path) in self.cdroms.iter().enumerate() {
            devices.push_str(&format!(
                r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sd{}' bus='sata'/>
      <readonly/>
    </disk>
"#,
                xml_escape(path),
                (b'a' + idx as u8) as char
            ));
        }
        for network in &self.networks {
            devices.push_str(&format!(
                r#"    <interface type='network'>
      <source network='{}'/>
      <model type='virtio'/>
    </interface>
"#,
                xml_escape(network)
            ));
        }

        format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MiB'>{}</memory>
  <vcpu>{}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
{}    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <graphics type='spice' autoport='yes' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
</domain>
"#,
            xml_escape(&self.name),
            self.resources.memory_mb,
            self.resources.vcpus,
            devices
        )
    }
}

#[derive(Debug, Default)]
pub struct DomainBuilder {
    name: String,
    vcpus: u32,
    memory_mb: u64,
    disks: Vec<String>,
    cdroms: Vec<String>,
    networks: Vec<String>,
}

impl DomainBuilder {
    pub fn resources(mut self, resources: VmResources) -> Self {
        self.vcpus = resources.vcpus;
        self.memory_mb = resources.memory_mb;
        self
    }

    pub fn disk(mut self, path: &str) -> Self {
        self.disks.push(path.to_string());
        self
    }

    pub fn cdrom(mut self, path: &str) -> Self {
        self.cdroms.push(path.to_string());
        self
    }

    pub fn network(mut self, name: &str) -> Self {
        self.networks.push(name.to_string());
        self
    }

    pub fn build(self) -> ProvisionResult<DomainDescriptor> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor("domain name is empty".into()));
        }
        if self.vcpus == 0 {
            return Err(ProvisionError::InvalidDescriptor(format!(
                "{}: vcpu count must be positive",
                self.name
            )));
        }
        if self.memory_mb == 0 {
            return Err(ProvisionError::InvalidDescriptor(format!(
                "{}: memory must be positive",
                self.name
            )));
        }
        if self.disks.is_empty() {
            return Err(ProvisionError::InvalidDescriptor(format!(
                "{}: at least one disk is required",
                self.name
            )));
        }
        if self.networks.is_empty() {
            return Err(ProvisionError::InvalidDescriptor(format!(
                "{}: at least one network interface is required",
                self.name
            )));
        }

        Ok(DomainDescriptor {
            name: self.name,
            resources: VmResources {
                vcpus: self.vcpus,
                memory_mb: self.memory_mb,
            },
            disks: self.disks,
            cdroms: self.cdroms,
            networks: self.networks,
        })
    }
}
