//! Disk and network interface hotplug
//!
//! Every attach or detach is followed by a definition refresh: the live XML is
//! read back and redefined so the change survives the next restart. Slots are
//! computed from a fresh read of the live definition, never cached, so two
//! concurrent attaches to one domain may pick the same slot; the hypervisor's
//! collision error is returned to the caller as is.

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::descriptor::DomainDescriptor;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{DeviceScope, Hypervisor};
use crate::volume::{VolumeFormat, VolumeManager};
use crate::xml_utils::XmlWriter;

/// Next free `vd*` device name, counting attached non-CD-ROM disks.
pub fn next_disk_slot(definition: &DomainDescriptor) -> Result<String> {
    let count = definition.non_cdrom_disk_count();
    let letter = u8::try_from(count)
        .ok()
        .filter(|c| *c < 26)
        .map(|c| char::from(b'a' + c))
        .ok_or_else(|| {
            ProvisionError::InvalidParameter(format!(
                "no free virtio disk slot ({count} disks attached)"
            ))
        })?;
    Ok(format!("vd{letter}"))
}

/// Next positional interface name (`ethN`).
pub fn next_network_slot(definition: &DomainDescriptor) -> String {
    format!("eth{}", definition.interfaces().len())
}

fn parse_eth_slot(slot: &str) -> Result<usize> {
    slot.strip_prefix("eth")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            ProvisionError::InvalidParameter(format!(
                "interface must be given as ethN, got {slot:?}"
            ))
        })
}

/// Random locally-administered MAC in the KVM `52:54:00` range.
pub fn random_mac() -> String {
    let mut rng = rand::rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.random_range(0x00..=0x7fu8),
        rng.random::<u8>(),
        rng.random::<u8>()
    )
}

/// A disk bound to a device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskAttachment {
    /// Volume path.
    pub path: Utf8PathBuf,
    /// Guest device name.
    pub device: String,
    /// Guest bus.
    pub bus: String,
    /// Image format.
    pub format: VolumeFormat,
    /// Whether several guests may attach the disk.
    pub shareable: bool,
}

impl DiskAttachment {
    /// A virtio disk.
    pub fn virtio(
        path: impl Into<Utf8PathBuf>,
        device: impl Into<String>,
        format: VolumeFormat,
    ) -> Self {
        Self {
            path: path.into(),
            device: device.into(),
            bus: "virtio".to_string(),
            format,
            shareable: false,
        }
    }

    /// Device XML for attach and detach calls.
    pub fn to_xml(&self) -> Result<String> {
        let mut w = XmlWriter::new();
        w.start_element("disk", &[("type", "file"), ("device", "disk")])?;
        w.write_empty_element(
            "driver",
            &[
                ("name", "qemu"),
                ("type", self.format.as_str()),
                ("cache", "none"),
            ],
        )?;
        w.write_empty_element("source", &[("file", self.path.as_str())])?;
        w.write_empty_element("target", &[("bus", &self.bus), ("dev", &self.device)])?;
        if self.shareable {
            w.write_empty_element("shareable", &[])?;
        }
        w.end_element("disk")?;
        w.into_string()
    }
}

/// Parameters of [`DeviceManager::add_disk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRequest {
    /// Pool for a new volume.
    pub pool: String,
    /// Size of a new volume in GB.
    pub size_gb: u64,
    /// Thin-provision the new volume (qcow2) where the pool allows it.
    pub thin: bool,
    /// Backing volume (name or path) for a new volume.
    pub backing: Option<String>,
    /// Mark the disk shareable.
    pub shareable: bool,
    /// Attach this existing volume instead of creating one.
    pub existing: Option<Utf8PathBuf>,
}

impl DiskRequest {
    /// A new thin volume of `size_gb` in `pool`.
    pub fn new(pool: impl Into<String>, size_gb: u64) -> Self {
        Self {
            pool: pool.into(),
            size_gb,
            thin: true,
            backing: None,
            shareable: false,
            existing: None,
        }
    }
}

/// What a network interface plugs into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum InterfaceSource {
    /// A libvirt virtual network.
    Network(String),
    /// A host bridge.
    Bridge(String),
}

/// A network interface to attach or detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicAttachment {
    /// MAC address.
    pub mac: String,
    /// Network or bridge.
    pub source: InterfaceSource,
    /// Device model.
    pub model: String,
}

impl NicAttachment {
    /// A virtio NIC with a fresh MAC.
    pub fn new(source: InterfaceSource) -> Self {
        Self {
            mac: random_mac(),
            source,
            model: "virtio".to_string(),
        }
    }

    /// Device XML for attach and detach calls.
    pub fn to_xml(&self) -> Result<String> {
        let (kind, key, name) = match &self.source {
            InterfaceSource::Network(n) => ("network", "network", n),
            InterfaceSource::Bridge(b) => ("bridge", "bridge", b),
        };
        let mut w = XmlWriter::new();
        w.start_element("interface", &[("type", kind)])?;
        w.write_empty_element("mac", &[("address", &self.mac)])?;
        w.write_empty_element("source", &[(key, name.as_str())])?;
        w.write_empty_element("model", &[("type", &self.model)])?;
        w.end_element("interface")?;
        w.into_string()
    }
}

/// Attach and detach operations over a hypervisor connection.
#[derive(Debug, Clone, Copy)]
pub struct DeviceManager<'a> {
    conn: &'a dyn Hypervisor,
}

impl<'a> DeviceManager<'a> {
    /// Wrap a connection.
    pub fn new(conn: &'a dyn Hypervisor) -> Self {
        Self { conn }
    }

    fn definition(&self, domain: &str) -> Result<DomainDescriptor> {
        if !self.conn.domain_exists(domain)? {
            return Err(ProvisionError::DomainNotFound(domain.to_string()));
        }
        DomainDescriptor::parse(&self.conn.domain_xml(domain)?)
    }

    fn scope(&self, domain: &str) -> Result<DeviceScope> {
        Ok(if self.conn.domain_state(domain)?.is_active() {
            DeviceScope::Live
        } else {
            DeviceScope::Config
        })
    }

    /// Re-read the live definition and define it again.
    pub fn refresh_definition(&self, domain: &str) -> Result<()> {
        let xml = self.conn.domain_xml(domain)?;
        self.conn
            .define_domain(&xml)
            .map_err(|e| ProvisionError::Definition {
                name: domain.to_string(),
                message: e.to_string(),
            })?;
        debug!("Refreshed definition of {}", domain);
        Ok(())
    }

    /// Next disk slot on the current definition of `domain`.
    pub fn next_disk_slot(&self, domain: &str) -> Result<String> {
        next_disk_slot(&self.definition(domain)?)
    }

    /// Attach a disk and persist it.
    pub fn attach_disk(&self, domain: &str, disk: &DiskAttachment) -> Result<()> {
        let scope = self.scope(domain)?;
        self.conn.attach_device(domain, &disk.to_xml()?, scope)?;
        self.refresh_definition(domain)?;
        info!("Attached {} to {} as {}", disk.path, domain, disk.device);
        Ok(())
    }

    /// Attach the disk described by `request` at the next free slot.
    ///
    /// Without [`DiskRequest::existing`] a volume `<domain>_<n>.img` is created
    /// first and removed again if the attach fails.
    pub fn add_disk(&self, domain: &str, request: &DiskRequest) -> Result<DiskAttachment> {
        let definition = self.definition(domain)?;
        let device = next_disk_slot(&definition)?;
        let volumes = VolumeManager::new(self.conn);

        let (path, format, created) = match &request.existing {
            Some(existing) => {
                let record = self
                    .conn
                    .lookup_volume(existing.as_str())?
                    .ok_or_else(|| ProvisionError::VolumeNotFound(existing.to_string()))?;
                (record.volume.path, record.volume.format, false)
            }
            None => {
                let backing = match request.backing.as_deref() {
                    Some(b) => Some(volumes.resolve(b)?.path),
                    None => None,
                };
                let name = format!("{}_{}.img", domain, definition.non_cdrom_disk_count() + 1);
                let volume = volumes.create_disk(
                    &request.pool,
                    &name,
                    request.size_gb,
                    request.thin,
                    backing.as_deref(),
                )?;
                (volume.path, volume.format, true)
            }
        };

        let mut disk = DiskAttachment::virtio(path, device, format);
        disk.shareable = request.shareable;
        if let Err(e) = self.attach_disk(domain, &disk) {
            if created {
                if let Err(cleanup) = volumes.delete_volume(&disk.path) {
                    warn!("Failed to remove {} after attach error: {}", disk.path, cleanup);
                }
            }
            return Err(e);
        }
        Ok(disk)
    }

    /// Detach the disk whose volume name or path is `selector`, then delete its volume.
    pub fn detach_disk(&self, domain: &str, selector: &str) -> Result<()> {
        let definition = self.definition(domain)?;
        let disk = definition
            .disks()
            .into_iter()
            .filter(|d| !d.is_cdrom())
            .find(|d| {
                d.source.as_deref().is_some_and(|p| {
                    p.as_str() == selector || p.file_name() == Some(selector)
                })
            })
            .ok_or_else(|| ProvisionError::DeviceNotFound {
                domain: domain.to_string(),
                device: selector.to_string(),
            })?;
        let (Some(path), Some(device)) = (disk.source.clone(), disk.target.clone()) else {
            return Err(ProvisionError::DeviceNotFound {
                domain: domain.to_string(),
                device: selector.to_string(),
            });
        };
        let format = disk
            .format
            .as_deref()
            .map(|f| f.parse().unwrap_or(VolumeFormat::Raw))
            .unwrap_or(VolumeFormat::Raw);
        let attachment = DiskAttachment {
            path: path.clone(),
            device,
            bus: disk.bus.clone().unwrap_or_else(|| "virtio".to_string()),
            format,
            shareable: false,
        };

        let scope = self.scope(domain)?;
        self.conn
            .detach_device(domain, &attachment.to_xml()?, scope)?;
        // Persist the detach before touching the volume.
        self.refresh_definition(domain)?;
        info!("Detached {} from {}", path, domain);
        delete_if_managed(&VolumeManager::new(self.conn), &path)
    }

    /// Resolve a name to a virtual network, falling back to a host bridge.
    pub fn resolve_interface_source(&self, name: &str) -> Result<InterfaceSource> {
        if self.conn.list_networks()?.iter().any(|n| n == name) {
            return Ok(InterfaceSource::Network(name.to_string()));
        }
        if self.conn.list_interfaces()?.iter().any(|i| i == name) {
            return Ok(InterfaceSource::Bridge(name.to_string()));
        }
        Err(ProvisionError::InvalidParameter(format!(
            "{name} is neither a virtual network nor a host interface"
        )))
    }

    /// Attach a NIC with a fresh MAC; returns what was attached.
    pub fn attach_nic(&self, domain: &str, source: InterfaceSource) -> Result<NicAttachment> {
        self.definition(domain)?;
        let nic = NicAttachment::new(source);
        let scope = self.scope(domain)?;
        self.conn.attach_device(domain, &nic.to_xml()?, scope)?;
        self.refresh_definition(domain)?;
        info!("Attached interface {} to {}", nic.mac, domain);
        Ok(nic)
    }

    /// Detach the interface at position `ethN` in document order.
    pub fn detach_nic(&self, domain: &str, slot: &str) -> Result<NicAttachment> {
        let index = parse_eth_slot(slot)?;
        let definition = self.definition(domain)?;
        let iface = definition
            .interfaces()
            .into_iter()
            .nth(index)
            .ok_or_else(|| ProvisionError::DeviceNotFound {
                domain: domain.to_string(),
                device: slot.to_string(),
            })?;
        self.detach_interface(domain, slot, iface)
    }

    /// Detach the interface with this MAC address.
    pub fn detach_nic_by_mac(&self, domain: &str, mac: &str) -> Result<NicAttachment> {
        let mac = mac.to_lowercase();
        let definition = self.definition(domain)?;
        let iface = definition
            .interfaces()
            .into_iter()
            .find(|i| i.mac.as_deref() == Some(mac.as_str()))
            .ok_or_else(|| ProvisionError::DeviceNotFound {
                domain: domain.to_string(),
                device: mac.clone(),
            })?;
        self.detach_interface(domain, &mac, iface)
    }

    fn detach_interface(
        &self,
        domain: &str,
        selector: &str,
        iface: crate::descriptor::InterfaceInfo,
    ) -> Result<NicAttachment> {
        let not_found = || ProvisionError::DeviceNotFound {
            domain: domain.to_string(),
            device: selector.to_string(),
        };
        let name = iface.source.ok_or_else(not_found)?;
        let source = match iface.kind.as_str() {
            "bridge" => InterfaceSource::Bridge(name),
            _ => InterfaceSource::Network(name),
        };
        let nic = NicAttachment {
            mac: iface.mac.ok_or_else(not_found)?,
            source,
            model: iface.model.unwrap_or_else(|| "virtio".to_string()),
        };
        let scope = self.scope(domain)?;
        self.conn.detach_device(domain, &nic.to_xml()?, scope)?;
        self.refresh_definition(domain)?;
        info!("Detached interface {} from {}", nic.mac, domain);
        Ok(nic)
    }
}

/// Delete a volume if a pool owns it; unmanaged files are left alone.
pub(crate) fn delete_if_managed(volumes: &VolumeManager<'_>, path: &Utf8Path) -> Result<()> {
    match volumes.delete_volume(path) {
        Ok(()) => Ok(()),
        Err(ProvisionError::VolumeNotFound(_)) => {
            warn!("{} is not a managed volume; leaving it in place", path);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TEMPLATE_XML;
    use crate::libvirt::fake::FakeHypervisor;
    use crate::units;

    const BARE: &str = "<domain type='kvm'><name>vm1</name><memory unit='KiB'>1048576</memory><vcpu>1</vcpu><devices><disk type='file' device='cdrom'><target dev='hda' bus='ide'/></disk></devices></domain>";

    #[test]
    fn test_next_disk_slot_skips_cdrom() {
        let d = DomainDescriptor::parse(TEMPLATE_XML).unwrap();
        assert_eq!(next_disk_slot(&d).unwrap(), "vdc");
        let d = DomainDescriptor::parse(BARE).unwrap();
        assert_eq!(next_disk_slot(&d).unwrap(), "vda");
        assert_eq!(next_network_slot(&d), "eth0");
    }

    #[test]
    fn test_slots_are_monotonic() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        let devices = DeviceManager::new(&fake);
        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(devices.add_disk("vm1", &DiskRequest::new("default", 1)).unwrap().device);
        }
        assert_eq!(names, ["vda", "vdb", "vdc", "vdd"]);
        assert!(fake.volume_paths().contains(&"/var/lib/libvirt/images/vm1_4.img".to_string()));
    }

    #[test]
    fn test_disk_xml() {
        let mut disk = DiskAttachment::virtio("/images/d.img", "vdb", VolumeFormat::Raw);
        disk.shareable = true;
        similar_asserts::assert_eq!(
            disk.to_xml().unwrap(),
            r#"<disk type="file" device="disk"><driver name="qemu" type="raw" cache="none"/><source file="/images/d.img"/><target bus="virtio" dev="vdb"/><shareable/></disk>"#
        );
    }

    #[test]
    fn test_random_mac() {
        for _ in 0..32 {
            let mac = random_mac();
            assert!(mac.starts_with("52:54:00:"));
            let octets: Vec<_> = mac.split(':').collect();
            assert_eq!(octets.len(), 6);
            assert!(u8::from_str_radix(octets[3], 16).unwrap() < 0x80);
        }
    }

    #[test]
    fn test_attach_refreshes_definition() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        fake.start_domain("vm1").unwrap();
        fake.add_volume("default", "extra.img", units::GIB, None);
        let devices = DeviceManager::new(&fake);
        let disk = DiskAttachment::virtio(
            "/var/lib/libvirt/images/extra.img",
            "vda",
            VolumeFormat::Raw,
        );
        devices.attach_disk("vm1", &disk).unwrap();

        let calls = fake.attach_scopes();
        assert_eq!(calls, vec![DeviceScope::Live]);
        assert!(fake.persistent_xml("vm1").unwrap().contains("extra.img"));
    }

    #[test]
    fn test_detach_disk_by_name_or_path() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        let devices = DeviceManager::new(&fake);
        let a = devices.add_disk("vm1", &DiskRequest::new("default", 1)).unwrap();
        let b = devices.add_disk("vm1", &DiskRequest::new("default", 1)).unwrap();

        devices.detach_disk("vm1", "vm1_1.img").unwrap();
        devices.detach_disk("vm1", b.path.as_str()).unwrap();
        assert!(!fake.volume_paths().contains(&a.path.to_string()));
        assert!(fake.volume_paths().is_empty());
        let d = DomainDescriptor::parse(&fake.domain_xml("vm1").unwrap()).unwrap();
        assert_eq!(d.non_cdrom_disk_count(), 0);

        let err = devices.detach_disk("vm1", "nope.img").unwrap_err();
        assert!(matches!(err, ProvisionError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_detach_persists_even_when_volume_delete_fails() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        fake.start_domain("vm1").unwrap();
        let devices = DeviceManager::new(&fake);
        let disk = devices.add_disk("vm1", &DiskRequest::new("default", 1)).unwrap();
        // A volume backed by the disk keeps it from being deleted.
        fake.add_volume("default", "child.qcow2", units::GIB, Some(disk.path.as_str()));

        let err = devices.detach_disk("vm1", disk.path.as_str()).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidParameter(_)), "{err}");

        let live = DomainDescriptor::parse(&fake.domain_xml("vm1").unwrap()).unwrap();
        let persistent = DomainDescriptor::parse(&fake.persistent_xml("vm1").unwrap()).unwrap();
        assert_eq!(live.non_cdrom_disk_count(), 0);
        assert_eq!(persistent.non_cdrom_disk_count(), 0);
        assert!(fake.volume_paths().contains(&disk.path.to_string()));
    }

    #[test]
    fn test_slot_collision_is_not_retried() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        fake.start_domain("vm1").unwrap();
        fake.add_volume("default", "a.img", units::GIB, None);
        fake.add_volume("default", "b.img", units::GIB, None);
        let devices = DeviceManager::new(&fake);

        let slot = devices.next_disk_slot("vm1").unwrap();
        assert_eq!(slot, "vda");
        let first = DiskAttachment::virtio(
            "/var/lib/libvirt/images/a.img",
            slot.clone(),
            VolumeFormat::Raw,
        );
        devices.attach_disk("vm1", &first).unwrap();

        let attaches = |fake: &FakeHypervisor| {
            fake.calls()
                .iter()
                .filter(|c| *c == "attach_device")
                .count()
        };
        let before = attaches(&fake);
        let second =
            DiskAttachment::virtio("/var/lib/libvirt/images/b.img", slot, VolumeFormat::Raw);
        let err = devices.attach_disk("vm1", &second).unwrap_err();
        assert!(err.to_string().contains("target already exists"), "{err}");
        assert_eq!(attaches(&fake), before + 1);

        let live = DomainDescriptor::parse(&fake.domain_xml("vm1").unwrap()).unwrap();
        assert_eq!(live.non_cdrom_disk_count(), 1);
    }

    #[test]
    fn test_add_existing_and_backed_disks() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        fake.add_volume("default", "shared.img", units::GIB, None);
        fake.add_volume("default", "base.qcow2", 2 * units::GIB, None);
        let devices = DeviceManager::new(&fake);

        let shared = devices
            .add_disk(
                "vm1",
                &DiskRequest {
                    existing: Some("/var/lib/libvirt/images/shared.img".into()),
                    shareable: true,
                    ..DiskRequest::new("default", 1)
                },
            )
            .unwrap();
        assert_eq!(shared.device, "vda");
        assert!(shared.shareable);

        let backed = devices
            .add_disk(
                "vm1",
                &DiskRequest {
                    backing: Some("base.qcow2".into()),
                    ..DiskRequest::new("default", 4)
                },
            )
            .unwrap();
        assert_eq!(backed.device, "vdb");
        let vol = fake.volume(backed.path.as_str()).unwrap();
        assert_eq!(
            vol.backing.unwrap().path,
            "/var/lib/libvirt/images/base.qcow2"
        );

        let missing = DiskRequest {
            existing: Some("/nowhere.img".into()),
            ..DiskRequest::new("default", 1)
        };
        assert!(matches!(
            devices.add_disk("vm1", &missing).unwrap_err(),
            ProvisionError::VolumeNotFound(_)
        ));
    }

    #[test]
    fn test_failed_attach_removes_new_volume() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        fake.fail_operation("attach_device");
        let devices = DeviceManager::new(&fake);
        assert!(devices.add_disk("vm1", &DiskRequest::new("default", 1)).is_err());
        assert!(fake.volume_paths().is_empty());
    }

    #[test]
    fn test_nic_attach_and_positional_detach() {
        let fake = FakeHypervisor::new();
        fake.define_domain(BARE).unwrap();
        let devices = DeviceManager::new(&fake);

        let source = devices.resolve_interface_source("default").unwrap();
        assert_eq!(source, InterfaceSource::Network("default".into()));
        let first = devices.attach_nic("vm1", source.clone()).unwrap();
        let second = devices.attach_nic("vm1", source).unwrap();
        assert_ne!(first.mac, second.mac);

        let d = DomainDescriptor::parse(&fake.domain_xml("vm1").unwrap()).unwrap();
        assert_eq!(next_network_slot(&d), "eth2");

        let removed = devices.detach_nic("vm1", "eth1").unwrap();
        assert_eq!(removed.mac, second.mac);
        let removed = devices.detach_nic_by_mac("vm1", &first.mac.to_uppercase()).unwrap();
        assert_eq!(removed.mac, first.mac);

        assert!(matches!(
            devices.detach_nic("vm1", "eth0").unwrap_err(),
            ProvisionError::DeviceNotFound { .. }
        ));
        assert!(matches!(
            devices.detach_nic("vm1", "nic0").unwrap_err(),
            ProvisionError::InvalidParameter(_)
        ));
        assert!(devices.resolve_interface_source("nowhere").is_err());
        assert_eq!(
            devices.resolve_interface_source("br0").unwrap(),
            InterfaceSource::Bridge("br0".into())
        );
    }

    #[test]
    fn test_missing_domain() {
        let fake = FakeHypervisor::new();
        let devices = DeviceManager::new(&fake);
        assert!(matches!(
            devices.next_disk_slot("ghost").unwrap_err(),
            ProvisionError::DomainNotFound(_)
        ));
    }
}
