//! Domain descriptors and template instantiation
//!
//! [`instantiate`] turns a template's domain XML into the XML of a new,
//! independently identified instance. It performs no I/O: volumes are created
//! by the engine from the [`DiskRewrite`] it returns.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::{ProvisionError, Result};
use crate::units;
use crate::xml_utils::{parse_xml_dom, XmlNode};

/// Device name of the cloud-init seed disk.
pub const SEED_DEVICE: &str = "vdb";

/// A parsed libvirt domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    root: XmlNode,
}

/// Read-only view of a `<disk>` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    /// `disk`, `cdrom`, `floppy` or `lun`.
    pub device: String,
    /// Backing file or block device.
    pub source: Option<Utf8PathBuf>,
    /// Guest device name (`vda`, ...).
    pub target: Option<String>,
    /// Guest bus.
    pub bus: Option<String>,
    /// Image format from the driver element.
    pub format: Option<String>,
}

impl DiskInfo {
    fn from_node(node: &XmlNode) -> Self {
        let source = node.child("source").and_then(|s| {
            s.attr("file")
                .or_else(|| s.attr("dev"))
                .map(Utf8PathBuf::from)
        });
        let target = node.child("target");
        Self {
            device: node.attr("device").unwrap_or("disk").to_string(),
            source,
            target: target.and_then(|t| t.attr("dev")).map(str::to_string),
            bus: target.and_then(|t| t.attr("bus")).map(str::to_string),
            format: node
                .child("driver")
                .and_then(|d| d.attr("type"))
                .map(str::to_string),
        }
    }

    /// Whether this is a CD-ROM drive.
    pub fn is_cdrom(&self) -> bool {
        self.device == "cdrom"
    }
}

/// Read-only view of an `<interface>` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    /// Interface type (`network`, `bridge`, ...).
    pub kind: String,
    /// Network or bridge name.
    pub source: Option<String>,
    /// MAC address, if assigned.
    pub mac: Option<String>,
    /// Device model.
    pub model: Option<String>,
}

impl InterfaceInfo {
    fn from_node(node: &XmlNode) -> Self {
        let source = node.child("source").and_then(|s| {
            s.attr("network")
                .or_else(|| s.attr("bridge"))
                .or_else(|| s.attr("dev"))
                .map(str::to_string)
        });
        Self {
            kind: node.attr("type").unwrap_or("network").to_string(),
            source,
            mac: node
                .child("mac")
                .and_then(|m| m.attr("address"))
                .map(str::to_lowercase),
            model: node
                .child("model")
                .and_then(|m| m.attr("type"))
                .map(str::to_string),
        }
    }
}

fn is_cdrom(node: &XmlNode) -> bool {
    node.name == "disk" && node.attr("device") == Some("cdrom")
}

impl DomainDescriptor {
    /// Parse domain XML.
    pub fn parse(xml: &str) -> Result<Self> {
        let root = parse_xml_dom(xml)?;
        if root.name != "domain" {
            return Err(ProvisionError::Xml(format!(
                "expected a <domain> document, found <{}>",
                root.name
            )));
        }
        Ok(Self { root })
    }

    /// Serialize back to XML.
    pub fn to_xml(&self) -> Result<String> {
        self.root.to_xml()
    }

    /// Underlying DOM.
    pub fn root(&self) -> &XmlNode {
        &self.root
    }

    /// Domain name.
    pub fn name(&self) -> Option<&str> {
        self.root.child("name").map(|n| n.text_content())
    }

    /// Domain UUID, present only on defined domains.
    pub fn uuid(&self) -> Option<&str> {
        self.root.child("uuid").map(|n| n.text_content())
    }

    /// Maximum memory in bytes.
    pub fn memory_bytes(&self) -> Option<u64> {
        let mem = self.root.child("memory")?;
        units::to_bytes(mem.text_content(), mem.attr("unit").unwrap_or("KiB"))
    }

    /// Declared vCPU count.
    pub fn vcpus(&self) -> Option<u32> {
        self.root.child("vcpu")?.text_content().trim().parse().ok()
    }

    fn devices(&self) -> impl Iterator<Item = &XmlNode> {
        self.root
            .child("devices")
            .into_iter()
            .flat_map(|d| d.children.iter())
    }

    /// Disk devices in document order.
    pub fn disks(&self) -> Vec<DiskInfo> {
        self.devices()
            .filter(|n| n.name == "disk")
            .map(DiskInfo::from_node)
            .collect()
    }

    /// Network interfaces in document order.
    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.devices()
            .filter(|n| n.name == "interface")
            .map(InterfaceInfo::from_node)
            .collect()
    }

    /// Number of attached disks that are not CD-ROM drives.
    pub fn non_cdrom_disk_count(&self) -> usize {
        self.devices()
            .filter(|n| n.name == "disk" && !is_cdrom(n))
            .count()
    }

    /// First non-CD-ROM disk.
    pub fn primary_disk(&self) -> Option<DiskInfo> {
        self.devices()
            .find(|n| n.name == "disk" && !is_cdrom(n))
            .map(DiskInfo::from_node)
    }
}

/// Memory amount as written into the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySize {
    /// Whole gigabytes.
    Gigabytes(u64),
    /// Megabytes, used for fractional gigabyte requests.
    Megabytes(u64),
}

impl MemorySize {
    /// Interpret a RAM request in gigabytes. Fractional values keep MB precision.
    pub fn from_gb(ram: f64) -> Result<Self> {
        if !ram.is_finite() || ram <= 0.0 {
            return Err(ProvisionError::InvalidParameter(format!(
                "ram must be positive, got {ram}"
            )));
        }
        if ram.fract() == 0.0 {
            Ok(Self::Gigabytes(ram as u64))
        } else {
            Ok(Self::Megabytes((ram * 1024.0) as u64))
        }
    }

    /// Descriptor text.
    pub fn amount(&self) -> u64 {
        match self {
            Self::Gigabytes(n) | Self::Megabytes(n) => *n,
        }
    }

    /// Descriptor unit attribute.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Gigabytes(_) => "GB",
            Self::Megabytes(_) => "MB",
        }
    }

    /// Size in bytes, binary multiples, for admission checks.
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Gigabytes(n) => n.saturating_mul(units::GIB),
            Self::Megabytes(n) => n.saturating_mul(units::MIB),
        }
    }
}

/// Overrides applied to a template. `None` keeps the template's value.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceParams {
    /// New domain name.
    pub name: String,
    /// Memory in gigabytes.
    pub ram: Option<f64>,
    /// vCPU count.
    pub vcpus: Option<u32>,
    /// Primary disk size in gigabytes.
    pub disk_size: Option<u64>,
}

impl InstanceParams {
    /// Parameters that only rename.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ram: None,
            vcpus: None,
            disk_size: None,
        }
    }

    /// Reject empty names and non-positive sizes.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidParameter(
                "domain name must not be empty".into(),
            ));
        }
        if self.name.contains('/') || self.name.chars().any(char::is_whitespace) {
            return Err(ProvisionError::InvalidParameter(format!(
                "domain name {:?} may not contain '/' or whitespace",
                self.name
            )));
        }
        if let Some(ram) = self.ram {
            MemorySize::from_gb(ram)?;
        }
        if self.vcpus == Some(0) {
            return Err(ProvisionError::InvalidParameter(
                "vcpu count must be positive".into(),
            ));
        }
        if self.disk_size == Some(0) {
            return Err(ProvisionError::InvalidParameter(
                "disk size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Where the instance's primary disk comes from and goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRewrite {
    /// Template disk that becomes the backing store.
    pub source: Utf8PathBuf,
    /// New overlay path written into the descriptor.
    pub target: Utf8PathBuf,
}

impl DiskRewrite {
    /// File name of the overlay.
    pub fn target_name(&self) -> &str {
        self.target.file_name().unwrap_or(self.target.as_str())
    }
}

/// Result of [`instantiate`].
#[derive(Debug, Clone)]
pub struct Instantiation {
    /// Descriptor ready for definition.
    pub descriptor: DomainDescriptor,
    /// Primary disk to clone, if the template had one.
    pub disk: Option<DiskRewrite>,
}

/// New path for a disk: the file stem becomes `name`, directory and extension are kept.
///
/// Keeping the extension leaves `web1.qcow2` next to `centos7.qcow2`, so the
/// overlay's format stays visible in pool listings.
pub fn renamed_disk_path(source: &Utf8Path, name: &str) -> Utf8PathBuf {
    let file = match source.extension() {
        Some(ext) => format!("{name}.{ext}"),
        None => name.to_string(),
    };
    source.with_file_name(file)
}

/// Build the seed disk device node.
fn seed_disk_node(seed: &Utf8Path) -> XmlNode {
    XmlNode::new("disk")
        .with_attr("type", "file")
        .with_attr("device", "disk")
        .with_child(
            XmlNode::new("driver")
                .with_attr("name", "qemu")
                .with_attr("type", "raw"),
        )
        .with_child(XmlNode::new("source").with_attr("file", seed.as_str()))
        .with_child(
            XmlNode::new("target")
                .with_attr("dev", SEED_DEVICE)
                .with_attr("bus", "virtio"),
        )
}

/// Derive an instance descriptor from a template.
///
/// Name collisions are the caller's concern. `seed`, when given, is attached
/// as a raw virtio disk at [`SEED_DEVICE`].
pub fn instantiate(
    template: &DomainDescriptor,
    params: &InstanceParams,
    seed: Option<&Utf8Path>,
) -> Result<Instantiation> {
    params.validate()?;
    let mut root = template.root.clone();

    root.remove_descendants("uuid");
    root.for_each_named_mut("name", &mut |n| n.text = params.name.clone());

    if let Some(ram) = params.ram {
        let size = MemorySize::from_gb(ram)?;
        for elem in ["memory", "currentMemory"] {
            if let Some(node) = root.child_mut(elem) {
                node.set_attr("unit", size.unit());
                node.text = size.amount().to_string();
            }
        }
    }

    if let Some(vcpus) = params.vcpus {
        root.ensure_child("vcpu").text = vcpus.to_string();
    }

    let mut disk = None;
    let devices = root.ensure_child("devices");
    for iface in devices
        .children
        .iter_mut()
        .filter(|c| c.name == "interface")
    {
        iface.remove_descendants("mac");
    }

    let primary = devices
        .children
        .iter()
        .position(|c| c.name == "disk" && !is_cdrom(c));
    let mut index = 0;
    devices.children.retain(|c| {
        let keep = c.name != "disk" || Some(index) == primary;
        index += 1;
        keep
    });

    if let Some(node) = devices.children.iter_mut().find(|c| c.name == "disk") {
        let source = node
            .child("source")
            .and_then(|s| s.attr("file").or_else(|| s.attr("dev")))
            .map(Utf8PathBuf::from);
        if let Some(source) = source {
            let target = renamed_disk_path(&source, &params.name);
            node.remove_descendants("backingStore");
            node.set_attr("type", "file");
            node.ensure_child("source").attributes = vec![("file".into(), target.to_string())];
            let driver = node.ensure_child("driver");
            if driver.attr("name").is_none() {
                driver.set_attr("name", "qemu");
            }
            driver.set_attr("type", "qcow2");
            disk = Some(DiskRewrite { source, target });
        }
    }

    if let Some(seed) = seed {
        devices.children.push(seed_disk_node(seed));
    }

    Ok(Instantiation {
        descriptor: DomainDescriptor { root },
        disk,
    })
}

#[cfg(test)]
pub(crate) const TEMPLATE_XML: &str = indoc::indoc! {r#"
    <domain type='kvm'>
      <name>centos7</name>
      <uuid>0b4d3f5e-6f58-4b5b-9d55-6a3d3f4d2c11</uuid>
      <metadata>
        <app:info xmlns:app="urn:example">
          <name>centos7</name>
        </app:info>
      </metadata>
      <memory unit='KiB'>1048576</memory>
      <currentMemory unit='KiB'>1048576</currentMemory>
      <vcpu placement='static'>1</vcpu>
      <os>
        <type arch='x86_64' machine='pc'>hvm</type>
        <boot dev='hd'/>
      </os>
      <on_poweroff>destroy</on_poweroff>
      <on_reboot>restart</on_reboot>
      <on_crash>destroy</on_crash>
      <devices>
        <disk type='file' device='cdrom'>
          <driver name='qemu' type='raw'/>
          <target dev='hda' bus='ide'/>
          <readonly/>
        </disk>
        <disk type='file' device='disk'>
          <driver name='qemu' type='qcow2'/>
          <source file='/var/lib/libvirt/images/centos7.qcow2'/>
          <target dev='vda' bus='virtio'/>
        </disk>
        <disk type='file' device='disk'>
          <driver name='qemu' type='raw'/>
          <source file='/var/lib/libvirt/images/centos7-data.img'/>
          <target dev='vdc' bus='virtio'/>
        </disk>
        <interface type='network'>
          <mac address='52:54:00:aa:bb:cc'/>
          <source network='default'/>
          <model type='virtio'/>
        </interface>
        <interface type='bridge'>
          <mac address='52:54:00:aa:bb:cd'/>
          <source bridge='br0'/>
        </interface>
        <graphics type='vnc' port='-1' autoport='yes'/>
      </devices>
    </domain>
"#};
