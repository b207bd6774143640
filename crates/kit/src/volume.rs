//! Storage volumes and copy-on-write disk cloning
//!
//! New instance disks are thin qcow2 overlays whose backing store is the
//! template's disk. A volume and its backing image always live in the same
//! storage pool.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::pool::{PoolDescriptor, PoolManager};
use crate::units;
use crate::xml_utils::{parse_xml_dom, XmlNode, XmlWriter};

/// Capacity used when a caller asks for a zero-sized volume (e.g. before an upload).
pub const PLACEHOLDER_CAPACITY: u64 = 500 * units::KIB;

/// On-disk image format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    /// Plain image.
    Raw,
    /// QEMU copy-on-write image.
    Qcow2,
    /// ISO 9660 image.
    Iso,
    /// Any other format libvirt reports.
    #[serde(untagged)]
    Other(String),
}

impl VolumeFormat {
    /// libvirt's name for this format.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Iso => "iso",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "raw" => Self::Raw,
            "qcow2" => Self::Qcow2,
            "iso" => Self::Iso,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Whether a volume is a regular file or a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// File in a directory-backed pool.
    File,
    /// Block device (e.g. an LVM logical volume).
    Block,
}

/// Backing image of a copy-on-write volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingStore {
    /// Path of the backing image.
    pub path: Utf8PathBuf,
    /// Format of the backing image.
    pub format: VolumeFormat,
}

/// A storage volume definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    /// Volume name (the file name inside its pool).
    pub name: String,
    /// Full path.
    pub path: Utf8PathBuf,
    /// Virtual size in bytes.
    pub capacity: u64,
    /// Image format.
    pub format: VolumeFormat,
    /// File or block.
    pub kind: VolumeKind,
    /// Copy-on-write parent, if any.
    pub backing: Option<BackingStore>,
}

impl VolumeDescriptor {
    /// Serialize to a libvirt volume descriptor.
    pub fn to_xml(&self) -> Result<String> {
        let kind = match self.kind {
            VolumeKind::File => "file",
            VolumeKind::Block => "block",
        };
        let mut w = XmlWriter::new();
        w.start_element("volume", &[("type", kind)])?;
        w.write_text_element("name", &self.name)?;
        w.write_text_element_with_attrs(
            "capacity",
            &self.capacity.to_string(),
            &[("unit", "bytes")],
        )?;
        w.start_element("target", &[])?;
        w.write_text_element("path", self.path.as_str())?;
        if self.kind == VolumeKind::File {
            w.write_empty_element("format", &[("type", self.format.as_str())])?;
        }
        w.start_element("permissions", &[])?;
        w.write_text_element("mode", "0644")?;
        w.end_element("permissions")?;
        if self.format == VolumeFormat::Qcow2 {
            w.write_text_element("compat", "1.1")?;
        }
        w.end_element("target")?;
        if let Some(backing) = &self.backing {
            w.start_element("backingStore", &[])?;
            w.write_text_element("path", backing.path.as_str())?;
            w.write_empty_element("format", &[("type", backing.format.as_str())])?;
            w.end_element("backingStore")?;
        }
        w.end_element("volume")?;
        w.into_string()
    }

    /// Parse `virsh vol-dumpxml` output.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let dom = parse_xml_dom(xml)?;
        let name = dom
            .child("name")
            .map(|n| n.text_content().to_string())
            .ok_or_else(|| ProvisionError::Xml("volume descriptor has no name".into()))?;
        let target = dom
            .child("target")
            .ok_or_else(|| ProvisionError::Xml(format!("volume {name} has no target")))?;
        let path = target
            .child("path")
            .map(|p| Utf8PathBuf::from(p.text_content()))
            .ok_or_else(|| ProvisionError::Xml(format!("volume {name} has no path")))?;
        let capacity = dom
            .child("capacity")
            .and_then(|c| units::to_bytes(c.text_content(), c.attr("unit").unwrap_or("bytes")))
            .unwrap_or(0);
        let kind = match dom.attr("type") {
            Some("block") => VolumeKind::Block,
            _ => VolumeKind::File,
        };
        let backing = dom.child("backingStore").and_then(|b| {
            let path = b.child("path")?.text_content();
            Some(BackingStore {
                path: Utf8PathBuf::from(path),
                format: format_of(b),
            })
        });
        Ok(Self {
            format: format_of(target),
            name,
            path,
            capacity,
            kind,
            backing,
        })
    }
}

fn format_of(node: &XmlNode) -> VolumeFormat {
    node.child("format")
        .and_then(|f| f.attr("type"))
        .map(|t| t.parse().unwrap_or(VolumeFormat::Raw))
        .unwrap_or(VolumeFormat::Raw)
}

/// Where a volume lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeLocation {
    /// Owning pool.
    pub pool: String,
    /// Full path.
    pub path: Utf8PathBuf,
}

/// Volume operations over a hypervisor connection.
#[derive(Debug, Clone, Copy)]
pub struct VolumeManager<'a> {
    conn: &'a dyn Hypervisor,
}

impl<'a> VolumeManager<'a> {
    /// Wrap a connection.
    pub fn new(conn: &'a dyn Hypervisor) -> Self {
        Self { conn }
    }

    /// Create a volume named `name` in `pool`.
    ///
    /// A `capacity` of zero yields a [`PLACEHOLDER_CAPACITY`] volume. When
    /// `backing` is given it must be an existing volume of the same pool.
    pub fn create_volume(
        &self,
        pool: &str,
        name: &str,
        capacity: u64,
        format: VolumeFormat,
        backing: Option<&Utf8Path>,
    ) -> Result<VolumeDescriptor> {
        let pool = PoolManager::new(self.conn).describe(pool)?;
        let descriptor = VolumeDescriptor {
            name: name.to_string(),
            path: pool.path.join(name),
            capacity,
            format,
            kind: if pool.is_logical() {
                VolumeKind::Block
            } else {
                VolumeKind::File
            },
            backing: None,
        };
        self.create_described(&pool, descriptor, backing)
    }

    fn create_described(
        &self,
        pool: &PoolDescriptor,
        mut descriptor: VolumeDescriptor,
        backing: Option<&Utf8Path>,
    ) -> Result<VolumeDescriptor> {
        if descriptor.capacity == 0 {
            descriptor.capacity = PLACEHOLDER_CAPACITY;
        }
        if let Some(backing) = backing {
            let parent = self
                .conn
                .lookup_volume(backing.as_str())?
                .ok_or_else(|| ProvisionError::VolumeNotFound(backing.to_string()))?;
            if parent.pool != pool.name {
                return Err(ProvisionError::InvalidParameter(format!(
                    "backing volume {backing} lives in pool {} but the new volume targets pool {}",
                    parent.pool, pool.name
                )));
            }
            descriptor.backing = Some(BackingStore {
                path: backing.to_owned(),
                format: parent.volume.format,
            });
        }
        if self.conn.lookup_volume(descriptor.path.as_str())?.is_some() {
            return Err(ProvisionError::InvalidParameter(format!(
                "volume {} already exists",
                descriptor.path
            )));
        }

        let xml = descriptor.to_xml()?;
        debug!("Creating volume {} in pool {}", descriptor.path, pool.name);
        self.conn.create_volume(&pool.name, &xml)?;
        info!(
            "Created volume {} ({} bytes, {})",
            descriptor.path, descriptor.capacity, descriptor.format
        );
        Ok(descriptor)
    }

    /// Create a thin overlay of `source` named `new_name`, next to it in the same pool.
    ///
    /// The overlay keeps the source's capacity unless `capacity` overrides it.
    pub fn clone_disk(
        &self,
        source: &Utf8Path,
        new_name: &str,
        capacity: Option<u64>,
    ) -> Result<VolumeDescriptor> {
        let parent = self
            .conn
            .lookup_volume(source.as_str())?
            .ok_or_else(|| ProvisionError::VolumeNotFound(source.to_string()))?;
        let pool = PoolManager::new(self.conn).describe(&parent.pool)?;
        if pool.is_logical() {
            return Err(ProvisionError::InvalidParameter(format!(
                "{source} is in logical pool {}, which cannot hold copy-on-write overlays",
                parent.pool
            )));
        }
        let descriptor = VolumeDescriptor {
            name: new_name.to_string(),
            path: source.with_file_name(new_name),
            capacity: capacity.unwrap_or(parent.volume.capacity),
            format: VolumeFormat::Qcow2,
            kind: VolumeKind::File,
            backing: None,
        };
        self.create_described(&pool, descriptor, Some(source))
    }

    /// Create a data disk of `size_gb` gigabytes.
    ///
    /// Thin disks are qcow2; thick disks, and every disk in a logical pool, are raw.
    pub fn create_disk(
        &self,
        pool: &str,
        name: &str,
        size_gb: u64,
        thin: bool,
        backing: Option<&Utf8Path>,
    ) -> Result<VolumeDescriptor> {
        if size_gb < 1 {
            return Err(ProvisionError::InvalidParameter(format!(
                "disk size must be at least 1 GB, got {size_gb}"
            )));
        }
        let logical = PoolManager::new(self.conn).describe(pool)?.is_logical();
        let format = if thin && !logical {
            VolumeFormat::Qcow2
        } else {
            VolumeFormat::Raw
        };
        self.create_volume(pool, name, units::gib(size_gb), format, backing)
    }

    /// Paths of volumes whose backing store is `path`.
    pub fn dependents(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut found = Vec::new();
        for pool in self.conn.list_pools()? {
            for vol in self.conn.list_volumes(&pool)? {
                let Some(record) = self.conn.lookup_volume(&vol)? else {
                    continue;
                };
                if record.volume.backing.as_ref().map(|b| b.path.as_path()) == Some(path) {
                    found.push(record.volume.path);
                }
            }
        }
        Ok(found)
    }

    /// Delete the volume at `path`.
    ///
    /// Refuses to delete a volume that still backs another volume.
    pub fn delete_volume(&self, path: &Utf8Path) -> Result<()> {
        if self.conn.lookup_volume(path.as_str())?.is_none() {
            return Err(ProvisionError::VolumeNotFound(path.to_string()));
        }
        let dependents = self.dependents(path)?;
        if !dependents.is_empty() {
            return Err(ProvisionError::InvalidParameter(format!(
                "volume {path} still backs {}",
                dependents
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        self.conn.delete_volume(path.as_str())?;
        info!("Deleted volume {}", path);
        Ok(())
    }

    /// Every volume on the host, keyed by volume name.
    pub fn list_volumes(&self) -> Result<BTreeMap<String, VolumeLocation>> {
        let mut out = BTreeMap::new();
        for pool in self.conn.list_pools()? {
            for path in self.conn.list_volumes(&pool)? {
                let path = Utf8PathBuf::from(path);
                let Some(name) = path.file_name().map(str::to_string) else {
                    continue;
                };
                if out.contains_key(&name) {
                    warn!("Volume name {} appears in more than one pool", name);
                }
                out.insert(
                    name,
                    VolumeLocation {
                        pool: pool.clone(),
                        path,
                    },
                );
            }
        }
        Ok(out)
    }

    /// Resolve a volume given by absolute path or by bare name.
    pub fn resolve(&self, selector: &str) -> Result<VolumeLocation> {
        if selector.starts_with('/') {
            let record = self
                .conn
                .lookup_volume(selector)?
                .ok_or_else(|| ProvisionError::VolumeNotFound(selector.to_string()))?;
            return Ok(VolumeLocation {
                pool: record.pool,
                path: record.volume.path,
            });
        }
        self.list_volumes()?
            .remove(selector)
            .ok_or_else(|| ProvisionError::VolumeNotFound(selector.to_string()))
    }

    /// Upload a local image file as a new volume `name` in `pool`.
    pub fn upload_image(
        &self,
        pool: &str,
        source: &Utf8Path,
        name: &str,
        format: VolumeFormat,
    ) -> Result<VolumeDescriptor> {
        let size = std::fs::metadata(source)?.len();
        let descriptor = self.create_volume(pool, name, size, format, None)?;
        if let Err(e) = self.conn.upload_volume(descriptor.path.as_str(), source) {
            if let Err(cleanup) = self.conn.delete_volume(descriptor.path.as_str()) {
                warn!("Failed to remove {} after upload error: {}", descriptor.path, cleanup);
            }
            return Err(e);
        }
        info!("Uploaded {} to {}", source, descriptor.path);
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::fake::FakeHypervisor;
    use indoc::indoc;

    #[test]
    fn test_volume_xml_with_backing() {
        let vol = VolumeDescriptor {
            name: "web1.qcow2".into(),
            path: "/var/lib/libvirt/images/web1.qcow2".into(),
            capacity: 10 * units::GIB,
            format: VolumeFormat::Qcow2,
            kind: VolumeKind::File,
            backing: Some(BackingStore {
                path: "/var/lib/libvirt/images/centos7.qcow2".into(),
                format: VolumeFormat::Qcow2,
            }),
        };
        let xml = vol.to_xml().unwrap();
        assert!(xml.starts_with("<volume type=\"file\"><name>web1.qcow2</name>"));
        assert!(xml.contains("<capacity unit=\"bytes\">10737418240</capacity>"));
        assert!(xml.contains("<mode>0644</mode>"));
        assert!(xml.contains("<compat>1.1</compat>"));
        assert!(xml.contains(
            "<backingStore><path>/var/lib/libvirt/images/centos7.qcow2</path><format type=\"qcow2\"/></backingStore>"
        ));
        assert_eq!(VolumeDescriptor::from_xml(&xml).unwrap(), vol);
    }

    #[test]
    fn test_parse_vol_dumpxml() {
        let xml = indoc! {r#"
            <volume type='file'>
              <name>seed.img</name>
              <key>/var/lib/libvirt/images/seed.img</key>
              <capacity unit='bytes'>1048576</capacity>
              <allocation unit='bytes'>1048576</allocation>
              <target>
                <path>/var/lib/libvirt/images/seed.img</path>
                <format type='raw'/>
              </target>
            </volume>
        "#};
        let vol = VolumeDescriptor::from_xml(xml).unwrap();
        assert_eq!(vol.name, "seed.img");
        assert_eq!(vol.capacity, 1024 * 1024);
        assert_eq!(vol.format, VolumeFormat::Raw);
        assert!(vol.backing.is_none());
    }

    #[test]
    fn test_zero_capacity_gets_placeholder() {
        let fake = FakeHypervisor::new();
        let vols = VolumeManager::new(&fake);
        let vol = vols
            .create_volume("default", "empty.img", 0, VolumeFormat::Raw, None)
            .unwrap();
        assert_eq!(vol.capacity, PLACEHOLDER_CAPACITY);
        assert!(!vol.to_xml().unwrap().contains("compat"));
    }

    #[test]
    fn test_clone_disk_is_overlay() {
        let fake = FakeHypervisor::new();
        fake.add_volume("default", "centos7.qcow2", 8 * units::GIB, None);
        let vols = VolumeManager::new(&fake);
        let source = Utf8Path::new("/var/lib/libvirt/images/centos7.qcow2");

        let vol = vols.clone_disk(source, "web1.qcow2", None).unwrap();
        assert_eq!(vol.path, "/var/lib/libvirt/images/web1.qcow2");
        assert_eq!(vol.capacity, 8 * units::GIB);
        assert_eq!(vol.format, VolumeFormat::Qcow2);
        assert_eq!(vol.backing.as_ref().unwrap().path, source);

        let sized = vols
            .clone_disk(source, "web2.qcow2", Some(20 * units::GIB))
            .unwrap();
        assert_eq!(sized.capacity, 20 * units::GIB);

        let deps = vols.dependents(source).unwrap();
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_clone_missing_source() {
        let fake = FakeHypervisor::new();
        let vols = VolumeManager::new(&fake);
        let err = vols
            .clone_disk(Utf8Path::new("/var/lib/libvirt/images/nope.qcow2"), "x.qcow2", None)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::VolumeNotFound(_)));
        assert!(fake.volume_paths().is_empty());
    }

    #[test]
    fn test_clone_rejects_logical_pool() {
        let fake = FakeHypervisor::new();
        fake.add_pool("vg0", "/dev/vg0", "logical");
        fake.add_volume("vg0", "base", units::GIB, None);
        let vols = VolumeManager::new(&fake);
        let err = vols
            .clone_disk(Utf8Path::new("/dev/vg0/base"), "web1", None)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidParameter(_)), "{err}");
        assert_eq!(fake.volume_paths(), vec!["/dev/vg0/base".to_string()]);
    }

    #[test]
    fn test_backing_must_share_pool() {
        let fake = FakeHypervisor::new();
        fake.add_pool("fast", "/srv/fast", "dir");
        fake.add_volume("fast", "base.qcow2", units::GIB, None);
        let vols = VolumeManager::new(&fake);
        let err = vols
            .create_volume(
                "default",
                "child.qcow2",
                units::GIB,
                VolumeFormat::Qcow2,
                Some(Utf8Path::new("/srv/fast/base.qcow2")),
            )
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidParameter(_)));
    }

    #[test]
    fn test_delete_refuses_backing_volume() {
        let fake = FakeHypervisor::new();
        fake.add_volume("default", "centos7.qcow2", units::GIB, None);
        let vols = VolumeManager::new(&fake);
        let base = Utf8Path::new("/var/lib/libvirt/images/centos7.qcow2");
        let child = vols.clone_disk(base, "web1.qcow2", None).unwrap();

        assert!(matches!(
            vols.delete_volume(base).unwrap_err(),
            ProvisionError::InvalidParameter(_)
        ));
        vols.delete_volume(&child.path).unwrap();
        vols.delete_volume(base).unwrap();
        assert!(matches!(
            vols.delete_volume(base).unwrap_err(),
            ProvisionError::VolumeNotFound(_)
        ));
    }

    #[test]
    fn test_create_disk_formats() {
        let fake = FakeHypervisor::new();
        fake.add_pool("vg0", "/dev/vg0", "logical");
        let vols = VolumeManager::new(&fake);

        assert!(matches!(
            vols.create_disk("default", "d.img", 0, true, None).unwrap_err(),
            ProvisionError::InvalidParameter(_)
        ));
        let thin = vols.create_disk("default", "thin.img", 2, true, None).unwrap();
        assert_eq!(thin.format, VolumeFormat::Qcow2);
        assert_eq!(thin.capacity, 2 * units::GIB);
        let thick = vols.create_disk("default", "thick.img", 1, false, None).unwrap();
        assert_eq!(thick.format, VolumeFormat::Raw);
        let lv = vols.create_disk("vg0", "lv1", 1, true, None).unwrap();
        assert_eq!(lv.format, VolumeFormat::Raw);
        assert_eq!(lv.kind, VolumeKind::Block);
        assert_eq!(lv.path, "/dev/vg0/lv1");
    }

    #[test]
    fn test_list_volumes() {
        let fake = FakeHypervisor::new();
        fake.add_volume("default", "a.qcow2", units::GIB, None);
        fake.add_pool("fast", "/srv/fast", "dir");
        fake.add_volume("fast", "b.img", units::GIB, None);
        let all = VolumeManager::new(&fake).list_volumes().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a.qcow2"].pool, "default");
        assert_eq!(all["b.img"].path, "/srv/fast/b.img");

        let volumes = VolumeManager::new(&fake);
        assert_eq!(volumes.resolve("b.img").unwrap().pool, "fast");
        assert_eq!(
            volumes.resolve("/var/lib/libvirt/images/a.qcow2").unwrap().pool,
            "default"
        );
        assert!(matches!(
            volumes.resolve("/srv/fast/missing.img").unwrap_err(),
            ProvisionError::VolumeNotFound(_)
        ));
    }

    #[test]
    fn test_upload_image() {
        let fake = FakeHypervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8PathBuf::try_from(dir.path().join("cloud.qcow2")).unwrap();
        std::fs::write(&src, vec![0u8; 4096]).unwrap();

        let vol = VolumeManager::new(&fake)
            .upload_image("default", &src, "cloud.qcow2", VolumeFormat::Qcow2)
            .unwrap();
        assert_eq!(vol.capacity, 4096);
        assert_eq!(fake.uploads(), vec![(vol.path.to_string(), src)]);
    }

    #[test]
    fn test_failed_upload_removes_volume() {
        let fake = FakeHypervisor::new();
        fake.fail_operation("upload_volume");
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8PathBuf::try_from(dir.path().join("cloud.qcow2")).unwrap();
        std::fs::write(&src, b"qcow").unwrap();

        let err = VolumeManager::new(&fake)
            .upload_image("default", &src, "cloud.qcow2", VolumeFormat::Qcow2)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Hypervisor { .. }));
        assert!(fake.volume_paths().is_empty());
    }
}
