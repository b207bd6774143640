//! Storage pool inspection and lifecycle.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::units;
use crate::xml_utils::{parse_xml_dom, XmlWriter};

/// Parsed view of a storage pool descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDescriptor {
    /// Pool name.
    pub name: String,
    /// Pool driver type (`dir`, `logical`, `netfs`, ...).
    pub kind: String,
    /// Target path (a directory, or the volume group device path).
    pub path: Utf8PathBuf,
    /// Total size in bytes.
    pub capacity: u64,
    /// Allocated bytes.
    pub allocation: u64,
    /// Free bytes.
    pub available: u64,
}

impl PoolDescriptor {
    /// Parse `virsh pool-dumpxml` output.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let dom = parse_xml_dom(xml)?;
        let name = dom
            .child("name")
            .map(|n| n.text_content().to_string())
            .ok_or_else(|| ProvisionError::Xml("pool descriptor has no name".into()))?;
        let path = dom
            .child("target")
            .and_then(|t| t.child("path"))
            .map(|p| Utf8PathBuf::from(p.text_content()))
            .ok_or_else(|| ProvisionError::Xml(format!("pool {name} has no target path")))?;
        let size = |elem: &str| -> u64 {
            dom.child(elem)
                .and_then(|n| units::to_bytes(n.text_content(), n.attr("unit").unwrap_or("bytes")))
                .unwrap_or(0)
        };
        Ok(Self {
            kind: dom.attr("type").unwrap_or("dir").to_string(),
            capacity: size("capacity"),
            allocation: size("allocation"),
            available: size("available"),
            name,
            path,
        })
    }

    /// Whether volumes in this pool are block devices.
    pub fn is_logical(&self) -> bool {
        self.kind == "logical"
    }
}

/// Build a directory pool descriptor.
pub fn dir_pool_xml(name: &str, path: &Utf8Path) -> Result<String> {
    let mut writer = XmlWriter::new();
    writer.start_element("pool", &[("type", "dir")])?;
    writer.write_text_element("name", name)?;
    writer.start_element("target", &[])?;
    writer.write_text_element("path", path.as_str())?;
    writer.end_element("target")?;
    writer.end_element("pool")?;
    writer.into_string()
}

/// Storage pool operations over a hypervisor connection.
#[derive(Debug, Clone, Copy)]
pub struct PoolManager<'a> {
    conn: &'a dyn Hypervisor,
}

impl<'a> PoolManager<'a> {
    /// Wrap a connection.
    pub fn new(conn: &'a dyn Hypervisor) -> Self {
        Self { conn }
    }

    /// Describe one pool.
    pub fn describe(&self, name: &str) -> Result<PoolDescriptor> {
        let xml = self.conn.pool_xml(name)?;
        PoolDescriptor::from_xml(&xml)
    }

    /// Describe every pool.
    pub fn list(&self) -> Result<Vec<PoolDescriptor>> {
        self.conn
            .list_pools()?
            .iter()
            .map(|p| self.describe(p))
            .collect()
    }

    /// Define, build, start and autostart a directory pool.
    pub fn create_dir_pool(&self, name: &str, path: &Utf8Path) -> Result<PoolDescriptor> {
        if self.conn.list_pools()?.iter().any(|p| p == name) {
            return Err(ProvisionError::InvalidParameter(format!(
                "storage pool {name} already exists"
            )));
        }
        if !path.is_absolute() {
            return Err(ProvisionError::InvalidParameter(format!(
                "pool path must be absolute: {path}"
            )));
        }
        info!("Creating storage pool {} at {}", name, path);
        let xml = dir_pool_xml(name, path)?;
        self.conn
            .define_pool(&xml)
            .map_err(|e| ProvisionError::Definition {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        self.conn.build_pool(name)?;
        self.conn.start_pool(name)?;
        self.conn.set_pool_autostart(name)?;
        self.describe(name)
    }

    /// Stop and remove a pool definition. Volumes on disk are left alone.
    pub fn delete_pool(&self, name: &str) -> Result<()> {
        if !self.conn.list_pools()?.iter().any(|p| p == name) {
            return Err(ProvisionError::InvalidParameter(format!(
                "storage pool {name} does not exist"
            )));
        }
        if self.conn.pool_is_active(name)? {
            debug!("Stopping pool {}", name);
            self.conn.destroy_pool(name)?;
        }
        self.conn.undefine_pool(name)?;
        info!("Removed storage pool {}", name);
        Ok(())
    }
}
