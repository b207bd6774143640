//! Cloud-init NoCloud seed generation.
//!
//! The seed is a small VFAT filesystem labelled `cidata` holding `meta-data`
//! and `user-data` at its root. It is populated without mounting, the same way
//! systemd-repart does it:
//! - `mkfs.vfat` to create the VFAT filesystem
//! - `mcopy` (from mtools) to copy files into the image

use std::fs::{self, File};
use std::io::{self, Write};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Volume label cloud-init looks for with the NoCloud datasource.
const SEED_LABEL: &str = "cidata";

/// Size of the seed image.
const SEED_IMAGE_MB: u32 = 2;

/// Contents of a seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedConfig {
    /// Stable instance identifier.
    pub instance_id: String,
    /// Hostname set in the guest.
    pub hostname: String,
    /// Public keys for the default user.
    pub ssh_authorized_keys: Vec<String>,
    /// Custom `#cloud-config` YAML merged into the generated user-data.
    pub user_data: Option<String>,
}

impl SeedConfig {
    /// Seed for `hostname`, also used as instance id.
    pub fn new(hostname: &str) -> Self {
        Self {
            instance_id: format!("iid-{hostname}"),
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    /// Add authorized keys.
    pub fn with_ssh_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.ssh_authorized_keys.extend(keys);
        self
    }

    /// Merge custom user-data.
    pub fn with_user_data(mut self, user_data: String) -> Self {
        self.user_data = Some(user_data);
        self
    }

    /// `meta-data` document.
    pub fn meta_data(&self) -> Result<String> {
        let mut map = serde_yaml::Mapping::new();
        map.insert("instance-id".into(), self.instance_id.clone().into());
        map.insert("local-hostname".into(), self.hostname.clone().into());
        serde_yaml::to_string(&map).map_err(|e| ProvisionError::Seed(format!("meta-data: {e}")))
    }

    /// `user-data` document, starting with the `#cloud-config` marker.
    ///
    /// Keys given in custom user-data win over generated ones, except that
    /// authorized keys are appended to any the custom data already lists.
    pub fn user_data(&self) -> Result<String> {
        let mut doc = match &self.user_data {
            Some(custom) => serde_yaml::from_str::<serde_yaml::Value>(custom)
                .map_err(|e| ProvisionError::Seed(format!("invalid custom user-data: {e}")))?,
            None => serde_yaml::Value::Mapping(Default::default()),
        };
        if doc.is_null() {
            doc = serde_yaml::Value::Mapping(Default::default());
        }
        let map = doc
            .as_mapping_mut()
            .ok_or_else(|| ProvisionError::Seed("user-data must be a YAML mapping".into()))?;

        if !map.contains_key("hostname") {
            map.insert("hostname".into(), self.hostname.clone().into());
        }
        if !self.ssh_authorized_keys.is_empty() {
            let entry = map
                .entry("ssh_authorized_keys".into())
                .or_insert_with(|| serde_yaml::Value::Sequence(Vec::new()));
            let keys = entry.as_sequence_mut().ok_or_else(|| {
                ProvisionError::Seed("ssh_authorized_keys must be a list".into())
            })?;
            for key in &self.ssh_authorized_keys {
                let key = serde_yaml::Value::from(key.clone());
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        let body = serde_yaml::to_string(&doc)
            .map_err(|e| ProvisionError::Seed(format!("user-data: {e}")))?;
        Ok(format!("#cloud-config\n{body}"))
    }

    /// Write `meta-data` and `user-data` into `dir`.
    pub fn write_files(&self, dir: &Utf8Path) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
        let meta = dir.join("meta-data");
        fs::write(&meta, self.meta_data()?)?;
        let user = dir.join("user-data");
        let mut f = File::create(&user)?;
        f.write_all(self.user_data()?.as_bytes())?;
        debug!("Wrote seed files in {}", dir);
        Ok((meta, user))
    }
}

/// Produces seed images.
pub trait SeedBuilder: Send + Sync + std::fmt::Debug {
    /// Build a seed image for `config` at `output`.
    fn build(&self, config: &SeedConfig, output: &Utf8Path) -> Result<()>;
}

/// VFAT NoCloud seed built with dosfstools and mtools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCloudSeed;

fn run_tool(cmd: &mut Command, tool: &str, package: &str) -> Result<()> {
    let output = cmd.output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ProvisionError::Seed(format!(
                "{tool} not found. Please install the {package} package"
            ))
        } else {
            ProvisionError::Seed(format!("failed to execute {tool}: {e}"))
        }
    })?;
    if !output.status.success() {
        return Err(ProvisionError::Seed(format!(
            "{tool} failed (exit code: {}): {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl SeedBuilder for NoCloudSeed {
    fn build(&self, config: &SeedConfig, output: &Utf8Path) -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let temp_path = Utf8Path::from_path(temp_dir.path())
            .ok_or_else(|| ProvisionError::Seed("temporary directory path is not UTF-8".into()))?;
        let (meta, user) = config.write_files(temp_path)?;

        let image = File::create(output)?;
        image.set_len(u64::from(SEED_IMAGE_MB) * 1024 * 1024)?;
        drop(image);

        run_tool(
            Command::new("mkfs.vfat").args(["-n", SEED_LABEL, output.as_str()]),
            "mkfs.vfat",
            "dosfstools",
        )?;
        run_tool(
            Command::new("mcopy").args(["-i", output.as_str(), meta.as_str(), user.as_str(), "::"]),
            "mcopy",
            "mtools",
        )?;
        debug!("Created NoCloud seed at {}", output);
        Ok(())
    }
}
