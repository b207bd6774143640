//! Template catalog, image cache and template materialization
//!
//! A template is a persistent domain whose first disk serves as the backing
//! image of every instance created from it. When a catalog entry exists but no
//! such domain is defined yet, the image is fetched once into a local cache,
//! uploaded into the default pool and wrapped in a minimal base domain.

use std::fs::{self, File};
use std::io::{self, BufReader};

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::libvirt::domain::DomainBuilder;
use crate::volume::{VolumeFormat, VolumeManager};

fn default_format() -> VolumeFormat {
    VolumeFormat::Qcow2
}

/// YAML allows `version: 7`; keep it as text.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other:?}"
        ))),
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template (and base domain) name.
    pub name: String,
    /// Operating system family.
    pub os: String,
    /// Operating system version.
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    /// Image URL (`http(s)://`, `file://`) or local path.
    #[serde(alias = "iso")]
    pub image: String,
    /// Expected SHA-256 of the image, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Image format.
    #[serde(default = "default_format")]
    pub format: VolumeFormat,
}

impl TemplateSpec {
    /// Name of the cached file and of the uploaded volume.
    pub fn image_file_name(&self) -> String {
        let base = self
            .image
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name);
        base.to_string()
    }

    fn local_path(&self) -> Option<Utf8PathBuf> {
        if let Some(p) = self.image.strip_prefix("file://") {
            return Some(p.into());
        }
        (!self.image.contains("://")).then(|| self.image.as_str().into())
    }

    fn materialization_error(&self, message: impl Into<String>) -> ProvisionError {
        ProvisionError::Materialization {
            template: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Lookup of known templates by name.
pub trait TemplateCatalog: Send + Sync + std::fmt::Debug {
    /// Entry for `name`, if any.
    fn get_by_name(&self, name: &str) -> Option<TemplateSpec>;

    /// All entries.
    fn list(&self) -> Vec<TemplateSpec>;

    /// Whether `name` is known.
    fn exists(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }
}

/// Catalog stored as a YAML list.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    path: Option<Utf8PathBuf>,
    templates: Vec<TemplateSpec>,
}

impl FileCatalog {
    /// Load `path`; a missing file is an empty catalog.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let templates = match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|e| {
                ProvisionError::InvalidParameter(format!("{path}: {e}"))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No template catalog at {}", path);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_owned()),
            templates,
        })
    }

    /// In-memory catalog.
    pub fn from_templates(templates: Vec<TemplateSpec>) -> Self {
        Self {
            path: None,
            templates,
        }
    }

    fn parse(text: &str) -> std::result::Result<Vec<TemplateSpec>, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str::<Option<Vec<TemplateSpec>>>(text)?.unwrap_or_default())
    }

    /// Add or replace an entry and persist.
    pub fn add(&mut self, spec: TemplateSpec) -> Result<()> {
        self.templates.retain(|t| t.name != spec.name);
        self.templates.push(spec);
        self.save()
    }

    /// Remove an entry and persist; returns whether it existed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let before = self.templates.len();
        self.templates.retain(|t| t.name != name);
        let removed = self.templates.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_yaml::to_string(&self.templates)
            .map_err(|e| ProvisionError::InvalidParameter(format!("{path}: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }
}

impl TemplateCatalog for FileCatalog {
    fn get_by_name(&self, name: &str) -> Option<TemplateSpec> {
        self.templates.iter().find(|t| t.name == name).cloned()
    }

    fn list(&self) -> Vec<TemplateSpec> {
        self.templates.clone()
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Utf8Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Download-once image cache keyed by file name.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: Utf8PathBuf,
}

impl ImageCache {
    /// Cache rooted at `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn verify(&self, spec: &TemplateSpec, path: &Utf8Path) -> Result<()> {
        let Some(expected) = &spec.sha256 else {
            return Ok(());
        };
        let actual = sha256_file(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(spec.materialization_error(format!(
                "checksum mismatch for {path}: expected {expected}, got {actual}"
            )));
        }
        Ok(())
    }

    /// Local path of the template image, downloading it on first use.
    pub fn fetch(&self, spec: &TemplateSpec) -> Result<Utf8PathBuf> {
        if let Some(local) = spec.local_path() {
            if !local.exists() {
                return Err(spec.materialization_error(format!("image {local} does not exist")));
            }
            self.verify(spec, &local)?;
            return Ok(local);
        }

        let target = self.dir.join(spec.image_file_name());
        if target.exists() {
            debug!("Using cached image {}", target);
            self.verify(spec, &target)?;
            return Ok(target);
        }

        fs::create_dir_all(&self.dir)?;
        let mut partial = tempfile::NamedTempFile::new_in(&self.dir)?;
        self.download(spec, partial.as_file_mut())?;
        self.verify(spec, Utf8Path::from_path(partial.path()).ok_or_else(|| {
            spec.materialization_error("temporary download path is not UTF-8")
        })?)?;
        partial
            .persist(&target)
            .map_err(|e| spec.materialization_error(e.to_string()))?;
        info!("Cached {} at {}", spec.image, target);
        Ok(target)
    }

    fn download(&self, spec: &TemplateSpec, out: &mut File) -> Result<()> {
        info!("Downloading {}", spec.image);
        let response = reqwest::blocking::get(&spec.image)
            .and_then(|r| r.error_for_status())
            .map_err(|e| spec.materialization_error(e.to_string()))?;

        let progress = match response.content_length() {
            Some(len) => ProgressBar::new(len).with_style(
                ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            ),
            None => ProgressBar::new_spinner(),
        };
        progress.set_message(spec.image_file_name());
        let mut reader = progress.wrap_read(response);
        let copied = io::copy(&mut reader, out);
        progress.finish_and_clear();
        copied.map_err(|e| spec.materialization_error(format!("download failed: {e}")))?;
        Ok(())
    }
}

/// Turns a catalog entry into a defined template domain.
#[derive(Debug)]
pub struct TemplateMaterializer<'a> {
    conn: &'a dyn Hypervisor,
    cache: &'a ImageCache,
    pool: &'a str,
}

impl<'a> TemplateMaterializer<'a> {
    /// Upload images into `pool`.
    pub fn new(conn: &'a dyn Hypervisor, cache: &'a ImageCache, pool: &'a str) -> Self {
        Self { conn, cache, pool }
    }

    /// Fetch, upload and define `spec` as a base domain.
    pub fn materialize(&self, spec: &TemplateSpec) -> Result<()> {
        if self.conn.domain_exists(&spec.name)? {
            debug!("Template {} is already defined", spec.name);
            return Ok(());
        }
        let image = self.cache.fetch(spec)?;
        let volumes = VolumeManager::new(self.conn);
        let volume_name = spec.image_file_name();

        let (volume, uploaded) = match volumes.list_volumes()?.remove(&volume_name) {
            Some(existing) if existing.pool == self.pool => {
                debug!("Reusing volume {}", existing.path);
                (existing.path, false)
            }
            _ => {
                let vol =
                    volumes.upload_image(self.pool, &image, &volume_name, spec.format.clone())?;
                (vol.path, true)
            }
        };

        let xml = DomainBuilder::new()
            .with_name(&spec.name)
            .with_memory(1024)
            .with_vcpus(1)
            .with_disk(volume.as_str(), spec.format.clone())
            .with_network("default")
            .with_vnc()
            .with_description(&format!("{} {}", spec.os, spec.version))
            .build_xml()?;
        if let Err(e) = self.conn.define_domain(&xml) {
            if uploaded {
                if let Err(cleanup) = volumes.delete_volume(&volume) {
                    warn!("Failed to remove {} after define error: {}", volume, cleanup);
                }
            }
            return Err(spec.materialization_error(e.to_string()));
        }
        info!("Defined template {} from {}", spec.name, image);
        Ok(())
    }
}
