//! Configuration file parsing for `virtforge/config.toml`

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::capacity::DEFAULT_THRESHOLD;

/// Directory name under the XDG config and cache directories
pub const APP_DIR: &str = "virtforge";
/// Configuration file name
pub const CONFIG_FILE: &str = "config.toml";
/// Template catalog file name
pub const TEMPLATES_FILE: &str = "templates.yml";

/// Resource defaults for new instances
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstanceDefaults {
    /// Memory in GB
    pub ram: f64,
    /// vCPU count
    pub vcpu: u32,
    /// Primary disk size in GB
    pub disk_size: u64,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            ram: 1.0,
            vcpu: 1,
            disk_size: 10,
        }
    }
}

/// Tool configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Hypervisor connection URI
    pub connect: String,

    /// Pool receiving templates, seeds and new data disks
    pub default_pool: String,

    /// Resource defaults
    pub defaults: InstanceDefaults,

    /// Memory utilization threshold in percent for the admission check
    pub memory_threshold: u8,

    /// Seconds to wait for a booted instance to obtain an address
    pub boot_timeout: u64,

    /// Milliseconds between address polls
    pub boot_poll_interval: u64,

    /// Where downloaded template images are kept
    pub image_cache_dir: Option<Utf8PathBuf>,

    /// YAML template catalog
    pub templates_file: Option<Utf8PathBuf>,

    /// Public keys injected into cloud-init seeds
    pub ssh_authorized_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect: "qemu:///system".to_string(),
            default_pool: "default".to_string(),
            defaults: InstanceDefaults::default(),
            memory_threshold: DEFAULT_THRESHOLD,
            boot_timeout: 300,
            boot_poll_interval: 1000,
            image_cache_dir: None,
            templates_file: None,
            ssh_authorized_keys: Vec::new(),
        }
    }
}

fn xdg_dir(base: Option<std::path::PathBuf>) -> Option<Utf8PathBuf> {
    base.and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .map(|p| p.join(APP_DIR))
}

impl Config {
    /// `$XDG_CONFIG_HOME/virtforge/config.toml`
    pub fn default_path() -> Option<Utf8PathBuf> {
        xdg_dir(dirs::config_dir()).map(|d| d.join(CONFIG_FILE))
    }

    /// Load configuration
    ///
    /// An explicitly given path must exist. Without one the default location
    /// is used if present, otherwise built-in defaults apply.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_owned(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    tracing::debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.memory_threshold) {
            color_eyre::eyre::bail!(
                "memory-threshold must be between 1 and 100, got {}",
                self.memory_threshold
            );
        }
        if self.boot_poll_interval == 0 {
            color_eyre::eyre::bail!("boot-poll-interval must be positive");
        }
        if !(self.defaults.ram.is_finite() && self.defaults.ram > 0.0) {
            color_eyre::eyre::bail!("defaults.ram must be positive");
        }
        if self.defaults.vcpu == 0 || self.defaults.disk_size == 0 {
            color_eyre::eyre::bail!("defaults.vcpu and defaults.disk-size must be positive");
        }
        Ok(())
    }

    /// Readiness wait bound
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout)
    }

    /// Readiness poll cadence
    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval)
    }

    /// Image cache directory, defaulting to `$XDG_CACHE_HOME/virtforge/images`
    pub fn image_cache_dir(&self) -> Utf8PathBuf {
        self.image_cache_dir.clone().unwrap_or_else(|| {
            xdg_dir(dirs::cache_dir())
                .unwrap_or_else(|| Utf8PathBuf::from("/var/tmp").join(APP_DIR))
                .join("images")
        })
    }

    /// Template catalog path, defaulting to `$XDG_CONFIG_HOME/virtforge/templates.yml`
    pub fn templates_file(&self) -> Utf8PathBuf {
        self.templates_file.clone().unwrap_or_else(|| {
            xdg_dir(dirs::config_dir())
                .unwrap_or_else(|| Utf8PathBuf::from("/etc").join(APP_DIR))
                .join(TEMPLATES_FILE)
        })
    }
}
