//! Domain lifecycle workflows
//!
//! [`Provisioner`] ties the managers together into the three multi-step
//! workflows: create from a template, clone and delete. Create and clone track
//! every volume they make in a [`VolumeRollback`]; if definition fails, the
//! guard removes them again on drop. Delete runs its steps in order and stops
//! at the first failure, reporting which steps had completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capacity::CapacityAdvisor;
use crate::cloud_init::{NoCloudSeed, SeedBuilder, SeedConfig};
use crate::config::Config;
use crate::descriptor::{
    instantiate, DiskInfo, DomainDescriptor, InstanceParams, InterfaceInfo, MemorySize,
};
use crate::devices::{delete_if_managed, DeviceManager};
use crate::error::{ProvisionError, Result, TeardownStep};
use crate::hypervisor::{DomainState, Hypervisor};
use crate::libvirt::VirshConnection;
use crate::locks::NameLocks;
use crate::network::NetworkManager;
use crate::pool::PoolManager;
use crate::template::{FileCatalog, ImageCache, TemplateCatalog, TemplateMaterializer};
use crate::units;
use crate::volume::{VolumeFormat, VolumeManager};

/// Deletes tracked volumes on drop unless committed.
#[derive(Debug)]
pub struct VolumeRollback<'a> {
    volumes: VolumeManager<'a>,
    created: Vec<Utf8PathBuf>,
    committed: bool,
}

impl<'a> VolumeRollback<'a> {
    /// Empty guard.
    pub fn new(volumes: VolumeManager<'a>) -> Self {
        Self {
            volumes,
            created: Vec::new(),
            committed: false,
        }
    }

    /// Remember a volume created by the current workflow.
    pub fn track(&mut self, path: Utf8PathBuf) {
        self.created.push(path);
    }

    /// Keep everything; returns the tracked paths.
    pub fn commit(mut self) -> Vec<Utf8PathBuf> {
        self.committed = true;
        std::mem::take(&mut self.created)
    }
}

impl Drop for VolumeRollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Clones before the volumes they may be backed by.
        for path in self.created.iter().rev() {
            match self.volumes.delete_volume(path) {
                Ok(()) => info!("Rolled back volume {}", path),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to roll back volume {}: {}", path, e),
            }
        }
    }
}

/// Options for [`Provisioner::create`] and [`Provisioner::clone_domain`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Enable autostart, boot, and wait for an address.
    pub start: bool,
    /// Materialize a catalog template that is not defined yet.
    pub materialize_template: bool,
    /// Run the memory admission check first (create only).
    pub check_capacity: bool,
    /// Custom cloud-config merged into the seed (create only).
    pub user_data: Option<String>,
    /// Set to abandon the address wait.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            start: false,
            materialize_template: true,
            check_capacity: true,
            user_data: None,
            cancel: None,
        }
    }
}

/// Outcome of a successful create or clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedDomain {
    /// Instance name.
    pub name: String,
    /// UUID assigned by the hypervisor.
    pub uuid: Option<String>,
    /// Volumes created for the instance.
    pub volumes: Vec<Utf8PathBuf>,
    /// Leased address, when the instance was started.
    pub ip: Option<String>,
}

/// Detailed view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainInfo {
    /// Instance name.
    pub name: String,
    /// UUID.
    pub uuid: Option<String>,
    /// Runtime state.
    pub state: DomainState,
    /// Maximum memory in bytes.
    pub max_memory: Option<u64>,
    /// vCPU count.
    pub vcpus: Option<u32>,
    /// Leased address, when active.
    pub ip: Option<String>,
    /// Disk devices.
    pub disks: Vec<DiskInfo>,
    /// Network interfaces.
    pub interfaces: Vec<InterfaceInfo>,
}

/// One row of [`Provisioner::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSummary {
    /// Instance name.
    pub name: String,
    /// Runtime state.
    pub state: DomainState,
}

/// Provisioning engine bound to one hypervisor connection.
#[derive(Debug)]
pub struct Provisioner {
    conn: Box<dyn Hypervisor>,
    config: Config,
    catalog: Box<dyn TemplateCatalog>,
    seeds: Box<dyn SeedBuilder>,
    locks: NameLocks,
}

impl Provisioner {
    /// Engine over explicit collaborators.
    pub fn new(
        conn: Box<dyn Hypervisor>,
        config: Config,
        catalog: Box<dyn TemplateCatalog>,
        seeds: Box<dyn SeedBuilder>,
    ) -> Self {
        Self {
            conn,
            config,
            catalog,
            seeds,
            locks: NameLocks::new(),
        }
    }

    /// Connect with `virsh`, the YAML catalog and the NoCloud seed builder.
    pub fn open(config: Config) -> Result<Self> {
        let conn = VirshConnection::open(&config.connect)?;
        let catalog = FileCatalog::load(&config.templates_file())?;
        Ok(Self::new(
            Box::new(conn),
            config,
            Box::new(catalog),
            Box::new(NoCloudSeed),
        ))
    }

    /// Underlying connection.
    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.conn.as_ref()
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Template catalog.
    pub fn catalog(&self) -> &dyn TemplateCatalog {
        self.catalog.as_ref()
    }

    /// Volume operations.
    pub fn volumes(&self) -> VolumeManager<'_> {
        VolumeManager::new(self.hypervisor())
    }

    /// Device hotplug.
    pub fn devices(&self) -> DeviceManager<'_> {
        DeviceManager::new(self.hypervisor())
    }

    /// Network operations.
    pub fn networks(&self) -> NetworkManager<'_> {
        NetworkManager::new(self.hypervisor())
    }

    /// Pool operations.
    pub fn pools(&self) -> PoolManager<'_> {
        PoolManager::new(self.hypervisor())
    }

    /// Admission checks with the configured threshold.
    pub fn capacity(&self) -> CapacityAdvisor<'_> {
        CapacityAdvisor::new(self.hypervisor(), self.config.memory_threshold)
    }

    fn definition(&self, name: &str) -> Result<DomainDescriptor> {
        if !self.conn.domain_exists(name)? {
            return Err(ProvisionError::DomainNotFound(name.to_string()));
        }
        DomainDescriptor::parse(&self.conn.domain_xml(name)?)
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if self.conn.domain_exists(name)? {
            return Err(ProvisionError::InvalidParameter(format!(
                "domain {name} already exists"
            )));
        }
        Ok(())
    }

    /// Definition of template `name`, materializing it from the catalog if needed.
    pub fn ensure_template(&self, name: &str) -> Result<DomainDescriptor> {
        if self.conn.domain_exists(name)? {
            return self.definition(name);
        }
        let spec = self
            .catalog
            .get_by_name(name)
            .ok_or_else(|| ProvisionError::TemplateNotFound(name.to_string()))?;
        info!("Template {} is not defined; materializing it", name);
        let cache = ImageCache::new(self.config.image_cache_dir());
        TemplateMaterializer::new(self.hypervisor(), &cache, &self.config.default_pool)
            .materialize(&spec)?;
        self.definition(name)
    }

    fn resolve_template(&self, name: &str, materialize: bool) -> Result<DomainDescriptor> {
        if materialize {
            return self.ensure_template(name);
        }
        if !self.conn.domain_exists(name)? {
            return Err(ProvisionError::TemplateNotFound(name.to_string()));
        }
        self.definition(name)
    }

    fn with_defaults(&self, params: &InstanceParams) -> InstanceParams {
        let d = &self.config.defaults;
        InstanceParams {
            name: params.name.clone(),
            ram: params.ram.or(Some(d.ram)),
            vcpus: params.vcpus.or(Some(d.vcpu)),
            disk_size: params.disk_size.or(Some(d.disk_size)),
        }
    }

    fn define(&self, name: &str, descriptor: &DomainDescriptor) -> Result<()> {
        let xml = descriptor.to_xml()?;
        debug!("Defining {}: {}", name, xml);
        self.conn
            .define_domain(&xml)
            .map_err(|e| ProvisionError::Definition {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Build the seed locally and upload it as a raw volume in `pool`.
    fn upload_seed(&self, name: &str, pool: &str, user_data: Option<&str>) -> Result<Utf8PathBuf> {
        let mut config = SeedConfig::new(name)
            .with_ssh_keys(self.config.ssh_authorized_keys.clone());
        if let Some(user_data) = user_data {
            config = config.with_user_data(user_data.to_string());
        }
        let staging = tempfile::Builder::new()
            .prefix("virtforge-seed-")
            .suffix(".img")
            .tempfile()?;
        let staging_path = Utf8Path::from_path(staging.path())
            .ok_or_else(|| ProvisionError::Seed("temporary seed path is not UTF-8".into()))?;
        self.seeds.build(&config, staging_path)?;
        let volume = self.volumes().upload_image(
            pool,
            staging_path,
            &seed_volume_name(name),
            VolumeFormat::Raw,
        )?;
        Ok(volume.path)
    }

    /// Create `params.name` from `template`.
    ///
    /// Missing resource parameters take the configured defaults. On a
    /// definition failure every volume created here is removed again.
    pub fn create(
        &self,
        template: &str,
        params: &InstanceParams,
        opts: &CreateOptions,
    ) -> Result<ProvisionedDomain> {
        params.validate()?;
        let _lock = self.locks.acquire(&params.name)?;
        self.ensure_name_free(&params.name)?;
        let params = self.with_defaults(params);

        if opts.check_capacity {
            if let Some(ram) = params.ram {
                self.capacity()
                    .ensure_can_allocate(MemorySize::from_gb(ram)?.bytes())?;
            }
        }

        let template_def = self.resolve_template(template, opts.materialize_template)?;
        let pool = self.pools().describe(&self.config.default_pool)?;
        let seed_path = pool.path.join(seed_volume_name(&params.name));
        let instance = instantiate(&template_def, &params, Some(&seed_path))?;

        let mut rollback = VolumeRollback::new(self.volumes());
        let seed = self.upload_seed(&params.name, &pool.name, opts.user_data.as_deref())?;
        rollback.track(seed);

        if let Some(disk) = &instance.disk {
            let size = params.disk_size.map(units::gib);
            let volume = self.volumes().clone_disk(&disk.source, disk.target_name(), size)?;
            rollback.track(volume.path);
        } else {
            warn!("Template {} has no disk; {} will have none", template, params.name);
        }

        self.define(&params.name, &instance.descriptor)?;
        let volumes = rollback.commit();
        info!("Created {} from template {}", params.name, template);
        self.finish(&params.name, volumes, opts)
    }

    /// Clone `source` (a template or stopped instance) as `name`.
    ///
    /// Resources are copied from the source; the disk overlay keeps the
    /// source disk's capacity and no seed is attached.
    pub fn clone_domain(
        &self,
        source: &str,
        name: &str,
        opts: &CreateOptions,
    ) -> Result<ProvisionedDomain> {
        let params = InstanceParams::named(name);
        params.validate()?;
        let _lock = self.locks.acquire(name)?;
        self.ensure_name_free(name)?;

        let source_def = self.resolve_template(source, opts.materialize_template)?;
        if self.conn.domain_state(source)?.is_active() {
            warn!("Cloning {} while it is running; its disk may be inconsistent", source);
        }
        let instance = instantiate(&source_def, &params, None)?;

        let mut rollback = VolumeRollback::new(self.volumes());
        if let Some(disk) = &instance.disk {
            let volume = self.volumes().clone_disk(&disk.source, disk.target_name(), None)?;
            rollback.track(volume.path);
        }

        self.define(name, &instance.descriptor)?;
        let volumes = rollback.commit();
        info!("Cloned {} from {}", name, source);
        self.finish(name, volumes, opts)
    }

    fn finish(
        &self,
        name: &str,
        volumes: Vec<Utf8PathBuf>,
        opts: &CreateOptions,
    ) -> Result<ProvisionedDomain> {
        let uuid = self.definition(name)?.uuid().map(str::to_string);
        let mut out = ProvisionedDomain {
            name: name.to_string(),
            uuid,
            volumes,
            ip: None,
        };
        if opts.start {
            self.conn.set_autostart(name, true)?;
            self.conn.start_domain(name)?;
            out.ip = Some(self.wait_for_ip(name, opts.cancel.as_deref())?);
        }
        Ok(out)
    }

    /// Stop, strip and undefine `name`.
    ///
    /// Steps: force stop (only if active), delete snapshots, delete the
    /// volumes behind non-CD-ROM disks, undefine. A failing step ends the
    /// workflow with [`ProvisionError::PartialTeardown`].
    pub fn delete(&self, name: &str) -> Result<Vec<TeardownStep>> {
        let _lock = self.locks.acquire(name)?;
        let definition = self.definition(name)?;
        let mut completed = Vec::new();
        let fail = |completed: &Vec<TeardownStep>, failed: TeardownStep, e: ProvisionError| {
            ProvisionError::PartialTeardown {
                domain: name.to_string(),
                completed: completed.clone(),
                failed,
                message: e.to_string(),
            }
        };

        let active = self
            .conn
            .domain_state(name)
            .map_err(|e| fail(&completed, TeardownStep::ForceStop, e))?
            .is_active();
        if active {
            self.conn
                .destroy_domain(name)
                .map_err(|e| fail(&completed, TeardownStep::ForceStop, e))?;
            completed.push(TeardownStep::ForceStop);
        }

        let snapshots = self
            .conn
            .list_snapshots(name)
            .map_err(|e| fail(&completed, TeardownStep::DeleteSnapshots, e))?;
        for snapshot in snapshots {
            self.conn
                .delete_snapshot(name, &snapshot)
                .map_err(|e| fail(&completed, TeardownStep::DeleteSnapshots, e))?;
        }
        completed.push(TeardownStep::DeleteSnapshots);

        let volumes = self.volumes();
        for disk in definition.disks().into_iter().filter(|d| !d.is_cdrom()) {
            let Some(path) = disk.source else { continue };
            delete_if_managed(&volumes, &path)
                .map_err(|e| fail(&completed, TeardownStep::DeleteDisks, e))?;
        }
        completed.push(TeardownStep::DeleteDisks);

        self.conn
            .undefine_domain(name)
            .map_err(|e| fail(&completed, TeardownStep::Undefine, e))?;
        completed.push(TeardownStep::Undefine);
        info!("Deleted {}", name);
        Ok(completed)
    }

    /// Start `name`; with `wait`, block until it has an address.
    pub fn start(
        &self,
        name: &str,
        wait: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<String>> {
        self.definition(name)?;
        if self.conn.domain_state(name)?.is_active() {
            info!("{} is already running", name);
        } else {
            self.conn.start_domain(name)?;
            info!("Started {}", name);
        }
        if wait {
            return self.wait_for_ip(name, cancel).map(Some);
        }
        Ok(None)
    }

    /// Shut `name` down; `force` pulls the plug.
    pub fn stop(&self, name: &str, force: bool) -> Result<()> {
        self.definition(name)?;
        if !self.conn.domain_state(name)?.is_active() {
            info!("{} is not running", name);
            return Ok(());
        }
        if force {
            self.conn.destroy_domain(name)
        } else {
            self.conn.shutdown_domain(name)
        }
    }

    /// Reset a running instance.
    pub fn reboot(&self, name: &str) -> Result<()> {
        self.definition(name)?;
        self.conn.reboot_domain(name)
    }

    /// Pause a running instance.
    pub fn suspend(&self, name: &str) -> Result<()> {
        self.definition(name)?;
        self.conn.suspend_domain(name)
    }

    /// Resume a paused instance.
    pub fn resume(&self, name: &str) -> Result<()> {
        self.definition(name)?;
        self.conn.resume_domain(name)
    }

    /// Toggle autostart.
    pub fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.definition(name)?;
        self.conn.set_autostart(name, enabled)
    }

    /// Leased address of the first interface, only while the instance is active.
    pub fn domain_ip(&self, name: &str) -> Result<Option<String>> {
        let definition = self.definition(name)?;
        if !self.conn.domain_state(name)?.is_active() {
            return Ok(None);
        }
        let Some(mac) = definition.interfaces().into_iter().find_map(|i| i.mac) else {
            return Ok(None);
        };
        self.networks().lease_for(&mac)
    }

    /// Poll [`Provisioner::domain_ip`] until it reports an address.
    pub fn wait_for_ip(&self, name: &str, cancel: Option<&AtomicBool>) -> Result<String> {
        let timeout = self.config.boot_timeout();
        let interval = self.config.boot_poll_interval();
        let started = Instant::now();
        let progress = ProgressBar::new_spinner();
        progress.set_message(format!("Waiting for {} to obtain an address", name));
        progress.enable_steady_tick(Duration::from_millis(150));

        let result = loop {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                break Err(ProvisionError::Cancelled(name.to_string()));
            }
            match self.domain_ip(name) {
                Ok(Some(ip)) => break Ok(ip),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            let waited = started.elapsed();
            if waited >= timeout {
                break Err(ProvisionError::BootTimeout {
                    domain: name.to_string(),
                    waited,
                });
            }
            std::thread::sleep(interval.min(timeout - waited));
        };
        progress.finish_and_clear();
        if let Ok(ip) = &result {
            info!("{} is up at {} after {:?}", name, ip, started.elapsed());
        }
        result
    }

    /// Details of `name`.
    pub fn info(&self, name: &str) -> Result<DomainInfo> {
        let definition = self.definition(name)?;
        Ok(DomainInfo {
            name: name.to_string(),
            uuid: definition.uuid().map(str::to_string),
            state: self.conn.domain_state(name)?,
            max_memory: definition.memory_bytes(),
            vcpus: definition.vcpus(),
            ip: self.domain_ip(name)?,
            disks: definition.disks(),
            interfaces: definition.interfaces(),
        })
    }

    /// Every defined instance with its state.
    pub fn list(&self) -> Result<Vec<DomainSummary>> {
        self.conn
            .list_domains()?
            .into_iter()
            .map(|name| -> Result<DomainSummary> {
                let state = self.conn.domain_state(&name)?;
                Ok(DomainSummary { name, state })
            })
            .collect()
    }
}

/// Name of an instance's cloud-init seed volume.
pub fn seed_volume_name(instance: &str) -> String {
    format!("{instance}-seed.img")
}
