//! Hypervisor capability consumed by the provisioning engine.
//!
//! Everything the engine needs from libvirt goes through [`Hypervisor`]. The
//! production implementation shells out to `virsh` (see
//! [`crate::libvirt::VirshConnection`]); unit tests use an in-memory fake.

use camino::Utf8Path;
use serde::Serialize;

use crate::error::Result;
use crate::volume::VolumeDescriptor;

/// Runtime state of a domain as reported by `virsh domstate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    /// Executing guest code.
    Running,
    /// Idle, waiting on a resource.
    Blocked,
    /// Suspended by the management layer.
    Paused,
    /// Shutdown in progress.
    ShuttingDown,
    /// Not running.
    ShutOff,
    /// Guest crashed.
    Crashed,
    /// Suspended by guest power management.
    PmSuspended,
    /// Anything else virsh reports.
    Other(String),
}

impl DomainState {
    /// Parse the text printed by `virsh domstate`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::PmSuspended,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the domain has a live process (libvirt's notion of "active").
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Blocked | Self::Paused | Self::ShuttingDown | Self::PmSuspended
        )
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "in shutdown",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
            Self::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Where an attach/detach takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceScope {
    /// The running instance only.
    Live,
    /// The persistent definition only.
    Config,
}

/// Host memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Total physical memory.
    pub total: u64,
    /// Currently free memory.
    pub free: u64,
}

/// Static host facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    /// Hypervisor host name.
    pub hostname: String,
    /// Logical CPU count.
    pub cpus: u32,
    /// CPU model string.
    pub cpu_model: String,
    /// Physical memory in bytes.
    pub memory: u64,
}

/// A DHCP lease handed out by a managed network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpLease {
    /// Client MAC address (lowercase).
    pub mac: String,
    /// Leased IPv4 address without prefix.
    pub ip: String,
    /// Client host name, when reported.
    pub hostname: Option<String>,
}

/// A storage volume together with the pool that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    /// Owning pool name.
    pub pool: String,
    /// Parsed volume definition.
    pub volume: VolumeDescriptor,
}

/// Capability set the engine requires from a hypervisor connection.
///
/// Calls are synchronous. Implementations must be usable from several threads.
pub trait Hypervisor: Send + Sync + std::fmt::Debug {
    /// Connection URI.
    fn uri(&self) -> &str;

    /// Names of all defined domains, active or not.
    fn list_domains(&self) -> Result<Vec<String>>;
    /// Live descriptor of a domain.
    fn domain_xml(&self, name: &str) -> Result<String>;
    /// Current runtime state.
    fn domain_state(&self, name: &str) -> Result<DomainState>;
    /// Define (or redefine) a persistent domain.
    fn define_domain(&self, xml: &str) -> Result<()>;
    /// Remove a persistent definition.
    fn undefine_domain(&self, name: &str) -> Result<()>;
    /// Boot a defined domain.
    fn start_domain(&self, name: &str) -> Result<()>;
    /// Ask the guest to shut down.
    fn shutdown_domain(&self, name: &str) -> Result<()>;
    /// Hard stop.
    fn destroy_domain(&self, name: &str) -> Result<()>;
    /// Reset a running domain.
    fn reboot_domain(&self, name: &str) -> Result<()>;
    /// Pause a running domain.
    fn suspend_domain(&self, name: &str) -> Result<()>;
    /// Resume a paused domain.
    fn resume_domain(&self, name: &str) -> Result<()>;
    /// Toggle autostart at host boot.
    fn set_autostart(&self, name: &str, enabled: bool) -> Result<()>;
    /// Attach a device described by `xml`.
    fn attach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()>;
    /// Detach a device described by `xml`.
    fn detach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()>;
    /// Snapshot names of a domain.
    fn list_snapshots(&self, domain: &str) -> Result<Vec<String>>;
    /// Delete one snapshot.
    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;

    /// Names of all storage pools.
    fn list_pools(&self) -> Result<Vec<String>>;
    /// Descriptor of a storage pool.
    fn pool_xml(&self, pool: &str) -> Result<String>;
    /// Whether a pool is started.
    fn pool_is_active(&self, pool: &str) -> Result<bool>;
    /// Define a persistent pool.
    fn define_pool(&self, xml: &str) -> Result<()>;
    /// Create the pool's backing storage (e.g. the target directory).
    fn build_pool(&self, pool: &str) -> Result<()>;
    /// Start a pool.
    fn start_pool(&self, pool: &str) -> Result<()>;
    /// Mark a pool to start at host boot.
    fn set_pool_autostart(&self, pool: &str) -> Result<()>;
    /// Stop a pool.
    fn destroy_pool(&self, pool: &str) -> Result<()>;
    /// Remove a pool definition.
    fn undefine_pool(&self, pool: &str) -> Result<()>;

    /// Create a volume in `pool` from its descriptor.
    fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;
    /// Look a volume up by path; `None` when no pool owns it.
    fn lookup_volume(&self, path: &str) -> Result<Option<VolumeRecord>>;
    /// Paths of every volume in a pool.
    fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;
    /// Delete a volume by path.
    fn delete_volume(&self, path: &str) -> Result<()>;
    /// Stream a local file into an existing volume.
    fn upload_volume(&self, path: &str, source: &Utf8Path) -> Result<()>;

    /// Names of all virtual networks.
    fn list_networks(&self) -> Result<Vec<String>>;
    /// Descriptor of a virtual network.
    fn network_xml(&self, name: &str) -> Result<String>;
    /// Whether a network is started.
    fn network_is_active(&self, name: &str) -> Result<bool>;
    /// Define a persistent network.
    fn define_network(&self, xml: &str) -> Result<()>;
    /// Start a network.
    fn start_network(&self, name: &str) -> Result<()>;
    /// Mark a network to start at host boot.
    fn set_network_autostart(&self, name: &str) -> Result<()>;
    /// Stop a network.
    fn destroy_network(&self, name: &str) -> Result<()>;
    /// Remove a network definition.
    fn undefine_network(&self, name: &str) -> Result<()>;
    /// Current DHCP leases of a network.
    fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>>;

    /// Host facts.
    fn host_info(&self) -> Result<HostInfo>;
    /// Host memory counters.
    fn memory_stats(&self) -> Result<MemoryStats>;
    /// Names of host network interfaces.
    fn list_interfaces(&self) -> Result<Vec<String>>;

    /// Whether a domain with this name is defined.
    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_domains()?.iter().any(|d| d == name))
    }
}
