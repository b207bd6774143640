//! [`Hypervisor`] implementation that drives libvirt through the `virsh` CLI

use std::io::Write as _;
use std::process::Command;

use camino::Utf8Path;
use tracing::{debug, trace};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::{
    DeviceScope, DhcpLease, DomainState, HostInfo, Hypervisor, MemoryStats, VolumeRecord,
};
use crate::units::KIB;
use crate::volume::VolumeDescriptor;

/// A libvirt connection addressed by URI.
///
/// Each call spawns `virsh -c <uri> ...`; there is no long-lived session, so the
/// handle is trivially shareable between threads.
#[derive(Debug, Clone)]
pub struct VirshConnection {
    uri: String,
}

impl VirshConnection {
    /// Verify that `uri` is reachable and return a handle to it.
    pub fn open(uri: &str) -> Result<Self> {
        let conn = Self {
            uri: uri.to_string(),
        };
        let reported = conn.output(&["uri"]).map_err(|e| ProvisionError::Connection {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        debug!("Connected to {}", reported.trim());
        Ok(conn)
    }

    /// Create a virsh command bound to this connection
    fn virsh_command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.uri);
        cmd
    }

    /// Run a virsh command and return its stdout, folding stderr into the error
    fn output(&self, args: &[&str]) -> Result<String> {
        trace!("virsh {:?}", args);
        let output = self.virsh_command().args(args).output().map_err(|e| {
            ProvisionError::hypervisor(format!("virsh {}", args.join(" ")), e.to_string())
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let operation = args.first().copied().unwrap_or("virsh");
            return Err(ProvisionError::hypervisor(
                format!("virsh {operation}"),
                stderr.trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        self.output(args).map(|_| ())
    }

    /// Write `xml` to a temporary file and hand its path to `f`
    fn with_xml_file<T>(&self, xml: &str, f: impl FnOnce(&str) -> Result<T>) -> Result<T> {
        let mut file = tempfile::Builder::new()
            .prefix("virtforge-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_str().ok_or_else(|| {
            ProvisionError::InvalidParameter("temporary directory path is not UTF-8".into())
        })?;
        f(path)
    }

    fn scope_flag(scope: DeviceScope) -> &'static str {
        match scope {
            DeviceScope::Live => "--live",
            DeviceScope::Config => "--config",
        }
    }
}

fn is_missing_volume(err: &ProvisionError) -> bool {
    match err {
        ProvisionError::Hypervisor { message, .. } => {
            message.contains("Storage volume not found") || message.contains("no storage vol")
        }
        _ => false,
    }
}

/// Parse one-name-per-line output such as `virsh list --name`.
pub(crate) fn parse_name_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn table_rows(stdout: &str) -> impl Iterator<Item = Vec<&str>> {
    stdout
        .lines()
        .skip_while(|l| !l.trim_start().starts_with('-'))
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty())
}

/// Volume paths from `virsh vol-list <pool>`.
pub(crate) fn parse_vol_list(stdout: &str) -> Vec<String> {
    table_rows(stdout)
        .filter(|cols| cols.len() >= 2)
        .filter_map(|cols| cols.last().map(|p| p.to_string()))
        .collect()
}

/// Interface names from `virsh iface-list --all`.
pub(crate) fn parse_iface_list(stdout: &str) -> Vec<String> {
    table_rows(stdout)
        .filter_map(|cols| cols.first().map(|n| n.to_string()))
        .collect()
}

/// IPv4 leases from `virsh net-dhcp-leases <network>`.
pub(crate) fn parse_dhcp_leases(stdout: &str) -> Vec<DhcpLease> {
    table_rows(stdout)
        // expiry date, expiry time, mac, protocol, address, hostname, client id
        .filter(|cols| cols.len() >= 5 && cols[3] == "ipv4")
        .map(|cols| DhcpLease {
            mac: cols[2].to_lowercase(),
            ip: cols[4].split('/').next().unwrap_or(cols[4]).to_string(),
            hostname: cols
                .get(5)
                .filter(|h| **h != "-")
                .map(|h| h.to_string()),
        })
        .collect()
}

fn field<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    stdout.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn kib_field(stdout: &str, key: &str) -> Option<u64> {
    field(stdout, key)?
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * KIB)
}

/// Host memory from `virsh nodememstats`.
pub(crate) fn parse_nodememstats(stdout: &str) -> Result<MemoryStats> {
    let missing =
        |k: &str| ProvisionError::hypervisor("virsh nodememstats", format!("missing {k}"));
    Ok(MemoryStats {
        total: kib_field(stdout, "total").ok_or_else(|| missing("total"))?,
        free: kib_field(stdout, "free").ok_or_else(|| missing("free"))?,
    })
}

/// CPU count, model and memory from `virsh nodeinfo`.
pub(crate) fn parse_nodeinfo(hostname: &str, stdout: &str) -> Result<HostInfo> {
    let cpus = field(stdout, "CPU(s)")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProvisionError::hypervisor("virsh nodeinfo", "missing CPU(s)"))?;
    Ok(HostInfo {
        hostname: hostname.trim().to_string(),
        cpus,
        cpu_model: field(stdout, "CPU model").unwrap_or("unknown").to_string(),
        memory: kib_field(stdout, "Memory size").unwrap_or(0),
    })
}

impl Hypervisor for VirshConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.output(&["list", "--all", "--name"])?))
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        self.output(&["dumpxml", name])
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        Ok(DomainState::parse(&self.output(&["domstate", name])?))
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        self.with_xml_file(xml, |path| self.run(&["define", path]))
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        self.run(&["undefine", name, "--nvram"])
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.run(&["start", name])
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.run(&["shutdown", name])
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name])
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.run(&["reboot", name])
    }

    fn suspend_domain(&self, name: &str) -> Result<()> {
        self.run(&["suspend", name])
    }

    fn resume_domain(&self, name: &str) -> Result<()> {
        self.run(&["resume", name])
    }

    fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.run(&["autostart", name])
        } else {
            self.run(&["autostart", "--disable", name])
        }
    }

    fn attach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        self.with_xml_file(xml, |path| {
            self.run(&["attach-device", domain, path, Self::scope_flag(scope)])
        })
    }

    fn detach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        self.with_xml_file(xml, |path| {
            self.run(&["detach-device", domain, path, Self::scope_flag(scope)])
        })
    }

    fn list_snapshots(&self, domain: &str) -> Result<Vec<String>> {
        Ok(parse_name_list(
            &self.output(&["snapshot-list", domain, "--name"])?,
        ))
    }

    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.run(&["snapshot-delete", domain, snapshot])
    }

    fn list_pools(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.output(&["pool-list", "--all", "--name"])?))
    }

    fn pool_xml(&self, pool: &str) -> Result<String> {
        self.output(&["pool-dumpxml", pool])
    }

    fn pool_is_active(&self, pool: &str) -> Result<bool> {
        let active = parse_name_list(&self.output(&["pool-list", "--name"])?);
        Ok(active.iter().any(|p| p == pool))
    }

    fn define_pool(&self, xml: &str) -> Result<()> {
        self.with_xml_file(xml, |path| self.run(&["pool-define", path]))
    }

    fn build_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-build", pool])
    }

    fn start_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-start", pool])
    }

    fn set_pool_autostart(&self, pool: &str) -> Result<()> {
        self.run(&["pool-autostart", pool])
    }

    fn destroy_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-destroy", pool])
    }

    fn undefine_pool(&self, pool: &str) -> Result<()> {
        self.run(&["pool-undefine", pool])
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        self.with_xml_file(xml, |path| self.run(&["vol-create", pool, path]))
    }

    fn lookup_volume(&self, path: &str) -> Result<Option<VolumeRecord>> {
        let xml = match self.output(&["vol-dumpxml", path]) {
            Ok(xml) => xml,
            Err(e) if is_missing_volume(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let pool = self.output(&["vol-pool", path])?.trim().to_string();
        Ok(Some(VolumeRecord {
            pool,
            volume: VolumeDescriptor::from_xml(&xml)?,
        }))
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        Ok(parse_vol_list(&self.output(&["vol-list", pool])?))
    }

    fn delete_volume(&self, path: &str) -> Result<()> {
        match self.run(&["vol-delete", path]) {
            Err(e) if is_missing_volume(&e) => {
                Err(ProvisionError::VolumeNotFound(path.to_string()))
            }
            other => other,
        }
    }

    fn upload_volume(&self, path: &str, source: &Utf8Path) -> Result<()> {
        self.run(&["vol-upload", path, source.as_str()])
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.output(&["net-list", "--all", "--name"])?))
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        self.output(&["net-dumpxml", name])
    }

    fn network_is_active(&self, name: &str) -> Result<bool> {
        let active = parse_name_list(&self.output(&["net-list", "--name"])?);
        Ok(active.iter().any(|n| n == name))
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        self.with_xml_file(xml, |path| self.run(&["net-define", path]))
    }

    fn start_network(&self, name: &str) -> Result<()> {
        self.run(&["net-start", name])
    }

    fn set_network_autostart(&self, name: &str) -> Result<()> {
        self.run(&["net-autostart", name])
    }

    fn destroy_network(&self, name: &str) -> Result<()> {
        self.run(&["net-destroy", name])
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        self.run(&["net-undefine", name])
    }

    fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        Ok(parse_dhcp_leases(
            &self.output(&["net-dhcp-leases", network])?,
        ))
    }

    fn host_info(&self) -> Result<HostInfo> {
        let hostname = self.output(&["hostname"])?;
        parse_nodeinfo(&hostname, &self.output(&["nodeinfo"])?)
    }

    fn memory_stats(&self) -> Result<MemoryStats> {
        parse_nodememstats(&self.output(&["nodememstats"])?)
    }

    fn list_interfaces(&self) -> Result<Vec<String>> {
        Ok(parse_iface_list(&self.output(&["iface-list", "--all"])?))
    }
}
