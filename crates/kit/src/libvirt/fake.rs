//! In-memory hypervisor used by unit tests.
//!
//! Models just enough libvirt behavior for the engine: persistent vs live
//! definitions, hypervisor-assigned UUIDs, pools, volumes with backing stores,
//! networks with leases, and per-operation failure injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::{
    DeviceScope, DhcpLease, DomainState, HostInfo, Hypervisor, MemoryStats, VolumeRecord,
};
use crate::units;
use crate::volume::{BackingStore, VolumeDescriptor, VolumeFormat, VolumeKind};
use crate::xml_utils::{parse_xml_dom, XmlNode};

#[derive(Debug)]
struct FakeDomain {
    persistent: XmlNode,
    live: Option<XmlNode>,
    autostart: bool,
    paused: bool,
    snapshots: Vec<String>,
}

#[derive(Debug)]
struct FakePool {
    path: String,
    kind: String,
    active: bool,
}

#[derive(Debug)]
struct FakeNetwork {
    xml: String,
    active: bool,
    autostart: bool,
    leases: Vec<DhcpLease>,
}

#[derive(Debug)]
struct State {
    domains: BTreeMap<String, FakeDomain>,
    pools: BTreeMap<String, FakePool>,
    volumes: BTreeMap<String, VolumeRecord>,
    networks: BTreeMap<String, FakeNetwork>,
    interfaces: Vec<String>,
    memory: MemoryStats,
    failing: BTreeSet<String>,
    calls: Vec<String>,
    attach_scopes: Vec<DeviceScope>,
    uploads: Vec<(String, Utf8PathBuf)>,
}

const DEFAULT_NETWORK: &str = "<network><name>default</name><forward mode='nat'/><bridge name='virbr0'/><ip address='192.168.122.1' netmask='255.255.255.0'><dhcp><range start='192.168.122.2' end='192.168.122.254'/></dhcp></ip></network>";

/// Fake hypervisor with a `default` pool at `/var/lib/libvirt/images` and a
/// `default` NAT network on 192.168.122.0/24.
///
/// Clones share state, so a test can keep a handle after boxing one.
#[derive(Debug, Clone)]
pub(crate) struct FakeHypervisor {
    state: Arc<Mutex<State>>,
}

impl FakeHypervisor {
    pub(crate) fn new() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(
            "default".to_string(),
            FakePool {
                path: "/var/lib/libvirt/images".into(),
                kind: "dir".into(),
                active: true,
            },
        );
        let mut networks = BTreeMap::new();
        networks.insert(
            "default".to_string(),
            FakeNetwork {
                xml: DEFAULT_NETWORK.to_string(),
                active: true,
                autostart: true,
                leases: Vec::new(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(State {
                domains: BTreeMap::new(),
                pools,
                volumes: BTreeMap::new(),
                networks,
                interfaces: vec!["lo".into(), "eth0".into(), "br0".into()],
                memory: MemoryStats {
                    total: 16 * units::GIB,
                    free: 12 * units::GIB,
                },
                failing: BTreeSet::new(),
                calls: Vec::new(),
                attach_scopes: Vec::new(),
                uploads: Vec::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record a call and fail if the operation was marked failing.
    fn enter(&self, op: &str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        if state.failing.contains(op) {
            return Err(ProvisionError::hypervisor(op, "injected failure"));
        }
        Ok(state)
    }

    pub(crate) fn fail_operation(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub(crate) fn attach_scopes(&self) -> Vec<DeviceScope> {
        self.state().attach_scopes.clone()
    }

    pub(crate) fn uploads(&self) -> Vec<(String, Utf8PathBuf)> {
        self.state().uploads.clone()
    }

    pub(crate) fn volume_paths(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    pub(crate) fn volume(&self, path: &str) -> Option<VolumeDescriptor> {
        self.state().volumes.get(path).map(|r| r.volume.clone())
    }

    pub(crate) fn persistent_xml(&self, name: &str) -> Option<String> {
        self.state()
            .domains
            .get(name)
            .map(|d| d.persistent.to_xml().unwrap())
    }

    pub(crate) fn is_autostart(&self, name: &str) -> bool {
        self.state().domains.get(name).is_some_and(|d| d.autostart)
    }

    pub(crate) fn set_memory(&self, stats: MemoryStats) {
        self.state().memory = stats;
    }

    pub(crate) fn add_pool(&self, name: &str, path: &str, kind: &str) {
        self.state().pools.insert(
            name.to_string(),
            FakePool {
                path: path.to_string(),
                kind: kind.to_string(),
                active: true,
            },
        );
    }

    pub(crate) fn add_volume(&self, pool: &str, name: &str, capacity: u64, backing: Option<&str>) {
        let mut state = self.state();
        let dir = state.pools[pool].path.clone();
        let path = Utf8PathBuf::from(dir).join(name);
        let record = VolumeRecord {
            pool: pool.to_string(),
            volume: VolumeDescriptor {
                name: name.to_string(),
                path: path.clone(),
                capacity,
                format: VolumeFormat::Qcow2,
                kind: VolumeKind::File,
                backing: backing.map(|b| BackingStore {
                    path: b.into(),
                    format: VolumeFormat::Qcow2,
                }),
            },
        };
        state.volumes.insert(path.to_string(), record);
    }

    pub(crate) fn add_snapshot(&self, domain: &str, snapshot: &str) {
        if let Some(d) = self.state().domains.get_mut(domain) {
            d.snapshots.push(snapshot.to_string());
        }
    }

    pub(crate) fn add_lease(&self, network: &str, mac: &str, ip: &str) {
        if let Some(n) = self.state().networks.get_mut(network) {
            n.leases.push(DhcpLease {
                mac: mac.to_lowercase(),
                ip: ip.to_string(),
                hostname: None,
            });
        }
    }

    pub(crate) fn network_autostart(&self, name: &str) -> bool {
        self.state().networks.get(name).is_some_and(|n| n.autostart)
    }
}

fn missing(kind: &str, name: &str) -> ProvisionError {
    ProvisionError::hypervisor(kind, format!("no {kind} with matching name '{name}'"))
}

fn text_of(node: &XmlNode, child: &str) -> Option<String> {
    node.child(child).map(|c| c.text_content().to_string())
}

/// Whether `device` is the same device as `candidate` for detach purposes.
fn same_device(device: &XmlNode, candidate: &XmlNode) -> bool {
    if device.name != candidate.name {
        return false;
    }
    match device.name.as_str() {
        "disk" => {
            let dev = |n: &XmlNode| {
                n.child("target")
                    .and_then(|t| t.attr("dev"))
                    .map(str::to_string)
            };
            dev(device).is_some() && dev(device) == dev(candidate)
        }
        "interface" => {
            let mac = |n: &XmlNode| {
                n.child("mac")
                    .and_then(|m| m.attr("address"))
                    .map(str::to_lowercase)
            };
            mac(device).is_some() && mac(device) == mac(candidate)
        }
        _ => device == candidate,
    }
}

fn attach_to(root: &mut XmlNode, device: XmlNode) -> Result<()> {
    let devices = root.ensure_child("devices");
    if devices.children.iter().any(|c| same_device(&device, c)) {
        return Err(ProvisionError::hypervisor(
            "attach-device",
            "target already exists",
        ));
    }
    devices.children.push(device);
    Ok(())
}

fn detach_from(root: &mut XmlNode, device: &XmlNode) -> Result<()> {
    let devices = root.ensure_child("devices");
    let before = devices.children.len();
    devices.children.retain(|c| !same_device(device, c));
    if devices.children.len() == before {
        return Err(ProvisionError::hypervisor(
            "detach-device",
            "device not found",
        ));
    }
    Ok(())
}

impl Hypervisor for FakeHypervisor {
    fn uri(&self) -> &str {
        "test:///fake"
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.enter("list_domains")?.domains.keys().cloned().collect())
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        let state = self.enter("domain_xml")?;
        let d = state.domains.get(name).ok_or_else(|| missing("domain", name))?;
        d.live.as_ref().unwrap_or(&d.persistent).to_xml()
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        let state = self.enter("domain_state")?;
        let d = state.domains.get(name).ok_or_else(|| missing("domain", name))?;
        Ok(match (&d.live, d.paused) {
            (Some(_), true) => DomainState::Paused,
            (Some(_), false) => DomainState::Running,
            (None, _) => DomainState::ShutOff,
        })
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        let mut root = parse_xml_dom(xml)?;
        let mut state = self.enter("define_domain")?;
        let name = text_of(&root, "name")
            .ok_or_else(|| ProvisionError::hypervisor("define_domain", "missing name"))?;
        let uuid = text_of(&root, "uuid");
        if let Some(uuid) = &uuid {
            let clash = state.domains.iter().any(|(n, d)| {
                n != &name && text_of(&d.persistent, "uuid").as_ref() == Some(uuid)
            });
            if clash {
                return Err(ProvisionError::hypervisor(
                    "define_domain",
                    format!("domain with uuid {uuid} already exists"),
                ));
            }
        } else {
            let assigned = state
                .domains
                .get(&name)
                .and_then(|d| text_of(&d.persistent, "uuid"))
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            root.children.insert(
                1.min(root.children.len()),
                XmlNode::new("uuid").with_text(assigned),
            );
        }
        match state.domains.get_mut(&name) {
            Some(d) => d.persistent = root,
            None => {
                state.domains.insert(
                    name,
                    FakeDomain {
                        persistent: root,
                        live: None,
                        autostart: false,
                        paused: false,
                        snapshots: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("undefine_domain")?;
        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("domain", name))
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("start_domain")?;
        let d = state.domains.get_mut(name).ok_or_else(|| missing("domain", name))?;
        if d.live.is_some() {
            return Err(ProvisionError::hypervisor("start_domain", "domain is already active"));
        }
        d.live = Some(d.persistent.clone());
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.destroy_domain(name)
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("destroy_domain")?;
        let d = state.domains.get_mut(name).ok_or_else(|| missing("domain", name))?;
        if d.live.take().is_none() {
            return Err(ProvisionError::hypervisor("destroy_domain", "domain is not running"));
        }
        d.paused = false;
        Ok(())
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        let state = self.enter("reboot_domain")?;
        let d = state.domains.get(name).ok_or_else(|| missing("domain", name))?;
        if d.live.is_none() {
            return Err(ProvisionError::hypervisor("reboot_domain", "domain is not running"));
        }
        Ok(())
    }

    fn suspend_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("suspend_domain")?;
        let d = state.domains.get_mut(name).ok_or_else(|| missing("domain", name))?;
        if d.live.is_none() {
            return Err(ProvisionError::hypervisor("suspend_domain", "domain is not running"));
        }
        d.paused = true;
        Ok(())
    }

    fn resume_domain(&self, name: &str) -> Result<()> {
        let mut state = self.enter("resume_domain")?;
        let d = state.domains.get_mut(name).ok_or_else(|| missing("domain", name))?;
        if !d.paused {
            return Err(ProvisionError::hypervisor("resume_domain", "domain is not paused"));
        }
        d.paused = false;
        Ok(())
    }

    fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.enter("set_autostart")?;
        let d = state.domains.get_mut(name).ok_or_else(|| missing("domain", name))?;
        d.autostart = enabled;
        Ok(())
    }

    fn attach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let device = parse_xml_dom(xml)?;
        let mut state = self.enter("attach_device")?;
        state.attach_scopes.push(scope);
        let d = state.domains.get_mut(domain).ok_or_else(|| missing("domain", domain))?;
        match (scope, d.live.as_mut()) {
            (DeviceScope::Live, Some(live)) => attach_to(live, device),
            (DeviceScope::Live, None) => Err(ProvisionError::hypervisor(
                "attach_device",
                "domain is not running",
            )),
            (DeviceScope::Config, _) => attach_to(&mut d.persistent, device),
        }
    }

    fn detach_device(&self, domain: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let device = parse_xml_dom(xml)?;
        let mut state = self.enter("detach_device")?;
        let d = state.domains.get_mut(domain).ok_or_else(|| missing("domain", domain))?;
        match (scope, d.live.as_mut()) {
            (DeviceScope::Live, Some(live)) => detach_from(live, &device),
            (DeviceScope::Live, None) => Err(ProvisionError::hypervisor(
                "detach_device",
                "domain is not running",
            )),
            (DeviceScope::Config, _) => detach_from(&mut d.persistent, &device),
        }
    }

    fn list_snapshots(&self, domain: &str) -> Result<Vec<String>> {
        let state = self.enter("list_snapshots")?;
        let d = state.domains.get(domain).ok_or_else(|| missing("domain", domain))?;
        Ok(d.snapshots.clone())
    }

    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        let mut state = self.enter("delete_snapshot")?;
        let d = state.domains.get_mut(domain).ok_or_else(|| missing("domain", domain))?;
        let before = d.snapshots.len();
        d.snapshots.retain(|s| s != snapshot);
        if d.snapshots.len() == before {
            return Err(missing("snapshot", snapshot));
        }
        Ok(())
    }

    fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.enter("list_pools")?.pools.keys().cloned().collect())
    }

    fn pool_xml(&self, pool: &str) -> Result<String> {
        let state = self.enter("pool_xml")?;
        let p = state.pools.get(pool).ok_or_else(|| missing("pool", pool))?;
        let used: u64 = state
            .volumes
            .values()
            .filter(|v| v.pool == pool)
            .map(|v| v.volume.capacity)
            .sum();
        let capacity = 100 * units::GIB;
        let bytes = |name: &str, n: u64| {
            XmlNode::new(name)
                .with_attr("unit", "bytes")
                .with_text(n.to_string())
        };
        XmlNode::new("pool")
            .with_attr("type", p.kind.as_str())
            .with_child(XmlNode::new("name").with_text(pool))
            .with_child(bytes("capacity", capacity))
            .with_child(bytes("allocation", used))
            .with_child(bytes("available", capacity.saturating_sub(used)))
            .with_child(
                XmlNode::new("target").with_child(XmlNode::new("path").with_text(p.path.as_str())),
            )
            .to_xml()
    }

    fn pool_is_active(&self, pool: &str) -> Result<bool> {
        let state = self.enter("pool_is_active")?;
        Ok(state.pools.get(pool).is_some_and(|p| p.active))
    }

    fn define_pool(&self, xml: &str) -> Result<()> {
        let root = parse_xml_dom(xml)?;
        let mut state = self.enter("define_pool")?;
        let name = text_of(&root, "name")
            .ok_or_else(|| ProvisionError::hypervisor("define_pool", "missing name"))?;
        let path = root
            .find("path")
            .map(|p| p.text_content().to_string())
            .ok_or_else(|| ProvisionError::hypervisor("define_pool", "missing target path"))?;
        state.pools.insert(
            name,
            FakePool {
                path,
                kind: root.attr("type").unwrap_or("dir").to_string(),
                active: false,
            },
        );
        Ok(())
    }

    fn build_pool(&self, pool: &str) -> Result<()> {
        let state = self.enter("build_pool")?;
        state.pools.get(pool).map(|_| ()).ok_or_else(|| missing("pool", pool))
    }

    fn start_pool(&self, pool: &str) -> Result<()> {
        let mut state = self.enter("start_pool")?;
        let p = state.pools.get_mut(pool).ok_or_else(|| missing("pool", pool))?;
        p.active = true;
        Ok(())
    }

    fn set_pool_autostart(&self, pool: &str) -> Result<()> {
        let state = self.enter("set_pool_autostart")?;
        state.pools.get(pool).map(|_| ()).ok_or_else(|| missing("pool", pool))
    }

    fn destroy_pool(&self, pool: &str) -> Result<()> {
        let mut state = self.enter("destroy_pool")?;
        let p = state.pools.get_mut(pool).ok_or_else(|| missing("pool", pool))?;
        p.active = false;
        Ok(())
    }

    fn undefine_pool(&self, pool: &str) -> Result<()> {
        let mut state = self.enter("undefine_pool")?;
        state.pools.remove(pool).map(|_| ()).ok_or_else(|| missing("pool", pool))
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let volume = VolumeDescriptor::from_xml(xml)?;
        let mut state = self.enter("create_volume")?;
        if !state.pools.contains_key(pool) {
            return Err(missing("pool", pool));
        }
        let key = volume.path.to_string();
        if state.volumes.contains_key(&key) {
            return Err(ProvisionError::hypervisor(
                "create_volume",
                "storage volume already exists",
            ));
        }
        state.volumes.insert(
            key,
            VolumeRecord {
                pool: pool.to_string(),
                volume,
            },
        );
        Ok(())
    }

    fn lookup_volume(&self, path: &str) -> Result<Option<VolumeRecord>> {
        Ok(self.enter("lookup_volume")?.volumes.get(path).cloned())
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let state = self.enter("list_volumes")?;
        Ok(state
            .volumes
            .iter()
            .filter(|(_, v)| v.pool == pool)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete_volume(&self, path: &str) -> Result<()> {
        let mut state = self.enter("delete_volume")?;
        state
            .volumes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| ProvisionError::VolumeNotFound(path.to_string()))
    }

    fn upload_volume(&self, path: &str, source: &Utf8Path) -> Result<()> {
        let mut state = self.enter("upload_volume")?;
        if !state.volumes.contains_key(path) {
            return Err(ProvisionError::VolumeNotFound(path.to_string()));
        }
        state.uploads.push((path.to_string(), source.to_owned()));
        Ok(())
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.enter("list_networks")?.networks.keys().cloned().collect())
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        let state = self.enter("network_xml")?;
        state
            .networks
            .get(name)
            .map(|n| n.xml.clone())
            .ok_or_else(|| missing("network", name))
    }

    fn network_is_active(&self, name: &str) -> Result<bool> {
        let state = self.enter("network_is_active")?;
        Ok(state.networks.get(name).is_some_and(|n| n.active))
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        let root = parse_xml_dom(xml)?;
        let mut state = self.enter("define_network")?;
        let name = text_of(&root, "name")
            .ok_or_else(|| ProvisionError::hypervisor("define_network", "missing name"))?;
        state.networks.insert(
            name,
            FakeNetwork {
                xml: xml.to_string(),
                active: false,
                autostart: false,
                leases: Vec::new(),
            },
        );
        Ok(())
    }

    fn start_network(&self, name: &str) -> Result<()> {
        let mut state = self.enter("start_network")?;
        let n = state.networks.get_mut(name).ok_or_else(|| missing("network", name))?;
        n.active = true;
        Ok(())
    }

    fn set_network_autostart(&self, name: &str) -> Result<()> {
        let mut state = self.enter("set_network_autostart")?;
        let n = state.networks.get_mut(name).ok_or_else(|| missing("network", name))?;
        n.autostart = true;
        Ok(())
    }

    fn destroy_network(&self, name: &str) -> Result<()> {
        let mut state = self.enter("destroy_network")?;
        let n = state.networks.get_mut(name).ok_or_else(|| missing("network", name))?;
        n.active = false;
        Ok(())
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        let mut state = self.enter("undefine_network")?;
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("network", name))
    }

    fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        let state = self.enter("dhcp_leases")?;
        state
            .networks
            .get(network)
            .map(|n| n.leases.clone())
            .ok_or_else(|| missing("network", network))
    }

    fn host_info(&self) -> Result<HostInfo> {
        let state = self.enter("host_info")?;
        Ok(HostInfo {
            hostname: "fakehost".into(),
            cpus: 8,
            cpu_model: "x86_64".into(),
            memory: state.memory.total,
        })
    }

    fn memory_stats(&self) -> Result<MemoryStats> {
        Ok(self.enter("memory_stats")?.memory)
    }

    fn list_interfaces(&self) -> Result<Vec<String>> {
        Ok(self.enter("list_interfaces")?.interfaces.clone())
    }
}
