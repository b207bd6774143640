//! Host inventory report

use serde::Serialize;

use crate::capacity::{Availability, CapacityAdvisor};
use crate::error::Result;
use crate::hypervisor::{HostInfo, Hypervisor};
use crate::network::{NetworkManager, NetworkSummary};
use crate::pool::{PoolDescriptor, PoolManager};

/// Everything known about a hypervisor host at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    /// Connection URI.
    pub uri: String,
    /// CPU and memory facts.
    pub info: HostInfo,
    /// Storage pools.
    pub pools: Vec<PoolDescriptor>,
    /// Host interfaces usable as bridges.
    pub bridges: Vec<String>,
    /// Managed networks.
    pub networks: Vec<NetworkSummary>,
    /// Memory admission state.
    pub memory: Availability,
    /// Number of defined domains.
    pub domains: usize,
}

/// Collect a [`HostReport`] using `threshold` for the memory summary.
pub fn host_report(conn: &dyn Hypervisor, threshold: u8) -> Result<HostReport> {
    let bridges = conn
        .list_interfaces()?
        .into_iter()
        .filter(|i| i != "lo")
        .collect();
    Ok(HostReport {
        uri: conn.uri().to_string(),
        info: conn.host_info()?,
        pools: PoolManager::new(conn).list()?,
        bridges,
        networks: NetworkManager::new(conn).list_networks()?,
        memory: CapacityAdvisor::new(conn, threshold).availability()?,
        domains: conn.list_domains()?.len(),
    })
}
