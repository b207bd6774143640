//! Virtual networks
//!
//! Creation reports a structured [`NetworkOutcome`] instead of an error, since
//! networks sit outside the per-domain rollback chain.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::descriptor::DomainDescriptor;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;
use crate::xml_utils::{parse_xml_dom, XmlWriter};

/// An IPv4 network in CIDR notation. Host bits are cleared on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

fn mask_bits(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Cidr {
    /// Build from any address inside the network and a prefix length.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(ProvisionError::InvalidParameter(format!(
                "prefix length {prefix} is out of range"
            )));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask_bits(prefix)),
            prefix,
        })
    }

    /// Build from an address and a dotted netmask; the mask must be contiguous.
    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self> {
        let bits = u32::from(netmask);
        let prefix = bits.leading_ones();
        if bits.count_ones() != prefix {
            return Err(ProvisionError::InvalidParameter(format!(
                "netmask {netmask} is not contiguous"
            )));
        }
        Self::new(addr, prefix as u8)
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Dotted netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix))
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_bits(self.prefix))
    }

    fn start(&self) -> u32 {
        u32::from(self.network)
    }

    fn end(&self) -> u32 {
        u32::from(self.broadcast())
    }

    /// Whether the two ranges share any address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.start() <= other.end() && other.start() <= self.end()
    }

    /// Gateway: the first usable address.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start() + 1)
    }

    /// DHCP pool from the second usable address to the second-to-last usable one.
    pub fn dhcp_range(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        if self.prefix > 29 {
            return Err(ProvisionError::InvalidParameter(format!(
                "{self} is too small for a gateway and a DHCP pool"
            )));
        }
        Ok((
            Ipv4Addr::from(self.start() + 2),
            Ipv4Addr::from(self.end() - 2),
        ))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProvisionError::InvalidParameter(format!("Invalid Cidr {s}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

/// Parameters of a new virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,
    /// Address range.
    pub cidr: String,
    /// Serve DHCP on the range.
    pub dhcp: bool,
    /// NAT outbound traffic through the host.
    pub nat: bool,
}

/// Outcome of [`NetworkManager::create_network`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum NetworkOutcome {
    /// The network is defined, started and set to autostart.
    Success,
    /// Nothing was created.
    Failure {
        /// Why.
        reason: String,
    },
}

impl NetworkOutcome {
    fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    /// Whether the network was created.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Build the network descriptor.
pub fn network_xml(spec: &NetworkSpec, cidr: &Ipv4Cidr) -> Result<String> {
    let gateway = cidr.gateway().to_string();
    let netmask = cidr.netmask().to_string();
    let mut w = XmlWriter::new();
    w.start_element("network", &[])?;
    w.write_text_element("name", &spec.name)?;
    if spec.nat {
        w.start_element("forward", &[("mode", "nat")])?;
        w.start_element("nat", &[])?;
        w.write_empty_element("port", &[("start", "1024"), ("end", "65535")])?;
        w.end_element("nat")?;
        w.end_element("forward")?;
    }
    w.write_empty_element("domain", &[("name", &spec.name)])?;
    w.start_element("ip", &[("address", &gateway), ("netmask", &netmask)])?;
    if spec.dhcp {
        let (start, end) = cidr.dhcp_range()?;
        w.start_element("dhcp", &[])?;
        w.write_empty_element(
            "range",
            &[("start", &start.to_string()), ("end", &end.to_string())],
        )?;
        w.end_element("dhcp")?;
    }
    w.end_element("ip")?;
    w.end_element("network")?;
    w.into_string()
}

/// IPv4 ranges declared in a network descriptor.
pub fn declared_ranges(xml: &str) -> Result<Vec<Ipv4Cidr>> {
    let dom = parse_xml_dom(xml)?;
    let mut out = Vec::new();
    for ip in dom.children_named("ip") {
        if ip.attr("family").is_some_and(|f| f != "ipv4") {
            continue;
        }
        let Some(addr) = ip.attr("address").and_then(|a| a.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        let cidr = if let Some(mask) = ip.attr("netmask").and_then(|m| m.parse().ok()) {
            Ipv4Cidr::from_netmask(addr, mask)?
        } else if let Some(prefix) = ip.attr("prefix").and_then(|p| p.parse().ok()) {
            Ipv4Cidr::new(addr, prefix)?
        } else {
            continue;
        };
        out.push(cidr);
    }
    Ok(out)
}

/// One row of [`NetworkManager::list_networks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSummary {
    /// Network name.
    pub name: String,
    /// Declared IPv4 ranges.
    pub cidrs: Vec<String>,
    /// Forward mode (`nat`, `route`, ...), if any.
    pub forward: Option<String>,
    /// Whether the network serves DHCP.
    pub dhcp: bool,
    /// Whether the network is started.
    pub active: bool,
}

/// Network operations over a hypervisor connection.
#[derive(Debug, Clone, Copy)]
pub struct NetworkManager<'a> {
    conn: &'a dyn Hypervisor,
}

impl<'a> NetworkManager<'a> {
    /// Wrap a connection.
    pub fn new(conn: &'a dyn Hypervisor) -> Self {
        Self { conn }
    }

    /// Every declared IPv4 range, paired with its network name.
    pub fn existing_ranges(&self) -> Result<Vec<(String, Ipv4Cidr)>> {
        let mut out = Vec::new();
        for name in self.conn.list_networks()? {
            let xml = self.conn.network_xml(&name)?;
            match declared_ranges(&xml) {
                Ok(ranges) => out.extend(ranges.into_iter().map(|c| (name.clone(), c))),
                Err(e) => warn!("Ignoring unparseable network {}: {}", name, e),
            }
        }
        Ok(out)
    }

    /// Define, autostart and start a network.
    pub fn create_network(&self, spec: &NetworkSpec) -> NetworkOutcome {
        match self.try_create(spec) {
            Ok(outcome) => outcome,
            Err(e) => NetworkOutcome::failure(e.to_string()),
        }
    }

    fn try_create(&self, spec: &NetworkSpec) -> Result<NetworkOutcome> {
        if self.conn.list_networks()?.iter().any(|n| n == &spec.name) {
            return Ok(NetworkOutcome::failure(format!(
                "Network {} already exists",
                spec.name
            )));
        }
        let cidr: Ipv4Cidr = match spec.cidr.parse() {
            Ok(c) => c,
            Err(_) => return Ok(NetworkOutcome::failure(format!("Invalid Cidr {}", spec.cidr))),
        };
        if let Err(e) = cidr.dhcp_range() {
            return Ok(NetworkOutcome::failure(e.to_string()));
        }
        for (name, existing) in self.existing_ranges()? {
            if existing == cidr {
                return Ok(NetworkOutcome::failure(format!(
                    "Cidr {existing} already exists in network {name}"
                )));
            }
            if existing.overlaps(&cidr) {
                return Ok(NetworkOutcome::failure(format!(
                    "Cidr {cidr} overlaps Cidr {existing} of network {name}"
                )));
            }
        }

        let xml = network_xml(spec, &cidr)?;
        debug!("Defining network {}: {}", spec.name, xml);
        self.conn.define_network(&xml)?;
        self.conn.set_network_autostart(&spec.name)?;
        self.conn.start_network(&spec.name)?;
        info!("Created network {} on {}", spec.name, cidr);
        Ok(NetworkOutcome::Success)
    }

    /// Stop and undefine a network.
    pub fn delete_network(&self, name: &str) -> Result<()> {
        if !self.conn.list_networks()?.iter().any(|n| n == name) {
            return Err(ProvisionError::InvalidParameter(format!(
                "network {name} does not exist"
            )));
        }
        if self.conn.network_is_active(name)? {
            self.conn.destroy_network(name)?;
        }
        self.conn.undefine_network(name)?;
        info!("Removed network {}", name);
        Ok(())
    }

    /// Summaries of every network.
    pub fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        self.conn
            .list_networks()?
            .into_iter()
            .map(|name| -> Result<NetworkSummary> {
                let xml = self.conn.network_xml(&name)?;
                let dom = parse_xml_dom(&xml)?;
                Ok(NetworkSummary {
                    cidrs: declared_ranges(&xml)?.iter().map(|c| c.to_string()).collect(),
                    forward: dom
                        .child("forward")
                        .map(|f| f.attr("mode").unwrap_or("nat").to_string()),
                    dhcp: dom.find("dhcp").is_some(),
                    active: self.conn.network_is_active(&name)?,
                    name,
                })
            })
            .collect()
    }

    /// Domains with an interface on this network.
    pub fn members(&self, network: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for domain in self.conn.list_domains()? {
            let def = DomainDescriptor::parse(&self.conn.domain_xml(&domain)?)?;
            if def
                .interfaces()
                .iter()
                .any(|i| i.kind == "network" && i.source.as_deref() == Some(network))
            {
                out.push(domain);
            }
        }
        Ok(out)
    }

    /// Leased IPv4 address for `mac` on any network.
    pub fn lease_for(&self, mac: &str) -> Result<Option<String>> {
        let mac = mac.to_lowercase();
        for network in self.conn.list_networks()? {
            if !self.conn.network_is_active(&network)? {
                continue;
            }
            if let Some(lease) = self
                .conn
                .dhcp_leases(&network)?
                .into_iter()
                .find(|l| l.mac == mac)
            {
                return Ok(Some(lease.ip));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::fake::FakeHypervisor;

    fn spec(name: &str, cidr: &str) -> NetworkSpec {
        NetworkSpec {
            name: name.into(),
            cidr: cidr.into(),
            dhcp: true,
            nat: true,
        }
    }

    #[test]
    fn test_cidr_math() {
        let c: Ipv4Cidr = "10.0.0.77/24".parse().unwrap();
        assert_eq!(c.to_string(), "10.0.0.0/24");
        assert_eq!(c.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(c.broadcast(), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(c.gateway(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            c.dhcp_range().unwrap(),
            (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 253))
        );
        assert!("10.0.0.0/30".parse::<Ipv4Cidr>().unwrap().dhcp_range().is_err());

        let wide: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let other: Ipv4Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(wide.overlaps(&c));
        assert!(c.overlaps(&wide));
        assert!(!wide.overlaps(&other));

        for bad in ["10.0.0.0", "10.0.0.0/33", "300.0.0.0/8", "x/24"] {
            assert!(bad.parse::<Ipv4Cidr>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_from_netmask() {
        let c = Ipv4Cidr::from_netmask(
            Ipv4Addr::new(192, 168, 122, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .unwrap();
        assert_eq!(c.to_string(), "192.168.122.0/24");
        assert!(Ipv4Cidr::from_netmask(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 0, 255, 0)
        )
        .is_err());
    }

    #[test]
    fn test_network_xml() {
        let s = spec("lab", "10.0.0.0/24");
        let xml = network_xml(&s, &"10.0.0.0/24".parse().unwrap()).unwrap();
        similar_asserts::assert_eq!(
            xml,
            concat!(
                "<network><name>lab</name>",
                "<forward mode=\"nat\"><nat><port start=\"1024\" end=\"65535\"/></nat></forward>",
                "<domain name=\"lab\"/>",
                "<ip address=\"10.0.0.1\" netmask=\"255.255.255.0\">",
                "<dhcp><range start=\"10.0.0.2\" end=\"10.0.0.253\"/></dhcp>",
                "</ip></network>"
            )
        );
        assert_eq!(
            declared_ranges(&xml).unwrap(),
            vec!["10.0.0.0/24".parse::<Ipv4Cidr>().unwrap()]
        );
    }

    #[test]
    fn test_isolated_network_xml() {
        let s = NetworkSpec {
            dhcp: false,
            nat: false,
            ..spec("iso", "172.16.0.0/24")
        };
        let xml = network_xml(&s, &"172.16.0.0/24".parse().unwrap()).unwrap();
        assert!(!xml.contains("<forward"));
        assert!(!xml.contains("<dhcp>"));
    }

    #[test]
    fn test_duplicate_cidr_fails_second_time() {
        let fake = FakeHypervisor::new();
        let nets = NetworkManager::new(&fake);
        assert_eq!(nets.create_network(&spec("a", "10.0.0.0/24")), NetworkOutcome::Success);
        assert!(fake.network_is_active("a").unwrap());
        assert!(fake.network_autostart("a"));

        let NetworkOutcome::Failure { reason } = nets.create_network(&spec("b", "10.0.0.0/24"))
        else {
            panic!("second create should fail");
        };
        assert!(reason.contains("10.0.0.0/24"), "{reason}");
        assert!(!fake.list_networks().unwrap().contains(&"b".to_string()));
    }

    #[test]
    fn test_create_rejections() {
        let fake = FakeHypervisor::new();
        let nets = NetworkManager::new(&fake);
        let outcome = nets.create_network(&spec("default", "10.9.0.0/24"));
        assert_eq!(
            outcome,
            NetworkOutcome::Failure {
                reason: "Network default already exists".into()
            }
        );
        assert!(!nets.create_network(&spec("x", "10.0.0/24")).is_success());
        let NetworkOutcome::Failure { reason } = nets.create_network(&spec("y", "192.168.0.0/16"))
        else {
            panic!("overlap should fail");
        };
        assert!(reason.contains("192.168.122.0/24"), "{reason}");
    }

    #[test]
    fn test_outcome_json() {
        let v = serde_json::to_value(NetworkOutcome::failure("nope")).unwrap();
        assert_eq!(v, serde_json::json!({"result": "failure", "reason": "nope"}));
        let v = serde_json::to_value(NetworkOutcome::Success).unwrap();
        assert_eq!(v, serde_json::json!({"result": "success"}));
    }

    #[test]
    fn test_list_delete_and_leases() {
        let fake = FakeHypervisor::new();
        let nets = NetworkManager::new(&fake);
        assert!(nets.create_network(&spec("lab", "10.5.0.0/24")).is_success());
        let all = nets.list_networks().unwrap();
        assert_eq!(all.len(), 2);
        let lab = all.iter().find(|n| n.name == "lab").unwrap();
        assert_eq!(lab.cidrs, vec!["10.5.0.0/24"]);
        assert_eq!(lab.forward.as_deref(), Some("nat"));
        assert!(lab.dhcp);

        fake.add_lease("default", "52:54:00:AA:00:01", "192.168.122.10");
        assert_eq!(
            nets.lease_for("52:54:00:aa:00:01").unwrap().as_deref(),
            Some("192.168.122.10")
        );
        assert_eq!(nets.lease_for("52:54:00:aa:00:02").unwrap(), None);

        nets.delete_network("lab").unwrap();
        assert!(nets.delete_network("lab").is_err());
    }
}
