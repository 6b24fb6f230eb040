use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kernel limit on interface names, excluding the trailing NUL
pub const MAX_IFNAME_LEN: usize = 15;

/// Interface name prefix the runtime uses inside the container
pub const CONTAINER_IFNAME_PREFIX: &str = "eth";

/// Immutable configuration of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// VLAN sub-interface name
    pub link_name: String,
    /// Bridge name
    pub bridge_name: String,
    /// VLAN ID (1-4094)
    pub vlan: u16,
    /// MTU applied to the sub-interface, bridge and veths
    pub mtu: u32,
    /// IPv4 subnet
    #[serde(rename = "ipv4Subnet")]
    pub ipv4_subnet: Ipv4Network,
    /// IPv4 gateway, assigned to the bridge
    #[serde(rename = "ipv4Gateway")]
    pub ipv4_gateway: Ipv4Addr,
    /// IPv6 subnet
    #[serde(rename = "ipv6Subnet", default, skip_serializing_if = "Option::is_none")]
    pub ipv6_subnet: Option<Ipv6Network>,
    /// IPv6 gateway
    #[serde(rename = "ipv6Gateway", default, skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<Ipv6Addr>,
    /// IPv6 requested for this network
    #[serde(rename = "enableIPv6", default)]
    pub enable_ipv6: bool,
}

impl NetworkConfig {
    /// Create a configuration with the default MTU and no IPv6
    pub fn new(
        link_name: &str,
        bridge_name: &str,
        vlan: u16,
        ipv4_subnet: Ipv4Network,
        ipv4_gateway: Ipv4Addr,
    ) -> Self {
        Self {
            link_name: link_name.to_string(),
            bridge_name: bridge_name.to_string(),
            vlan,
            mtu: 1500,
            ipv4_subnet,
            ipv4_gateway,
            ipv6_subnet: None,
            ipv6_gateway: None,
            enable_ipv6: false,
        }
    }

    /// Validate the configuration before it is registered
    pub fn validate(&self) -> Result<()> {
        if self.vlan < 1 || self.vlan > 4094 {
            return Err(Error::InvalidConfig(format!(
                "invalid VLAN ID {} (must be between 1 and 4094)",
                self.vlan
            )));
        }

        validate_ifname("link name", &self.link_name)?;
        validate_ifname("bridge name", &self.bridge_name)?;
        if self.link_name == self.bridge_name {
            return Err(Error::InvalidConfig(format!(
                "link and bridge must have different names, both are {}",
                self.link_name
            )));
        }

        if !(68..=65535).contains(&self.mtu) {
            return Err(Error::InvalidConfig(format!("invalid MTU {}", self.mtu)));
        }

        if !self.ipv4_subnet.contains(self.ipv4_gateway) {
            return Err(Error::InvalidConfig(format!(
                "gateway {} is outside subnet {}",
                self.ipv4_gateway, self.ipv4_subnet
            )));
        }

        match (self.ipv6_subnet, self.ipv6_gateway) {
            (None, Some(gateway)) => {
                return Err(Error::InvalidConfig(format!(
                    "IPv6 gateway {} given without a subnet",
                    gateway
                )));
            }
            (Some(subnet), Some(gateway)) if !subnet.contains(gateway) => {
                return Err(Error::InvalidConfig(format!(
                    "IPv6 gateway {} is outside subnet {}",
                    gateway, subnet
                )));
            }
            _ => {}
        }

        Ok(())
    }

    /// Gateway address with the subnet prefix, as assigned to the bridge
    pub fn gateway_cidr(&self) -> Ipv4Network {
        // The prefix comes from a parsed network, so it is always in range.
        Ipv4Network::new(self.ipv4_gateway, self.ipv4_subnet.prefix())
            .unwrap_or(self.ipv4_subnet)
    }
}

fn validate_ifname(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig(format!("{} is required", what)));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(Error::InvalidConfig(format!(
            "{} {} is longer than {} characters",
            what, name, MAX_IFNAME_LEN
        )));
    }
    if name.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(Error::InvalidConfig(format!(
            "{} {} contains invalid characters",
            what, name
        )));
    }
    Ok(())
}

/// Interface the orchestrator asked for when creating an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceRequest {
    /// IPv4 address with prefix length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Network>,
    /// IPv6 address with prefix length
    #[serde(rename = "addressIPv6", default, skip_serializing_if = "Option::is_none")]
    pub address_ipv6: Option<Ipv6Network>,
    /// MAC address for the container side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl InterfaceRequest {
    pub fn validate(&self) -> Result<()> {
        if let Some(mac) = &self.mac_address {
            if !is_valid_mac(mac) {
                return Err(Error::InvalidConfig(format!("invalid MAC address {}", mac)));
            }
        }
        Ok(())
    }
}

/// Returns true for a colon separated, six octet hardware address
pub fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A container endpoint attached to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Endpoint ID, unique within the network
    pub id: String,
    /// Host side of the veth pair, attached to the bridge
    pub host_veth_name: String,
    /// Container side of the veth pair, moved into the sandbox by the runtime
    pub container_interface_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Network>,
    #[serde(rename = "addressIPv6", default, skip_serializing_if = "Option::is_none")]
    pub address_ipv6: Option<Ipv6Network>,
}

/// Interface naming handed back to the runtime on join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    /// Name of the interface to move into the sandbox
    pub src_name: String,
    /// Prefix the runtime uses when renaming it inside the sandbox
    pub dst_prefix: String,
}

/// Gateway and interface information for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInfo {
    pub gateway: Ipv4Addr,
    #[serde(rename = "GatewayIPv6", default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv6: Option<Ipv6Addr>,
    pub interface_name: InterfaceName,
}

/// Scope of state sharing declared to the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Scope::Local),
            "global" => Ok(Scope::Global),
            other => Err(Error::InvalidConfig(format!("unknown scope {}", other))),
        }
    }
}

/// Capability negotiation response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub scope: Scope,
}

/// Snapshot of one registered network
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub id: String,
    pub config: NetworkConfig,
    pub endpoints: usize,
    pub link_live: bool,
}
