//! Network creation options
//!
//! Turns the orchestrator's string labels and IPAM data into a validated
//! [`NetworkConfig`] before the core ever sees it.

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::NetworkConfig;

pub const LABEL_VLAN: &str = "vlan";
pub const LABEL_IFACE: &str = "iface";
pub const LABEL_BRIDGE: &str = "bridge";
pub const LABEL_MTU: &str = "mtu";
pub const LABEL_ENABLE_IPV6: &str = "enable_ipv6";

pub const DEFAULT_MTU: u32 = 1500;

/// One IPAM pool handed over by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamData {
    #[serde(default)]
    pub address_space: String,
    /// Subnet in CIDR notation
    pub pool: String,
    /// Gateway, either a bare address or CIDR
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub aux_addresses: HashMap<String, String>,
}

impl IpamData {
    pub fn new(pool: &str, gateway: &str) -> Self {
        Self {
            pool: pool.to_string(),
            gateway: gateway.to_string(),
            ..Default::default()
        }
    }
}

/// Parser for network creation requests
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    default_mtu: u32,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            default_mtu: DEFAULT_MTU,
        }
    }
}

impl NetworkOptions {
    /// Parser whose networks get `mtu` unless a label overrides it
    pub fn with_default_mtu(default_mtu: u32) -> Self {
        Self { default_mtu }
    }

    /// Build a validated configuration from labels and IPAM data
    ///
    /// The `vlan` label is required. Interface and bridge names default to
    /// `vlan<N>` and `bran<N>`. Exactly one IPv4 pool must be given and at
    /// most one IPv6 pool.
    pub fn parse(
        &self,
        labels: &HashMap<String, String>,
        ipv4_data: &[IpamData],
        ipv6_data: &[IpamData],
    ) -> Result<NetworkConfig> {
        let vlan = match non_empty(labels, LABEL_VLAN) {
            Some(vlan) => vlan
                .parse::<u16>()
                .ok()
                .filter(|v| (1..=4094).contains(v))
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "invalid VLAN ID {} (must be between 1 and 4094)",
                        vlan
                    ))
                })?,
            None => return Err(Error::invalid(format!("missing parameter {}", LABEL_VLAN))),
        };

        let link_name = non_empty(labels, LABEL_IFACE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("vlan{}", vlan));
        let bridge_name = non_empty(labels, LABEL_BRIDGE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("bran{}", vlan));

        let mtu = match non_empty(labels, LABEL_MTU) {
            Some(mtu) => mtu
                .parse::<u32>()
                .map_err(|_| Error::invalid(format!("could not parse mtu {}", mtu)))?,
            None => self.default_mtu,
        };

        let enable_ipv6 = match non_empty(labels, LABEL_ENABLE_IPV6) {
            Some(flag) => flag
                .parse::<bool>()
                .map_err(|_| Error::invalid(format!("could not parse enable_ipv6 {}", flag)))?,
            None => false,
        };
        if enable_ipv6 {
            warn!(vlan, "IPv6 requested but not supported, the network stays IPv4 only");
        }

        let (ipv4_subnet, ipv4_gateway) = match ipv4_data {
            [data] => parse_ipv4(data)?,
            [] => return Err(Error::invalid("IPv4 IPAM data is required")),
            _ => return Err(Error::invalid("only one IPv4 pool is supported")),
        };
        let (ipv6_subnet, ipv6_gateway) = match ipv6_data {
            [] => (None, None),
            [data] => {
                let (subnet, gateway) = parse_ipv6(data)?;
                (Some(subnet), gateway)
            }
            _ => return Err(Error::invalid("only one IPv6 pool is supported")),
        };

        let config = NetworkConfig {
            link_name,
            bridge_name,
            vlan,
            mtu,
            ipv4_subnet,
            ipv4_gateway,
            ipv6_subnet,
            ipv6_gateway,
            enable_ipv6,
        };
        config.validate()?;
        Ok(config)
    }
}

fn non_empty<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    labels
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_ipv4(data: &IpamData) -> Result<(Ipv4Network, Ipv4Addr)> {
    let pool: Ipv4Network = data
        .pool
        .parse()
        .map_err(|e| Error::invalid(format!("invalid IPv4 pool {}: {}", data.pool, e)))?;
    let subnet = Ipv4Network::new(pool.network(), pool.prefix())
        .map_err(|e| Error::invalid(format!("invalid IPv4 pool {}: {}", data.pool, e)))?;

    match parse_gateway(&data.gateway)? {
        Some(IpAddr::V4(gateway)) => Ok((subnet, gateway)),
        Some(IpAddr::V6(_)) => Err(Error::invalid(format!(
            "IPv4 pool {} has an IPv6 gateway {}",
            data.pool, data.gateway
        ))),
        None => Err(Error::invalid(format!("IPv4 pool {} has no gateway", data.pool))),
    }
}

fn parse_ipv6(data: &IpamData) -> Result<(Ipv6Network, Option<Ipv6Addr>)> {
    let pool: Ipv6Network = data
        .pool
        .parse()
        .map_err(|e| Error::invalid(format!("invalid IPv6 pool {}: {}", data.pool, e)))?;
    let subnet = Ipv6Network::new(pool.network(), pool.prefix())
        .map_err(|e| Error::invalid(format!("invalid IPv6 pool {}: {}", data.pool, e)))?;

    match parse_gateway(&data.gateway)? {
        Some(IpAddr::V6(gateway)) => Ok((subnet, Some(gateway))),
        Some(IpAddr::V4(_)) => Err(Error::invalid(format!(
            "IPv6 pool {} has an IPv4 gateway {}",
            data.pool, data.gateway
        ))),
        None => Ok((subnet, None)),
    }
}

/// Accepts `10.0.0.1` as well as `10.0.0.1/24`
fn parse_gateway(gateway: &str) -> Result<Option<IpAddr>> {
    let gateway = gateway.trim();
    if gateway.is_empty() {
        return Ok(None);
    }
    if let Ok(addr) = gateway.parse::<IpAddr>() {
        return Ok(Some(addr));
    }
    gateway
        .parse::<IpNetwork>()
        .map(|net| Some(net.ip()))
        .map_err(|e| Error::invalid(format!("invalid gateway {}: {}", gateway, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ipv4() -> Vec<IpamData> {
        vec![IpamData::new("10.0.0.0/24", "10.0.0.1/24")]
    }

    #[test]
    fn test_defaults_from_vlan() {
        let config = NetworkOptions::default()
            .parse(&labels(&[("vlan", "100")]), &ipv4(), &[])
            .unwrap();
        assert_eq!(config.vlan, 100);
        assert_eq!(config.link_name, "vlan100");
        assert_eq!(config.bridge_name, "bran100");
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.ipv4_subnet.to_string(), "10.0.0.0/24");
        assert_eq!(config.ipv4_gateway.to_string(), "10.0.0.1");
        assert!(!config.enable_ipv6);
    }

    #[test]
    fn test_explicit_labels() {
        let config = NetworkOptions::with_default_mtu(9000)
            .parse(
                &labels(&[("vlan", "42"), ("iface", "uplink42"), ("bridge", "br42")]),
                &[IpamData::new("192.168.42.0/24", "192.168.42.254")],
                &[],
            )
            .unwrap();
        assert_eq!(config.link_name, "uplink42");
        assert_eq!(config.bridge_name, "br42");
        assert_eq!(config.mtu, 9000);

        let config = NetworkOptions::default()
            .parse(&labels(&[("vlan", "42"), ("mtu", "1400")]), &ipv4(), &[])
            .unwrap();
        assert_eq!(config.mtu, 1400);
    }

    #[test]
    fn test_missing_vlan() {
        let err = NetworkOptions::default()
            .parse(&labels(&[("iface", "eth1")]), &ipv4(), &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: missing parameter vlan");
    }

    #[test]
    fn test_bad_vlan() {
        for vlan in ["abc", "0", "4095", "-1"] {
            assert!(matches!(
                NetworkOptions::default().parse(&labels(&[("vlan", vlan)]), &ipv4(), &[]),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_ipam_required() {
        let vlan = labels(&[("vlan", "100")]);
        assert!(NetworkOptions::default().parse(&vlan, &[], &[]).is_err());

        let two = vec![
            IpamData::new("10.0.0.0/24", "10.0.0.1"),
            IpamData::new("10.0.1.0/24", "10.0.1.1"),
        ];
        assert!(NetworkOptions::default().parse(&vlan, &two, &[]).is_err());

        let no_gateway = vec![IpamData::new("10.0.0.0/24", "")];
        assert!(NetworkOptions::default().parse(&vlan, &no_gateway, &[]).is_err());

        let outside = vec![IpamData::new("10.0.0.0/24", "10.9.0.1")];
        assert!(NetworkOptions::default().parse(&vlan, &outside, &[]).is_err());
    }

    #[test]
    fn test_ipv6_is_accepted() {
        let config = NetworkOptions::default()
            .parse(
                &labels(&[("vlan", "100"), ("enable_ipv6", "true")]),
                &ipv4(),
                &[IpamData::new("fd00:100::/64", "fd00:100::1/64")],
            )
            .unwrap();
        assert!(config.enable_ipv6);
        assert_eq!(config.ipv6_subnet.unwrap().to_string(), "fd00:100::/64");
        assert_eq!(config.ipv6_gateway.unwrap().to_string(), "fd00:100::1");
    }

    #[test]
    fn test_ipam_wire_format() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let data: IpamData = serde_json::from_str(
            r#"{"AddressSpace":"LocalDefault","Pool":"10.0.0.0/24",
                "Gateway":"10.0.0.1/24","AuxAddresses":{}}"#,
        )?;
        assert_eq!(data.pool, "10.0.0.0/24");
        assert_eq!(data.gateway, "10.0.0.1/24");
        Ok(())
    }
}
