use std::collections::HashMap;

use polyp::options::IpamData;
use polyp::types::{Endpoint, NetworkConfig};
use polyp::NetworkOptions;

#[test]
fn test_network_config_from_options() -> Result<(), Box<dyn std::error::Error>> {
    let labels: HashMap<String, String> = [("vlan", "100")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = NetworkOptions::default().parse(
        &labels,
        &[IpamData::new("10.0.0.0/24", "10.0.0.1")],
        &[],
    )?;

    assert_eq!(config.link_name, "vlan100");
    assert_eq!(config.bridge_name, "bran100");
    assert_eq!(config.vlan, 100);
    assert_eq!(config.mtu, 1500);
    Ok(())
}

#[test]
fn test_network_record_roundtrip_from_json() -> Result<(), Box<dyn std::error::Error>> {
    let json = r#"{
        "linkName": "vlan100",
        "bridgeName": "bran100",
        "vlan": 100,
        "mtu": 1500,
        "ipv4Subnet": "10.0.0.0/24",
        "ipv4Gateway": "10.0.0.1",
        "ipv6Subnet": "fd00::/64",
        "ipv6Gateway": "fd00::1",
        "enableIPv6": true
    }"#;

    let config: NetworkConfig = serde_json::from_str(json)?;
    assert!(config.validate().is_ok());
    assert_eq!(config.ipv6_gateway.map(|g| g.to_string()).as_deref(), Some("fd00::1"));
    assert!(config.enable_ipv6);
    Ok(())
}

#[test]
fn test_endpoint_record_minimal() -> Result<(), Box<dyn std::error::Error>> {
    let json = r#"{"id":"ep1","hostVethName":"veth1234567",
        "containerInterfaceName":"ceth1234567"}"#;
    let endpoint: Endpoint = serde_json::from_str(json)?;

    assert_eq!(endpoint.id, "ep1");
    assert_eq!(endpoint.host_veth_name, "veth1234567");
    assert!(endpoint.mac_address.is_none());
    assert!(endpoint.address.is_none());
    Ok(())
}
