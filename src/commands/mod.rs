use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::manager::ResourceManager;
use crate::options::{IpamData, NetworkOptions, LABEL_VLAN};
use crate::types::InterfaceRequest;

/// Operations exposed on the command line, one per manager operation
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Register a new network
    CreateNetwork {
        /// Network ID, a random UUID if omitted
        #[arg(long)]
        id: Option<String>,

        /// VLAN ID (1-4094)
        #[arg(long)]
        vlan: u16,

        /// IPv4 subnet (CIDR notation)
        #[arg(long)]
        subnet: String,

        /// IPv4 gateway, bare or in CIDR notation
        #[arg(long)]
        gateway: String,

        /// IPv6 subnet (CIDR notation)
        #[arg(long)]
        ipv6_subnet: Option<String>,

        /// IPv6 gateway
        #[arg(long, requires = "ipv6_subnet")]
        ipv6_gateway: Option<String>,

        /// Driver labels (key=value), e.g. bridge=br0 or mtu=9000
        #[arg(long, value_parser = parse_key_val)]
        label: Vec<(String, String)>,
    },

    /// Remove a network without endpoints
    DeleteNetwork {
        #[arg(long)]
        id: String,
    },

    /// Attach an endpoint to a network
    CreateEndpoint {
        #[arg(long)]
        network: String,

        /// Endpoint ID, a random UUID if omitted
        #[arg(long)]
        id: Option<String>,

        /// IPv4 address of the endpoint (CIDR notation)
        #[arg(long)]
        address: Option<String>,

        /// IPv6 address of the endpoint (CIDR notation)
        #[arg(long)]
        address_ipv6: Option<String>,

        /// MAC address for the container side
        #[arg(long)]
        mac_address: Option<String>,
    },

    /// Detach an endpoint
    DeleteEndpoint {
        #[arg(long)]
        network: String,

        #[arg(long)]
        id: String,
    },

    /// Show the gateway and interface names of an endpoint
    EndpointInfo {
        #[arg(long)]
        network: String,

        #[arg(long)]
        id: String,
    },

    /// List registered networks
    List,

    /// Show the scope declared to the orchestrator
    Capabilities,
}

pub fn parse_key_val(s: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        anyhow::bail!("Invalid key=value format: {}", s);
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Run one command against the manager, returning its JSON output
pub fn execute(
    manager: &ResourceManager,
    options: &NetworkOptions,
    command: Command,
) -> Result<Value> {
    match command {
        Command::CreateNetwork {
            id,
            vlan,
            subnet,
            gateway,
            ipv6_subnet,
            ipv6_gateway,
            label,
        } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut labels: HashMap<String, String> = label.into_iter().collect();
            labels.insert(LABEL_VLAN.to_string(), vlan.to_string());

            let ipv4 = [IpamData::new(&subnet, &gateway)];
            let ipv6: Vec<IpamData> = ipv6_subnet
                .map(|pool| IpamData::new(&pool, ipv6_gateway.as_deref().unwrap_or_default()))
                .into_iter()
                .collect();

            let config = options
                .parse(&labels, &ipv4, &ipv6)
                .context("Invalid network options")?;
            manager
                .create_network(&id, config)
                .with_context(|| format!("Failed to create network {}", id))?;
            info!(network = %id, vlan, "Created network");
            Ok(serde_json::to_value(manager.network(&id)?)?)
        }

        Command::DeleteNetwork { id } => {
            manager
                .delete_network(&id)
                .with_context(|| format!("Failed to delete network {}", id))?;
            info!(network = %id, "Deleted network");
            Ok(json!({ "id": id }))
        }

        Command::CreateEndpoint {
            network,
            id,
            address,
            address_ipv6,
            mac_address,
        } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let request = InterfaceRequest {
                address: address
                    .map(|a| {
                        a.parse::<Ipv4Network>()
                            .map_err(|e| anyhow!("Invalid address {}: {}", a, e))
                    })
                    .transpose()?,
                address_ipv6: address_ipv6
                    .map(|a| {
                        a.parse::<Ipv6Network>()
                            .map_err(|e| anyhow!("Invalid IPv6 address {}: {}", a, e))
                    })
                    .transpose()?,
                mac_address,
            };

            let endpoint = manager
                .create_endpoint(&network, &id, &request)
                .with_context(|| format!("Failed to create endpoint {} on {}", id, network))?;
            info!(
                network = %network,
                endpoint = %id,
                veth = %endpoint.host_veth_name,
                "Created endpoint"
            );
            Ok(json!({ "network": network, "endpoint": endpoint }))
        }

        Command::DeleteEndpoint { network, id } => {
            manager
                .delete_endpoint(&network, &id)
                .with_context(|| format!("Failed to delete endpoint {} on {}", id, network))?;
            info!(network = %network, endpoint = %id, "Deleted endpoint");
            Ok(json!({ "network": network, "id": id }))
        }

        Command::EndpointInfo { network, id } => {
            let info = manager
                .endpoint_info(&network, &id)
                .with_context(|| format!("Failed to get endpoint {} on {}", id, network))?;
            Ok(serde_json::to_value(info)?)
        }

        Command::List => Ok(serde_json::to_value(manager.networks())?),

        Command::Capabilities => Ok(serde_json::to_value(manager.capabilities())?),
    }
}
