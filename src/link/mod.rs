//! Kernel link topology
//!
//! [`LinkOps`] is the narrow kernel network-interface API the driver needs:
//! lookups, VLAN/bridge/veth creation, enslavement, addressing, up and delete.
//! [`IpRoute`] drives it through iproute2; [`MemoryLinks`] keeps an
//! in-process model of the same behaviour. [`LinkProvisioner`] builds the
//! per-network topology on top of either.

mod iproute;
mod memory;
mod provisioner;

pub use iproute::IpRoute;
pub use memory::{LinkOp, MemoryLinks};
pub use provisioner::LinkProvisioner;

use ipnetwork::IpNetwork;
use std::io;
use thiserror::Error;

/// Kernel-level failure
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to execute '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("failed to parse output of '{command}': {source}")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("interface {0} does not exist")]
    NotFound(String),

    #[error("interface {name} exists with conflicting attributes: {reason}")]
    Conflict { name: String, reason: String },

    #[error("bridge {name} has foreign ports attached: {}", .ports.join(", "))]
    ForeignPorts { name: String, ports: Vec<String> },
}

/// Link type as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Vlan { parent: Option<String>, id: u16 },
    Bridge,
    Veth,
    Other(String),
}

/// Attributes of one existing link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub kind: LinkKind,
    pub mtu: u32,
    /// Bridge this link is enslaved to
    pub master: Option<String>,
    pub up: bool,
}

/// Synchronous kernel link operations
///
/// None of these retry; errors are surfaced as-is.
pub trait LinkOps: Send + Sync {
    /// Look up a link by name
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, LinkError>;

    /// Addresses assigned to a link
    fn addresses(&self, name: &str) -> Result<Vec<IpNetwork>, LinkError>;

    /// Names of the links enslaved to a bridge
    fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, LinkError>;

    fn add_vlan(&self, parent: &str, name: &str, vlan: u16, mtu: u32) -> Result<(), LinkError>;

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), LinkError>;

    fn add_veth(
        &self,
        host: &str,
        peer: &str,
        mtu: u32,
        peer_mac: Option<&str>,
    ) -> Result<(), LinkError>;

    fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError>;

    fn set_up(&self, name: &str) -> Result<(), LinkError>;

    fn add_address(&self, name: &str, address: IpNetwork) -> Result<(), LinkError>;

    /// Delete a link; deleting one end of a veth removes the pair
    fn delete(&self, name: &str) -> Result<(), LinkError>;
}
