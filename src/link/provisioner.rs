use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{LinkError, LinkInfo, LinkKind, LinkOps};
use crate::error::{Error, Result};
use crate::types::NetworkConfig;

/// Builds and tears down the kernel topology of one network
///
/// A network's link is its VLAN sub-interface on the uplink, enslaved to
/// its bridge, with the gateway address on the bridge. Every operation here
/// is idempotent so a request-level retry never trips over leftovers.
#[derive(Clone)]
pub struct LinkProvisioner {
    ops: Arc<dyn LinkOps>,
    uplink: String,
}

impl LinkProvisioner {
    pub fn new(ops: Arc<dyn LinkOps>, uplink: &str) -> Self {
        Self {
            ops,
            uplink: uplink.to_string(),
        }
    }

    pub fn uplink(&self) -> &str {
        &self.uplink
    }

    /// Check that the physical uplink exists
    pub fn check_uplink(&self) -> Result<()> {
        match self.ops.link(&self.uplink) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::UplinkNotFound(self.uplink.clone())),
            Err(source) => Err(Error::LinkCreateFailed {
                name: self.uplink.clone(),
                source,
            }),
        }
    }

    /// Create the sub-interface and bridge for a network
    ///
    /// Existing interfaces with matching attributes are reused as they are.
    /// On failure, interfaces created by this call are removed again.
    pub fn create_link(&self, config: &NetworkConfig) -> Result<()> {
        let mut created = Vec::new();
        match self.ensure_link(config, &mut created) {
            Ok(()) => Ok(()),
            Err(source) => {
                self.rollback(&created);
                Err(Error::LinkCreateFailed {
                    name: config.bridge_name.clone(),
                    source,
                })
            }
        }
    }

    fn ensure_link(
        &self,
        config: &NetworkConfig,
        created: &mut Vec<String>,
    ) -> std::result::Result<(), LinkError> {
        if self.ops.link(&self.uplink)?.is_none() {
            return Err(LinkError::NotFound(self.uplink.clone()));
        }

        let bridge = match self.ops.link(&config.bridge_name)? {
            Some(info) if info.kind == LinkKind::Bridge => info,
            Some(info) => return Err(conflict(&info, "not a bridge")),
            None => {
                info!(bridge = %config.bridge_name, mtu = config.mtu, "Creating bridge");
                self.ops.add_bridge(&config.bridge_name, config.mtu)?;
                created.push(config.bridge_name.clone());
                self.existing(&config.bridge_name)?
            }
        };

        let link = match self.ops.link(&config.link_name)? {
            Some(info) => {
                self.check_vlan(&info, config)?;
                info
            }
            None => {
                info!(
                    link = %config.link_name,
                    uplink = %self.uplink,
                    vlan = config.vlan,
                    "Creating VLAN sub-interface"
                );
                self.ops
                    .add_vlan(&self.uplink, &config.link_name, config.vlan, config.mtu)?;
                created.push(config.link_name.clone());
                self.existing(&config.link_name)?
            }
        };

        if link.master.as_deref() != Some(config.bridge_name.as_str()) {
            self.ops.set_master(&config.link_name, &config.bridge_name)?;
        }
        if !link.up {
            self.ops.set_up(&config.link_name)?;
        }
        if !bridge.up {
            self.ops.set_up(&config.bridge_name)?;
        }

        let gateway = IpNetwork::V4(config.gateway_cidr());
        if !self.ops.addresses(&config.bridge_name)?.contains(&gateway) {
            debug!(bridge = %config.bridge_name, address = %gateway, "Assigning gateway");
            self.ops.add_address(&config.bridge_name, gateway)?;
        }

        Ok(())
    }

    fn check_vlan(
        &self,
        info: &LinkInfo,
        config: &NetworkConfig,
    ) -> std::result::Result<(), LinkError> {
        match &info.kind {
            LinkKind::Vlan { parent, id } => {
                if *id != config.vlan {
                    return Err(conflict(info, &format!("VLAN id {} != {}", id, config.vlan)));
                }
                if parent.as_deref().is_some_and(|p| p != self.uplink) {
                    return Err(conflict(info, "bound to a different uplink"));
                }
                if let Some(master) = &info.master {
                    if master != &config.bridge_name {
                        return Err(conflict(info, &format!("enslaved to {}", master)));
                    }
                }
                Ok(())
            }
            _ => Err(conflict(info, "not a VLAN sub-interface")),
        }
    }

    fn existing(&self, name: &str) -> std::result::Result<LinkInfo, LinkError> {
        self.ops
            .link(name)?
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    fn rollback(&self, created: &[String]) {
        for name in created.iter().rev() {
            if let Err(e) = self.ops.delete(name) {
                warn!(link = %name, error = %e, "Failed to roll back interface");
            }
        }
    }

    /// Remove the sub-interface and bridge of a network
    ///
    /// Refuses to remove a bridge that still carries ports other than the
    /// network's own sub-interface.
    pub fn delete_link(&self, config: &NetworkConfig) -> Result<()> {
        self.remove_link(config).map_err(|source| Error::LinkDeleteFailed {
            name: config.bridge_name.clone(),
            source,
        })
    }

    fn remove_link(&self, config: &NetworkConfig) -> std::result::Result<(), LinkError> {
        let bridge = self.ops.link(&config.bridge_name)?;
        if bridge.is_some() {
            let foreign: Vec<String> = self
                .ops
                .bridge_ports(&config.bridge_name)?
                .into_iter()
                .filter(|port| port != &config.link_name)
                .collect();
            if !foreign.is_empty() {
                return Err(LinkError::ForeignPorts {
                    name: config.bridge_name.clone(),
                    ports: foreign,
                });
            }
        }

        if let Some(info) = self.ops.link(&config.link_name)? {
            self.check_vlan(&info, config)?;
            info!(link = %config.link_name, "Deleting VLAN sub-interface");
            ignore_missing(self.ops.delete(&config.link_name))?;
        }

        if bridge.is_some() {
            info!(bridge = %config.bridge_name, "Deleting bridge");
            ignore_missing(self.ops.delete(&config.bridge_name))?;
        }

        Ok(())
    }

    /// Create a veth pair with the host side attached to `bridge` and up
    ///
    /// The container side is left down for the runtime to move into the sandbox.
    pub fn create_veth(
        &self,
        host: &str,
        container: &str,
        bridge: &str,
        mtu: u32,
        container_mac: Option<&str>,
    ) -> Result<()> {
        let wrap = |source| Error::VethCreateFailed {
            name: host.to_string(),
            source,
        };

        let fresh = match self.ops.link(host).map_err(wrap)? {
            Some(info) if info.kind == LinkKind::Veth => false,
            Some(info) => return Err(wrap(conflict(&info, "not a veth"))),
            None => {
                debug!(host = %host, container = %container, "Creating veth pair");
                self.ops
                    .add_veth(host, container, mtu, container_mac)
                    .map_err(wrap)?;
                true
            }
        };

        let attach = self
            .ops
            .set_master(host, bridge)
            .and_then(|_| self.ops.set_up(host));
        if let Err(source) = attach {
            if fresh {
                if let Err(e) = self.ops.delete(host) {
                    warn!(veth = %host, error = %e, "Failed to roll back veth");
                }
            }
            return Err(wrap(source));
        }

        Ok(())
    }

    /// Remove a veth pair by its host side; a missing pair is not an error
    pub fn delete_veth(&self, host: &str) -> Result<()> {
        debug!(host = %host, "Deleting veth pair");
        ignore_missing(self.ops.delete(host)).map_err(|source| Error::VethDeleteFailed {
            name: host.to_string(),
            source,
        })
    }
}

fn conflict(info: &LinkInfo, reason: &str) -> LinkError {
    LinkError::Conflict {
        name: info.name.clone(),
        reason: reason.to_string(),
    }
}

fn ignore_missing(
    result: std::result::Result<(), LinkError>,
) -> std::result::Result<(), LinkError> {
    match result {
        Err(LinkError::NotFound(_)) => Ok(()),
        other => other,
    }
}
