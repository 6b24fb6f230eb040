use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{LinkError, LinkInfo, LinkKind, LinkOps};

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    AddVlan,
    AddBridge,
    AddVeth,
    SetMaster,
    SetUp,
    AddAddress,
    Delete,
}

#[derive(Debug, Clone)]
struct MemLink {
    kind: LinkKind,
    mtu: u32,
    master: Option<String>,
    up: bool,
    addresses: Vec<IpNetwork>,
    peer: Option<String>,
    mac: Option<String>,
}

impl MemLink {
    fn new(kind: LinkKind, mtu: u32) -> Self {
        Self {
            kind,
            mtu,
            master: None,
            up: false,
            addresses: Vec::new(),
            peer: None,
            mac: None,
        }
    }
}

#[derive(Debug, Default)]
struct Kernel {
    links: BTreeMap<String, MemLink>,
    creations: HashMap<String, usize>,
    failures: Vec<(LinkOp, String)>,
}

impl Kernel {
    fn check_failure(&mut self, op: LinkOp, name: &str) -> Result<(), LinkError> {
        if let Some(idx) = self
            .failures
            .iter()
            .position(|(o, n)| *o == op && n == name)
        {
            self.failures.remove(idx);
            return Err(LinkError::Failed {
                command: format!("{:?} {}", op, name),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_absent(&self, name: &str) -> Result<(), LinkError> {
        if self.links.contains_key(name) {
            return Err(LinkError::Failed {
                command: format!("link add {}", name),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        Ok(())
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut MemLink, LinkError> {
        self.links
            .get_mut(name)
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    fn insert(&mut self, name: &str, link: MemLink) {
        self.links.insert(name.to_string(), link);
        *self.creations.entry(name.to_string()).or_default() += 1;
    }
}

/// In-process model of the kernel link table
///
/// Mirrors the kernel behaviour the driver depends on: creating an existing
/// name fails with `File exists`, deleting one end of a veth removes both,
/// deleting a bridge releases its ports and deleting a parent removes its
/// VLAN sub-interfaces.
#[derive(Debug, Default)]
pub struct MemoryLinks {
    kernel: Mutex<Kernel>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A kernel that already has one physical uplink
    pub fn with_uplink(name: &str) -> Self {
        let links = Self::new();
        links.add_physical(name);
        links
    }

    /// Add a physical device, already up
    pub fn add_physical(&self, name: &str) {
        let mut link = MemLink::new(LinkKind::Other("device".to_string()), 1500);
        link.up = true;
        self.kernel.lock().insert(name, link);
    }

    /// Make the next `op` on `name` fail with a kernel error
    pub fn fail_on(&self, op: LinkOp, name: &str) {
        self.kernel.lock().failures.push((op, name.to_string()));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.kernel.lock().links.contains_key(name)
    }

    /// Every link name currently present, ordered
    pub fn names(&self) -> Vec<String> {
        self.kernel.lock().links.keys().cloned().collect()
    }

    /// How many times a link with this name has been created
    pub fn creations(&self, name: &str) -> usize {
        self.kernel.lock().creations.get(name).copied().unwrap_or(0)
    }

    /// Number of links of the given kind
    pub fn count(&self, kind: &LinkKind) -> usize {
        self.kernel
            .lock()
            .links
            .values()
            .filter(|l| match (&l.kind, kind) {
                (LinkKind::Vlan { .. }, LinkKind::Vlan { .. }) => true,
                (a, b) => a == b,
            })
            .count()
    }

    /// MAC address assigned to a link at creation
    pub fn mac(&self, name: &str) -> Option<String> {
        self.kernel.lock().links.get(name).and_then(|l| l.mac.clone())
    }
}

impl LinkOps for MemoryLinks {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, LinkError> {
        let kernel = self.kernel.lock();
        Ok(kernel.links.get(name).map(|l| LinkInfo {
            name: name.to_string(),
            kind: l.kind.clone(),
            mtu: l.mtu,
            master: l.master.clone(),
            up: l.up,
        }))
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpNetwork>, LinkError> {
        let kernel = self.kernel.lock();
        kernel
            .links
            .get(name)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, LinkError> {
        let kernel = self.kernel.lock();
        if !kernel.links.contains_key(bridge) {
            return Err(LinkError::NotFound(bridge.to_string()));
        }
        Ok(kernel
            .links
            .iter()
            .filter(|(_, l)| l.master.as_deref() == Some(bridge))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn add_vlan(&self, parent: &str, name: &str, vlan: u16, mtu: u32) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::AddVlan, name)?;
        if !kernel.links.contains_key(parent) {
            return Err(LinkError::NotFound(parent.to_string()));
        }
        kernel.ensure_absent(name)?;
        let kind = LinkKind::Vlan {
            parent: Some(parent.to_string()),
            id: vlan,
        };
        kernel.insert(name, MemLink::new(kind, mtu));
        Ok(())
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::AddBridge, name)?;
        kernel.ensure_absent(name)?;
        kernel.insert(name, MemLink::new(LinkKind::Bridge, mtu));
        Ok(())
    }

    fn add_veth(
        &self,
        host: &str,
        peer: &str,
        mtu: u32,
        peer_mac: Option<&str>,
    ) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::AddVeth, host)?;
        kernel.ensure_absent(host)?;
        kernel.ensure_absent(peer)?;

        let mut host_end = MemLink::new(LinkKind::Veth, mtu);
        host_end.peer = Some(peer.to_string());
        let mut peer_end = MemLink::new(LinkKind::Veth, mtu);
        peer_end.peer = Some(host.to_string());
        peer_end.mac = peer_mac.map(|m| m.to_string());

        kernel.insert(host, host_end);
        kernel.insert(peer, peer_end);
        Ok(())
    }

    fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::SetMaster, name)?;
        match kernel.links.get(bridge) {
            Some(l) if l.kind == LinkKind::Bridge => {}
            Some(_) => {
                return Err(LinkError::Failed {
                    command: format!("link set dev {} master {}", name, bridge),
                    stderr: "RTNETLINK answers: Operation not supported".to_string(),
                })
            }
            None => return Err(LinkError::NotFound(bridge.to_string())),
        }
        kernel.get_mut(name)?.master = Some(bridge.to_string());
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::SetUp, name)?;
        kernel.get_mut(name)?.up = true;
        Ok(())
    }

    fn add_address(&self, name: &str, address: IpNetwork) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::AddAddress, name)?;
        let link = kernel.get_mut(name)?;
        if !link.addresses.contains(&address) {
            link.addresses.push(address);
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), LinkError> {
        let mut kernel = self.kernel.lock();
        kernel.check_failure(LinkOp::Delete, name)?;
        let removed = kernel
            .links
            .remove(name)
            .ok_or_else(|| LinkError::NotFound(name.to_string()))?;

        if let Some(peer) = removed.peer {
            kernel.links.remove(&peer);
        }
        if removed.kind == LinkKind::Bridge {
            for link in kernel.links.values_mut() {
                if link.master.as_deref() == Some(name) {
                    link.master = None;
                }
            }
        }
        kernel.links.retain(|_, l| {
            !matches!(&l.kind, LinkKind::Vlan { parent: Some(p), .. } if p == name)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_create_fails() {
        let links = MemoryLinks::new();
        links.add_bridge("bran100", 1500).unwrap();
        assert!(matches!(
            links.add_bridge("bran100", 1500),
            Err(LinkError::Failed { stderr, .. }) if stderr.contains("File exists")
        ));
        assert_eq!(links.creations("bran100"), 1);
    }

    #[test]
    fn test_vlan_needs_parent() {
        let links = MemoryLinks::new();
        assert!(matches!(
            links.add_vlan("eth0", "vlan100", 100, 1500),
            Err(LinkError::NotFound(name)) if name == "eth0"
        ));

        links.add_physical("eth0");
        links.add_vlan("eth0", "vlan100", 100, 1500).unwrap();
        links.delete("eth0").unwrap();
        assert!(!links.exists("vlan100"));
    }

    #[test]
    fn test_veth_pair_lifetime() {
        let links = MemoryLinks::new();
        links
            .add_veth("veth0000001", "ceth0000001", 1500, Some("02:42:ac:11:00:02"))
            .unwrap();
        assert!(links.exists("ceth0000001"));
        assert_eq!(links.mac("ceth0000001").as_deref(), Some("02:42:ac:11:00:02"));

        links.delete("veth0000001").unwrap();
        assert!(!links.exists("ceth0000001"));
        assert!(links.names().is_empty());
    }

    #[test]
    fn test_bridge_ports() {
        let links = MemoryLinks::new();
        links.add_bridge("bran100", 1500).unwrap();
        links.add_veth("veth0000001", "ceth0000001", 1500, None).unwrap();
        links.set_master("veth0000001", "bran100").unwrap();
        assert_eq!(links.bridge_ports("bran100").unwrap(), vec!["veth0000001"]);

        links.delete("bran100").unwrap();
        assert_eq!(links.link("veth0000001").unwrap().unwrap().master, None);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let links = MemoryLinks::new();
        links.fail_on(LinkOp::AddBridge, "bran100");
        assert!(links.add_bridge("bran100", 1500).is_err());
        assert!(links.add_bridge("bran100", 1500).is_ok());
    }
}
