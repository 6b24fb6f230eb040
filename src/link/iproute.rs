use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;
use std::process::Command;
use tracing::debug;

use super::{LinkError, LinkInfo, LinkKind, LinkOps};

/// [`LinkOps`] backed by the iproute2 `ip` tool and its JSON output
#[derive(Debug, Clone)]
pub struct IpRoute {
    binary: String,
}

impl Default for IpRoute {
    fn default() -> Self {
        Self {
            binary: "ip".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    master: Option<String>,
    link: Option<String>,
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
    info_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: Option<String>,
    prefixlen: Option<u8>,
}

impl IpRoute {
    /// Use a specific `ip` binary instead of the one on `PATH`
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, LinkError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "Executing ip command");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|source| LinkError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(LinkError::Failed { command, stderr });
        }

        Ok(output.stdout)
    }

    /// Run a command that targets one named device, mapping a missing device to `NotFound`
    fn run_on(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, LinkError> {
        match self.run(args) {
            Err(LinkError::Failed { stderr, .. }) if is_missing_device(&stderr) => {
                Err(LinkError::NotFound(name.to_string()))
            }
            other => other,
        }
    }
}

fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

fn parse_json<T: for<'de> Deserialize<'de>>(
    command: &str,
    stdout: &[u8],
) -> Result<Vec<T>, LinkError> {
    if stdout.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(stdout).map_err(|source| LinkError::Parse {
        command: command.to_string(),
        source,
    })
}

fn to_link_info(link: IpLink) -> LinkInfo {
    let kind = match link.linkinfo.as_ref().and_then(|i| i.info_kind.as_deref()) {
        Some("vlan") => {
            let id = link
                .linkinfo
                .as_ref()
                .and_then(|i| i.info_data.as_ref())
                .and_then(|d| d.get("id"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u16;
            LinkKind::Vlan {
                parent: link.link.clone(),
                id,
            }
        }
        Some("bridge") => LinkKind::Bridge,
        Some("veth") => LinkKind::Veth,
        Some(other) => LinkKind::Other(other.to_string()),
        None => LinkKind::Other("device".to_string()),
    };

    LinkInfo {
        up: link.flags.iter().any(|f| f == "UP"),
        name: link.ifname,
        kind,
        mtu: link.mtu,
        master: link.master,
    }
}

fn parse_links(command: &str, stdout: &[u8]) -> Result<Vec<LinkInfo>, LinkError> {
    Ok(parse_json::<IpLink>(command, stdout)?
        .into_iter()
        .map(to_link_info)
        .collect())
}

fn parse_addresses(command: &str, stdout: &[u8]) -> Result<Vec<IpNetwork>, LinkError> {
    let entries = parse_json::<IpAddrEntry>(command, stdout)?;
    Ok(entries
        .into_iter()
        .flat_map(|e| e.addr_info)
        .filter_map(|info| {
            let addr: IpAddr = info.local?.parse().ok()?;
            IpNetwork::new(addr, info.prefixlen?).ok()
        })
        .collect())
}

impl LinkOps for IpRoute {
    fn link(&self, name: &str) -> Result<Option<LinkInfo>, LinkError> {
        let args = ["-j", "-d", "link", "show", "dev", name];
        match self.run_on(name, &args) {
            Ok(stdout) => Ok(parse_links(&args.join(" "), &stdout)?.into_iter().next()),
            Err(LinkError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpNetwork>, LinkError> {
        let args = ["-j", "addr", "show", "dev", name];
        let stdout = self.run_on(name, &args)?;
        parse_addresses(&args.join(" "), &stdout)
    }

    fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, LinkError> {
        let args = ["-j", "link", "show", "master", bridge];
        let stdout = self.run_on(bridge, &args)?;
        Ok(parse_links(&args.join(" "), &stdout)?
            .into_iter()
            .map(|l| l.name)
            .collect())
    }

    fn add_vlan(&self, parent: &str, name: &str, vlan: u16, mtu: u32) -> Result<(), LinkError> {
        let vlan = vlan.to_string();
        let mtu = mtu.to_string();
        self.run_on(
            parent,
            &[
                "link", "add", "link", parent, "name", name, "mtu", mtu.as_str(), "type", "vlan",
                "id", vlan.as_str(),
            ],
        )?;
        Ok(())
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<(), LinkError> {
        let mtu = mtu.to_string();
        self.run(&["link", "add", "name", name, "mtu", mtu.as_str(), "type", "bridge"])?;
        Ok(())
    }

    fn add_veth(
        &self,
        host: &str,
        peer: &str,
        mtu: u32,
        peer_mac: Option<&str>,
    ) -> Result<(), LinkError> {
        let mtu = mtu.to_string();
        let mut args = vec![
            "link", "add", "name", host, "mtu", mtu.as_str(), "type", "veth", "peer", "name",
            peer, "mtu", mtu.as_str(),
        ];
        if let Some(mac) = peer_mac {
            args.extend(["address", mac]);
        }
        self.run(&args)?;
        Ok(())
    }

    fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError> {
        self.run_on(name, &["link", "set", "dev", name, "master", bridge])?;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<(), LinkError> {
        self.run_on(name, &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn add_address(&self, name: &str, address: IpNetwork) -> Result<(), LinkError> {
        let cidr = address.to_string();
        match self.run_on(name, &["addr", "add", cidr.as_str(), "dev", name]) {
            Err(LinkError::Failed { stderr, .. }) if stderr.contains("File exists") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn delete(&self, name: &str) -> Result<(), LinkError> {
        self.run_on(name, &["link", "delete", "dev", name])?;
        Ok(())
    }
}
