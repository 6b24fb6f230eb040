use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::options::{NetworkOptions, DEFAULT_MTU};
use crate::types::{Scope, MAX_IFNAME_LEN};

pub const ENV_SCOPE: &str = "POLYP_SCOPE";
pub const ENV_UPLINK: &str = "POLYP_UPLINK";
pub const ENV_STATE_DIR: &str = "POLYP_STATE_DIR";
pub const ENV_MTU: &str = "POLYP_MTU";

/// Configuration for the polyp driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolypConfig {
    /// Scope declared to the orchestrator
    pub scope: Scope,
    /// Physical interface carrying the VLAN-tagged traffic
    pub uplink: String,
    /// Directory holding network and endpoint records
    pub state_dir: PathBuf,
    /// MTU for networks that don't set one
    pub default_mtu: u32,
}

impl Default for PolypConfig {
    fn default() -> Self {
        Self {
            scope: Scope::Local,
            uplink: "eth0".to_string(),
            state_dir: PathBuf::from("/var/lib/polyp"),
            default_mtu: DEFAULT_MTU,
        }
    }
}

impl PolypConfig {
    /// Read a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            Error::invalid(format!("failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::invalid(format!("failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Override fields from `POLYP_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(scope) = lookup(ENV_SCOPE) {
            self.scope = scope.parse()?;
        }
        if let Some(uplink) = lookup(ENV_UPLINK) {
            self.uplink = uplink;
        }
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(mtu) = lookup(ENV_MTU) {
            self.default_mtu = mtu
                .parse()
                .map_err(|_| Error::invalid(format!("{} is not a valid MTU: {}", ENV_MTU, mtu)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.uplink.is_empty() {
            return Err(Error::invalid("uplink interface name is required"));
        }
        if self.uplink.len() > MAX_IFNAME_LEN {
            return Err(Error::invalid(format!(
                "uplink {} is longer than {} characters",
                self.uplink, MAX_IFNAME_LEN
            )));
        }
        if !(68..=65535).contains(&self.default_mtu) {
            return Err(Error::invalid(format!("invalid MTU {}", self.default_mtu)));
        }
        Ok(())
    }

    /// Option parser seeded with this configuration's defaults
    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions::with_default_mtu(self.default_mtu)
    }
}
