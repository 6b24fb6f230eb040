//! Per-network endpoint registry and veth naming

use itertools::Itertools;
use parking_lot::Mutex;
use ring::digest::{digest, SHA256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{endpoint_key, put_record, valid_id, Store};
use crate::types::{Endpoint, InterfaceRequest, NetworkConfig};

/// Prefix of the host side of a veth pair
pub const HOST_VETH_PREFIX: &str = "veth";

/// Prefix of the container side of a veth pair
pub const CONTAINER_VETH_PREFIX: &str = "ceth";

/// Hex characters of the endpoint digest kept in interface names
pub const VETH_SUFFIX_LEN: usize = 7;

/// Names tried per endpoint before giving up
pub const MAX_NAME_ATTEMPTS: u32 = 8;

/// Digest-derived suffix for an endpoint's veth names
///
/// Attempt 0 hashes the identifier alone, so the same endpoint always gets
/// the same names unless a collision forced a later attempt.
pub fn veth_suffix(endpoint_id: &str, attempt: u32) -> String {
    let input = if attempt == 0 {
        endpoint_id.to_string()
    } else {
        format!("{}#{}", endpoint_id, attempt)
    };
    let hash = digest(&SHA256, input.as_bytes());
    let hex = hash.as_ref().iter().map(|b| format!("{:02x}", b)).join("");
    hex[..VETH_SUFFIX_LEN].to_string()
}

/// Host-wide table of veth names in use
///
/// Veth names share the host namespace, so every network's registry
/// reserves through the same table. The lock is only held for the lookup.
#[derive(Debug, Default)]
pub struct NameTable {
    names: Mutex<HashSet<String>>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a name, returning false if it is already taken
    pub fn reserve(&self, name: &str) -> bool {
        self.names.lock().insert(name.to_string())
    }

    pub fn release(&self, name: &str) {
        self.names.lock().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

/// Endpoints of one network
///
/// Not internally synchronized: the owning network's lock guards it, which
/// keeps `len()` consistent with the set being mutated.
pub struct EndpointRegistry {
    network_id: String,
    endpoints: HashMap<String, Endpoint>,
    store: Arc<dyn Store>,
    names: Arc<NameTable>,
}

impl EndpointRegistry {
    pub fn new(network_id: &str, store: Arc<dyn Store>, names: Arc<NameTable>) -> Self {
        Self {
            network_id: network_id.to_string(),
            endpoints: HashMap::new(),
            store,
            names,
        }
    }

    /// Fail with `AlreadyExists` if `id` is registered
    pub fn vacant(&self, id: &str) -> Result<()> {
        if self.endpoints.contains_key(id) {
            return Err(Error::endpoint_exists(id));
        }
        Ok(())
    }

    /// Allocate veth names for a new endpoint, persist it and register it
    pub fn create(
        &mut self,
        id: &str,
        request: &InterfaceRequest,
        config: &NetworkConfig,
    ) -> Result<Endpoint> {
        if !valid_id(id) {
            return Err(Error::invalid(format!("invalid endpoint id {:?}", id)));
        }
        self.vacant(id)?;
        request.validate()?;
        if let Some(address) = request.address {
            if !config.ipv4_subnet.contains(address.ip()) {
                return Err(Error::invalid(format!(
                    "address {} is outside subnet {}",
                    address, config.ipv4_subnet
                )));
            }
        }

        let suffix = self.allocate(id)?;
        let endpoint = Endpoint {
            id: id.to_string(),
            host_veth_name: format!("{}{}", HOST_VETH_PREFIX, suffix),
            container_interface_name: format!("{}{}", CONTAINER_VETH_PREFIX, suffix),
            mac_address: request.mac_address.clone(),
            address: request.address,
            address_ipv6: request.address_ipv6,
        };

        self.endpoints.insert(id.to_string(), endpoint.clone());
        let key = endpoint_key(&self.network_id, id);
        if let Err(e) = put_record(self.store.as_ref(), &key, &endpoint) {
            self.endpoints.remove(id);
            self.names.release(&endpoint.host_veth_name);
            return Err(e.into());
        }

        debug!(
            network = %self.network_id,
            endpoint = %id,
            veth = %endpoint.host_veth_name,
            "Registered endpoint"
        );
        Ok(endpoint)
    }

    fn allocate(&self, id: &str) -> Result<String> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let suffix = veth_suffix(id, attempt);
            if self.names.reserve(&format!("{}{}", HOST_VETH_PREFIX, suffix)) {
                return Ok(suffix);
            }
            debug!(endpoint = %id, attempt, "veth name collision");
        }
        Err(Error::ResourceExhausted(format!(
            "no free veth name for endpoint {} after {} attempts",
            id, MAX_NAME_ATTEMPTS
        )))
    }

    /// Remove an endpoint record; the veth itself is torn down by the caller
    pub fn delete(&mut self, id: &str) -> Result<Endpoint> {
        let endpoint = self
            .endpoints
            .remove(id)
            .ok_or_else(|| Error::endpoint_not_found(id))?;

        let key = endpoint_key(&self.network_id, id);
        if let Err(e) = self.store.delete(&key) {
            self.endpoints.insert(id.to_string(), endpoint);
            return Err(e.into());
        }

        self.names.release(&endpoint.host_veth_name);
        debug!(network = %self.network_id, endpoint = %id, "Removed endpoint");
        Ok(endpoint)
    }

    pub fn get(&self, id: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(id)
            .ok_or_else(|| Error::endpoint_not_found(id))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Register an endpoint read back from the store without re-persisting it
    pub(crate) fn restore(&mut self, endpoint: Endpoint) {
        if !self.names.reserve(&endpoint.host_veth_name) {
            warn!(
                network = %self.network_id,
                endpoint = %endpoint.id,
                veth = %endpoint.host_veth_name,
                "Restored endpoint shares a veth name with another endpoint"
            );
        }
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::flaky::FlakyStore;
    use crate::store::MemoryStore;
    use crate::types::MAX_IFNAME_LEN;

    fn config() -> NetworkConfig {
        NetworkConfig::new(
            "vlan100",
            "bran100",
            100,
            "10.0.0.0/24".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        )
    }

    fn registry(store: Arc<dyn Store>) -> (EndpointRegistry, Arc<NameTable>) {
        let names = Arc::new(NameTable::new());
        (EndpointRegistry::new("net1", store, names.clone()), names)
    }

    #[test]
    fn test_veth_names_are_deterministic() {
        assert_eq!(veth_suffix("ep1", 0), veth_suffix("ep1", 0));
        assert_ne!(veth_suffix("ep1", 0), veth_suffix("ep1", 1));
        assert_ne!(veth_suffix("ep1", 0), veth_suffix("ep2", 0));
        assert_eq!(veth_suffix("ep1", 0).len(), VETH_SUFFIX_LEN);

        let long_id = "f".repeat(64);
        let name = format!("{}{}", HOST_VETH_PREFIX, veth_suffix(&long_id, 0));
        assert!(name.len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn test_create_persists_record() {
        let store = Arc::new(MemoryStore::new());
        let (mut endpoints, names) = registry(store.clone());

        let ep = endpoints
            .create("ep1", &InterfaceRequest::default(), &config())
            .unwrap();
        assert_eq!(ep.host_veth_name, format!("veth{}", veth_suffix("ep1", 0)));
        assert_eq!(ep.container_interface_name, format!("ceth{}", veth_suffix("ep1", 0)));
        assert!(names.contains(&ep.host_veth_name));
        assert!(store.get("endpoints/net1/ep1").unwrap().is_some());
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn test_duplicate_endpoint() {
        let (mut endpoints, _) = registry(Arc::new(MemoryStore::new()));
        endpoints
            .create("ep1", &InterfaceRequest::default(), &config())
            .unwrap();

        assert!(matches!(endpoints.vacant("ep1"), Err(Error::AlreadyExists { .. })));
        assert!(matches!(
            endpoints.create("ep1", &InterfaceRequest::default(), &config()),
            Err(Error::AlreadyExists { .. })
        ));
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn test_name_collision_retries() {
        let (mut endpoints, names) = registry(Arc::new(MemoryStore::new()));
        names.reserve(&format!("veth{}", veth_suffix("ep1", 0)));

        let ep = endpoints
            .create("ep1", &InterfaceRequest::default(), &config())
            .unwrap();
        assert_eq!(ep.host_veth_name, format!("veth{}", veth_suffix("ep1", 1)));
    }

    #[test]
    fn test_name_collision_exhausted() {
        let (mut endpoints, names) = registry(Arc::new(MemoryStore::new()));
        for attempt in 0..MAX_NAME_ATTEMPTS {
            names.reserve(&format!("veth{}", veth_suffix("ep1", attempt)));
        }

        assert!(matches!(
            endpoints.create("ep1", &InterfaceRequest::default(), &config()),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_store_failure_rolls_back_create() {
        let store = Arc::new(FlakyStore::default());
        let (mut endpoints, names) = registry(store.clone());
        store.set_down(true);

        assert!(matches!(
            endpoints.create("ep1", &InterfaceRequest::default(), &config()),
            Err(Error::StoreUnavailable(_))
        ));
        assert!(endpoints.is_empty());
        assert!(names.is_empty());
    }

    #[test]
    fn test_store_failure_rolls_back_delete() {
        let store = Arc::new(FlakyStore::default());
        let (mut endpoints, names) = registry(store.clone());
        endpoints
            .create("ep1", &InterfaceRequest::default(), &config())
            .unwrap();

        store.set_down(true);
        assert!(matches!(endpoints.delete("ep1"), Err(Error::StoreUnavailable(_))));
        assert!(endpoints.get("ep1").is_ok());
        assert_eq!(names.len(), 1);

        store.set_down(false);
        endpoints.delete("ep1").unwrap();
        assert!(names.is_empty());
        assert!(store.inner.is_empty());
    }

    #[test]
    fn test_create_rejects_reserved_ids() {
        let store = Arc::new(MemoryStore::new());
        let (mut endpoints, names) = registry(store.clone());
        for id in ["", "ep/1", ".ep1"] {
            assert!(matches!(
                endpoints.create(id, &InterfaceRequest::default(), &config()),
                Err(Error::InvalidConfig(_))
            ));
        }
        assert!(endpoints.is_empty());
        assert!(store.is_empty());
        assert!(names.is_empty());
    }

    #[test]
    fn test_delete_unknown() {
        let (mut endpoints, _) = registry(Arc::new(MemoryStore::new()));
        assert!(matches!(endpoints.delete("ep1"), Err(Error::NotFound { .. })));
        assert!(matches!(endpoints.get("ep1"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_request_address_must_be_in_subnet() {
        let (mut endpoints, _) = registry(Arc::new(MemoryStore::new()));
        let request = InterfaceRequest {
            address: Some("192.168.1.5/24".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            endpoints.create("ep1", &request, &config()),
            Err(Error::InvalidConfig(_))
        ));

        let request = InterfaceRequest {
            address: Some("10.0.0.5/24".parse().unwrap()),
            mac_address: Some("02:42:0a:00:00:05".to_string()),
            ..Default::default()
        };
        let ep = endpoints.create("ep1", &request, &config()).unwrap();
        assert_eq!(ep.mac_address.as_deref(), Some("02:42:0a:00:00:05"));
    }
}
