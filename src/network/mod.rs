//! Network registry
//!
//! Two lock levels:
//! - the registry map lock, held only to check-and-insert or check-and-remove
//!   an identifier, never across store or kernel calls
//! - one lock per [`Network`], held for the whole of any structural change to
//!   that network, including its store writes and kernel calls
//!
//! The per-network lock may be taken before the map lock, never the reverse.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::endpoint::{EndpointRegistry, NameTable};
use crate::error::{Error, Result};
use crate::store::{network_key, put_record, valid_id, Store};
use crate::types::{Endpoint, NetworkConfig};

/// State guarded by a network's lock
pub struct NetworkState {
    endpoints: EndpointRegistry,
    provisioned: bool,
    removed: bool,
}

impl NetworkState {
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointRegistry {
        &mut self.endpoints
    }

    /// Whether the network's sub-interface and bridge are provisioned
    ///
    /// Equal to `!endpoints().is_empty()` whenever no operation on the
    /// network has failed half way.
    pub fn link_live(&self) -> bool {
        self.provisioned
    }

    pub(crate) fn set_link_live(&mut self, live: bool) {
        self.provisioned = live;
    }
}

/// A registered network
pub struct Network {
    id: String,
    config: NetworkConfig,
    state: Mutex<NetworkState>,
}

impl Network {
    fn new(id: &str, config: NetworkConfig, endpoints: EndpointRegistry) -> Self {
        Self {
            id: id.to_string(),
            config,
            state: Mutex::new(NetworkState {
                endpoints,
                provisioned: false,
                removed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Take the network's exclusive lock
    ///
    /// Fails with `NotFound` if the network was deleted while the caller
    /// was waiting for it.
    pub fn lock(&self) -> Result<MutexGuard<'_, NetworkState>> {
        let state = self.state.lock();
        if state.removed {
            return Err(Error::network_not_found(&self.id));
        }
        Ok(state)
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub fn link_live(&self) -> bool {
        self.state.lock().link_live()
    }
}

/// Map of network identifier to network
pub struct NetworkRegistry {
    networks: Mutex<HashMap<String, Arc<Network>>>,
    store: Arc<dyn Store>,
    names: Arc<NameTable>,
}

impl NetworkRegistry {
    pub fn new(store: Arc<dyn Store>, names: Arc<NameTable>) -> Self {
        Self {
            networks: Mutex::new(HashMap::new()),
            store,
            names,
        }
    }

    /// Validate, persist and register a network
    ///
    /// No kernel state is touched; the link is provisioned with the first endpoint.
    pub fn create(&self, id: &str, config: NetworkConfig) -> Result<Arc<Network>> {
        if !valid_id(id) {
            return Err(Error::invalid(format!("invalid network id {:?}", id)));
        }
        config.validate()?;

        let endpoints = EndpointRegistry::new(id, self.store.clone(), self.names.clone());
        let network = Arc::new(Network::new(id, config, endpoints));

        // Hold the new network's lock so nobody can use it before it is persisted
        let mut state = network.state.lock();
        {
            let mut networks = self.networks.lock();
            if networks.contains_key(id) {
                return Err(Error::network_exists(id));
            }
            networks.insert(id.to_string(), network.clone());
        }

        if let Err(e) = put_record(self.store.as_ref(), &network_key(id), &network.config) {
            state.removed = true;
            self.remove_entry(&network);
            return Err(e.into());
        }
        drop(state);

        debug!(network = %id, "Registered network");
        Ok(network)
    }

    /// Remove a network that has no endpoints
    pub fn delete(&self, id: &str) -> Result<()> {
        self.delete_with(id, |_, _| Ok(()))
    }

    /// Remove a network that has no endpoints, running `teardown` under the
    /// network's lock before its record is removed
    ///
    /// A failing `teardown` aborts the delete with nothing removed.
    pub fn delete_with<F>(&self, id: &str, teardown: F) -> Result<()>
    where
        F: FnOnce(&Network, &mut NetworkState) -> Result<()>,
    {
        let network = self.get(id)?;
        let mut state = network.lock()?;
        if !state.endpoints.is_empty() {
            return Err(Error::Busy(id.to_string()));
        }
        teardown(&*network, &mut *state)?;

        self.store.delete(&network_key(id))?;
        state.removed = true;
        self.remove_entry(&network);

        debug!(network = %id, "Removed network");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Network>> {
        self.networks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::network_not_found(id))
    }

    /// Snapshot of every registered network
    pub fn list(&self) -> Vec<Arc<Network>> {
        self.networks.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.networks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.lock().is_empty()
    }

    /// Register a network read back from the store without re-persisting it
    pub(crate) fn restore(
        &self,
        id: &str,
        config: NetworkConfig,
        endpoints: Vec<Endpoint>,
    ) -> Result<Arc<Network>> {
        let mut registry = EndpointRegistry::new(id, self.store.clone(), self.names.clone());
        for endpoint in endpoints {
            registry.restore(endpoint);
        }

        let network = Arc::new(Network::new(id, config, registry));
        let mut networks = self.networks.lock();
        if networks.contains_key(id) {
            return Err(Error::network_exists(id));
        }
        networks.insert(id.to_string(), network.clone());
        Ok(network)
    }

    fn remove_entry(&self, network: &Arc<Network>) {
        let mut networks = self.networks.lock();
        if networks
            .get(&network.id)
            .is_some_and(|current| Arc::ptr_eq(current, network))
        {
            networks.remove(&network.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::flaky::FlakyStore;
    use crate::store::MemoryStore;
    use crate::types::InterfaceRequest;

    fn config() -> NetworkConfig {
        NetworkConfig::new(
            "vlan100",
            "bran100",
            100,
            "10.0.0.0/24".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        )
    }

    fn registry() -> (Arc<MemoryStore>, NetworkRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = NetworkRegistry::new(store.clone(), Arc::new(NameTable::new()));
        (store, registry)
    }

    #[test]
    fn test_create_and_get() {
        let (store, networks) = registry();
        networks.create("net1", config()).unwrap();

        let network = networks.get("net1").unwrap();
        assert_eq!(network.id(), "net1");
        assert_eq!(network.config().vlan, 100);
        assert!(!network.link_live());
        assert!(store.get("networks/net1").unwrap().is_some());
    }

    #[test]
    fn test_create_duplicate() {
        let (_, networks) = registry();
        networks.create("net1", config()).unwrap();

        let mut other = config();
        other.vlan = 200;
        assert!(matches!(
            networks.create("net1", other),
            Err(Error::AlreadyExists { .. })
        ));
        assert_eq!(networks.get("net1").unwrap().config().vlan, 100);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let (store, networks) = registry();
        let mut bad = config();
        bad.vlan = 0;
        assert!(matches!(networks.create("net1", bad), Err(Error::InvalidConfig(_))));
        for id in ["", "net/1", ".net1"] {
            assert!(matches!(networks.create(id, config()), Err(Error::InvalidConfig(_))));
        }
        assert!(networks.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete() {
        let (store, networks) = registry();
        networks.create("net1", config()).unwrap();
        networks.delete("net1").unwrap();

        assert!(matches!(networks.get("net1"), Err(Error::NotFound { .. })));
        assert!(matches!(networks.delete("net1"), Err(Error::NotFound { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_busy() {
        let (_, networks) = registry();
        let network = networks.create("net1", config()).unwrap();
        network
            .lock()
            .unwrap()
            .endpoints_mut()
            .create("ep1", &InterfaceRequest::default(), network.config())
            .unwrap();

        assert!(matches!(networks.delete("net1"), Err(Error::Busy(_))));

        network.lock().unwrap().endpoints_mut().delete("ep1").unwrap();
        networks.delete("net1").unwrap();
    }

    #[test]
    fn test_failed_teardown_keeps_network() {
        let (store, networks) = registry();
        networks.create("net1", config()).unwrap();

        let result = networks.delete_with("net1", |_, _| Err(Error::Busy("net1".to_string())));
        assert!(result.is_err());
        assert!(networks.get("net1").unwrap().lock().is_ok());
        assert!(store.get("networks/net1").unwrap().is_some());
    }

    #[test]
    fn test_stale_handle_after_delete() {
        let (_, networks) = registry();
        let network = networks.create("net1", config()).unwrap();
        networks.delete("net1").unwrap();

        assert!(matches!(network.lock(), Err(Error::NotFound { .. })));

        // The id is free again and the new network is independent of the old handle
        networks.create("net1", config()).unwrap();
        assert!(network.lock().is_err());
        assert!(networks.get("net1").unwrap().lock().is_ok());
    }

    #[test]
    fn test_store_failure_rolls_back_create() {
        let store = Arc::new(FlakyStore::default());
        let networks = NetworkRegistry::new(store.clone(), Arc::new(NameTable::new()));

        store.set_down(true);
        assert!(matches!(
            networks.create("net1", config()),
            Err(Error::StoreUnavailable(_))
        ));
        assert!(networks.is_empty());
        assert!(matches!(networks.get("net1"), Err(Error::NotFound { .. })));

        store.set_down(false);
        assert!(store.inner.is_empty());
        let network = networks.create("net1", config()).unwrap();
        assert!(network.lock().is_ok());
        assert!(store.get("networks/net1").unwrap().is_some());
    }

    #[test]
    fn test_store_failure_keeps_network_on_delete() {
        let store = Arc::new(FlakyStore::default());
        let networks = NetworkRegistry::new(store.clone(), Arc::new(NameTable::new()));
        let network = networks.create("net1", config()).unwrap();

        store.set_down(true);
        assert!(matches!(networks.delete("net1"), Err(Error::StoreUnavailable(_))));
        assert!(networks.get("net1").unwrap().lock().is_ok());
        assert!(network.lock().is_ok());
        assert!(store.inner.get("networks/net1").unwrap().is_some());

        store.set_down(false);
        networks.delete("net1").unwrap();
        assert!(networks.is_empty());
        assert!(store.inner.is_empty());
    }
}
