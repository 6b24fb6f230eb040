//! Resource manager façade
//!
//! The one object a protocol adapter talks to. It sequences registry
//! mutations, store writes and kernel calls so that a network's link is
//! provisioned with its first endpoint and torn down with its last.

use itertools::Itertools;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PolypConfig;
use crate::endpoint::NameTable;
use crate::error::Result;
use crate::link::{LinkOps, LinkProvisioner};
use crate::network::{Network, NetworkRegistry, NetworkState};
use crate::store::{
    decode_record, endpoints_prefix, valid_id, Store, ENDPOINTS_PREFIX, NETWORKS_PREFIX,
};
use crate::types::{
    Capabilities, Endpoint, EndpointInfo, InterfaceName, InterfaceRequest, NetworkConfig,
    NetworkSummary, Scope, CONTAINER_IFNAME_PREFIX,
};

pub struct ResourceManager {
    scope: Scope,
    networks: NetworkRegistry,
    provisioner: LinkProvisioner,
    store: Arc<dyn Store>,
}

impl ResourceManager {
    /// Build a manager and rebuild its state from `store`
    ///
    /// Fails with `UplinkNotFound` if `uplink` does not exist. Every
    /// recovered network with endpoints has its link reconciled.
    pub fn new(
        scope: Scope,
        uplink: &str,
        store: Arc<dyn Store>,
        ops: Arc<dyn LinkOps>,
    ) -> Result<Self> {
        let provisioner = LinkProvisioner::new(ops, uplink);
        provisioner.check_uplink()?;

        let manager = Self {
            scope,
            networks: NetworkRegistry::new(store.clone(), Arc::new(NameTable::new())),
            provisioner,
            store,
        };
        manager.recover()?;
        Ok(manager)
    }

    pub fn from_config(
        config: &PolypConfig,
        store: Arc<dyn Store>,
        ops: Arc<dyn LinkOps>,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(config.scope, &config.uplink, store, ops)
    }

    fn recover(&self) -> Result<()> {
        let mut known = HashSet::new();

        for pair in self.store.list(NETWORKS_PREFIX)? {
            let Some(id) = pair.key.strip_prefix(NETWORKS_PREFIX) else {
                continue;
            };
            if !valid_id(id) {
                warn!(key = %pair.key, "Skipping unexpected network record");
                continue;
            }

            let config: NetworkConfig = decode_record(&pair)?;
            let endpoints = self
                .store
                .list(&endpoints_prefix(id))?
                .iter()
                .map(decode_record::<Endpoint>)
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let network = self.networks.restore(id, config, endpoints)?;
            let mut state = network.lock()?;
            if !state.endpoints().is_empty() {
                self.provisioner.create_link(network.config())?;
                state.set_link_live(true);
            }
            info!(
                network = %id,
                endpoints = state.endpoints().len(),
                link_live = state.link_live(),
                "Recovered network"
            );
            known.insert(id.to_string());
        }

        for pair in self.store.list(ENDPOINTS_PREFIX)? {
            let network_id = pair
                .key
                .strip_prefix(ENDPOINTS_PREFIX)
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default();
            if !known.contains(network_id) {
                warn!(key = %pair.key, "Ignoring endpoint record of unknown network");
            }
        }

        Ok(())
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities { scope: self.scope }
    }

    pub fn create_network(&self, id: &str, config: NetworkConfig) -> Result<()> {
        debug!(network = %id, config = ?config, "CreateNetwork request");
        if config.enable_ipv6 {
            warn!(network = %id, "IPv6 forwarding is not supported, continuing with IPv4 only");
        }
        let result = self.networks.create(id, config).map(|_| ());
        respond("CreateNetwork", result)
    }

    pub fn delete_network(&self, id: &str) -> Result<()> {
        debug!(network = %id, "DeleteNetwork request");
        let result = self.networks.delete_with(id, |network, state| {
            // A veth failure on the first endpoint leaves the link behind
            if state.link_live() {
                self.provisioner.delete_link(network.config())?;
                state.set_link_live(false);
            }
            Ok(())
        });
        respond("DeleteNetwork", result)
    }

    /// Create an endpoint, provisioning the network's link if it is the first
    ///
    /// A link or veth failure removes the endpoint record again and returns
    /// the kernel error. If that removal fails too, the endpoint stays
    /// registered without a veth and `delete_endpoint` clears it.
    pub fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        request: &InterfaceRequest,
    ) -> Result<Endpoint> {
        debug!(
            network = %network_id,
            endpoint = %endpoint_id,
            request = ?request,
            "CreateEndpoint request"
        );
        let result = self.try_create_endpoint(network_id, endpoint_id, request);
        respond("CreateEndpoint", result)
    }

    fn try_create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        request: &InterfaceRequest,
    ) -> Result<Endpoint> {
        let network = self.networks.get(network_id)?;
        let mut state = network.lock()?;
        state.endpoints().vacant(endpoint_id)?;

        let first = state.endpoints().is_empty();
        let config = network.config();
        let endpoint = state.endpoints_mut().create(endpoint_id, request, config)?;

        if first {
            if let Err(e) = self.provisioner.create_link(config) {
                rollback_endpoint(&network, &mut state, endpoint_id);
                return Err(e);
            }
            state.set_link_live(true);
        }

        if let Err(e) = self.provisioner.create_veth(
            &endpoint.host_veth_name,
            &endpoint.container_interface_name,
            &config.bridge_name,
            config.mtu,
            endpoint.mac_address.as_deref(),
        ) {
            rollback_endpoint(&network, &mut state, endpoint_id);
            return Err(e);
        }

        Ok(endpoint)
    }

    pub fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        debug!(network = %network_id, endpoint = %endpoint_id, "DeleteEndpoint request");
        let result = self.try_delete_endpoint(network_id, endpoint_id);
        respond("DeleteEndpoint", result)
    }

    fn try_delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let network = self.networks.get(network_id)?;
        let mut state = network.lock()?;
        let host = state.endpoints().get(endpoint_id)?.host_veth_name.clone();

        self.provisioner.delete_veth(&host)?;
        state.endpoints_mut().delete(endpoint_id)?;

        if state.endpoints().is_empty() {
            self.provisioner.delete_link(network.config())?;
            state.set_link_live(false);
        }
        Ok(())
    }

    pub fn endpoint_info(&self, network_id: &str, endpoint_id: &str) -> Result<EndpointInfo> {
        debug!(network = %network_id, endpoint = %endpoint_id, "EndpointInfo request");
        let result = self.networks.get(network_id).and_then(|network| {
            let state = network.lock()?;
            let endpoint = state.endpoints().get(endpoint_id)?;
            let config = network.config();
            Ok(EndpointInfo {
                gateway: config.ipv4_gateway,
                gateway_ipv6: config.ipv6_gateway,
                interface_name: InterfaceName {
                    src_name: endpoint.container_interface_name.clone(),
                    dst_prefix: CONTAINER_IFNAME_PREFIX.to_string(),
                },
            })
        });
        respond("EndpointInfo", result)
    }

    /// Summary of one network
    pub fn network(&self, id: &str) -> Result<NetworkSummary> {
        let network = self.networks.get(id)?;
        let state = network.lock()?;
        Ok(summarize(&network, &state))
    }

    /// Summaries of every network, ordered by id
    pub fn networks(&self) -> Vec<NetworkSummary> {
        self.networks
            .list()
            .iter()
            .filter_map(|network| {
                let state = network.lock().ok()?;
                Some(summarize(network, &state))
            })
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }
}

fn summarize(network: &Network, state: &NetworkState) -> NetworkSummary {
    NetworkSummary {
        id: network.id().to_string(),
        config: network.config().clone(),
        endpoints: state.endpoints().len(),
        link_live: state.link_live(),
    }
}

fn rollback_endpoint(network: &Network, state: &mut NetworkState, endpoint_id: &str) {
    if let Err(e) = state.endpoints_mut().delete(endpoint_id) {
        warn!(
            network = %network.id(),
            endpoint = %endpoint_id,
            error = %e,
            "Failed to roll back endpoint record, keeping it for DeleteEndpoint"
        );
    }
}

fn respond<T: Debug>(operation: &str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(response) => debug!(operation, response = ?response, "Request succeeded"),
        Err(e) => debug!(operation, error = %e, "Request failed"),
    }
    result
}
