//! The network driver state machine.
//!
//! A [`Driver`] manages exactly one container network. All state lives behind a single lock,
//! which is never held while talking to the host or to the routing backend.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

use ipnet::Ipv4Net;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, Mode},
    endpoint::{link_name, Endpoint, EndpointState, MacAddr},
    host::{HostNetwork, HostRoute},
    ipam::{IpAllocator, IpamError},
    routing::RoutingBackend,
    subnet::Subnet,
};

/// Interface prefix the container side of a link is renamed to.
pub const DST_PREFIX: &str = "eth";

/// Route type of a route which is directly reachable over the container interface.
pub const ROUTE_TYPE_CONNECTED: u8 = 1;

/// Errors reported back to the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("You get just one network, and you already made {0}")]
    NetworkExists(String),
    #[error("Network {0} not found")]
    NetworkNotFound(String),
    #[error("No such network {0}")]
    NoSuchNetwork(String),
    #[error("Endpoint {0} already exists")]
    EndpointExists(String),
    #[error(transparent)]
    Allocation(#[from] IpamError),
}

/// Address assigned to a new endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInterface {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mac: MacAddr,
}

/// Static route pushed into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub destination: Subnet,
    pub route_type: u8,
    pub next_hop: Option<Ipv4Addr>,
}

/// How the container should configure the endpoint link when joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    /// Name of the link on the host.
    pub src_name: String,
    pub dst_prefix: &'static str,
    pub gateway: Option<Ipv4Addr>,
    pub static_routes: Vec<StaticRoute>,
}

struct Network {
    id: String,
    ipam: IpAllocator,
    endpoints: HashMap<String, Endpoint>,
}

/// The driver behind the remote driver protocol.
pub struct Driver {
    config: Arc<Config>,
    host: Arc<dyn HostNetwork>,
    routing: Option<Arc<dyn RoutingBackend>>,
    version: String,
    network: Mutex<Option<Network>>,
}

impl Driver {
    pub fn new(
        config: Arc<Config>,
        host: Arc<dyn HostNetwork>,
        routing: Option<Arc<dyn RoutingBackend>>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            config,
            host,
            routing,
            version: version.into(),
            network: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Plain text status line.
    pub fn status(&self) -> String {
        format!("ipvlan plugin {}\n", self.version)
    }

    /// Id of the active network, if any.
    pub fn network(&self) -> Option<String> {
        self.network.lock().unwrap().as_ref().map(|n| n.id.clone())
    }

    /// Endpoints of the active network, sorted by id.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let network = self.network.lock().unwrap();
        let mut endpoints = network
            .as_ref()
            .map(|n| n.endpoints.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }

    /// Create the network.
    ///
    /// NAT and route setup are best effort, failures are logged but the network is created
    /// anyway.
    pub async fn create_network(&self, id: &str) -> Result<(), DriverError> {
        let subnet = self.config.subnet;
        {
            let mut network = self.network.lock().unwrap();
            if let Some(existing) = network.as_ref() {
                return Err(DriverError::NetworkExists(existing.id.clone()));
            }

            let mut ipam = IpAllocator::new(subnet);
            let reserved = self
                .config
                .gateway
                .filter(|gw| subnet.contains_ip(*gw))
                .unwrap_or_else(|| subnet.first_host());
            ipam.request_specific(reserved)?;
            debug!(%reserved, "Reserved gateway address");

            *network = Some(Network {
                id: id.to_string(),
                ipam,
                endpoints: HashMap::new(),
            });
        }
        info!(network = id, %subnet, mode = %self.config.mode, "Created network");

        if let Err(e) = self.host.ensure_masquerade(subnet).await {
            error!(err=%e, %subnet, "Failed to set up masquerading");
        }

        if self.config.mode == Mode::L3Routing {
            let route = HostRoute::subnet(subnet, &self.config.host_interface);
            match self.host.add_route(&route).await {
                Ok(()) => debug!(%route, "Added subnet route"),
                Err(e) => error!(err=%e, %route, "Failed to add subnet route"),
            }

            match &self.routing {
                Some(routing) => {
                    if let Err(e) = routing.advertize_new_route(subnet) {
                        error!(err=%e, %subnet, "Failed to advertise container subnet");
                    }
                }
                None => warn!(%subnet, "No routing backend, container subnet is not advertised"),
            }
        }

        Ok(())
    }

    /// Forget the network. Side effects of creating it are left in place.
    pub fn delete_network(&self, id: &str) -> Result<(), DriverError> {
        let mut network = self.network.lock().unwrap();
        match network.as_ref() {
            Some(active) if active.id == id => {
                if !active.endpoints.is_empty() {
                    warn!(
                        network = id,
                        endpoints = active.endpoints.len(),
                        "Deleting network with endpoints left"
                    );
                }
                *network = None;
                info!(network = id, "Deleted network");
                Ok(())
            }
            _ => Err(DriverError::NetworkNotFound(id.to_string())),
        }
    }

    /// Assign an address to a new endpoint. A `requested` address is reserved instead of
    /// allocating the next free one.
    pub fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        requested: Option<Ipv4Addr>,
    ) -> Result<EndpointInterface, DriverError> {
        let mut network = self.network.lock().unwrap();
        let network = match network.as_mut() {
            Some(network) if network.id == network_id => network,
            _ => return Err(DriverError::NoSuchNetwork(network_id.to_string())),
        };
        if network.endpoints.contains_key(endpoint_id) {
            return Err(DriverError::EndpointExists(endpoint_id.to_string()));
        }

        let address = match requested {
            Some(ip) => network.ipam.request_specific(ip)?,
            None => network.ipam.request()?,
        };
        let endpoint = Endpoint::new(endpoint_id.to_string(), address);
        info!(endpoint = endpoint_id, %address, mac = %endpoint.mac, "Allocated endpoint");

        let interface = EndpointInterface {
            address,
            prefix_len: network.ipam.subnet().prefix_len(),
            mac: endpoint.mac,
        };
        network.endpoints.insert(endpoint_id.to_string(), endpoint);
        Ok(interface)
    }

    /// Create the endpoint link and tell the container how to use it.
    pub async fn join(&self, endpoint_id: &str, sandbox_key: &str) -> JoinInfo {
        let name = link_name(endpoint_id);
        let mode = self.config.mode;
        debug!(endpoint = endpoint_id, sandbox = sandbox_key, "Joining endpoint");

        match self
            .host
            .create_ipvlan(
                &name,
                &self.config.host_interface,
                mode.ipvlan_mode(),
                self.config.mtu,
            )
            .await
        {
            Ok(()) => info!(endpoint = endpoint_id, link = %name, "Created endpoint link"),
            Err(e) => error!(err=%e, link = %name, "Failed to create endpoint link"),
        }
        self.set_endpoint_state(endpoint_id, EndpointState::Joined);

        let (gateway, static_routes) = match mode {
            Mode::L2 => (self.config.gateway, Vec::new()),
            Mode::L3 | Mode::L3Routing => (
                None,
                vec![StaticRoute {
                    destination: Subnet::from(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0)),
                    route_type: ROUTE_TYPE_CONNECTED,
                    next_hop: None,
                }],
            ),
        };

        JoinInfo {
            src_name: name,
            dst_prefix: DST_PREFIX,
            gateway,
            static_routes,
        }
    }

    /// Acknowledge a container leaving. The link is only removed when the endpoint is deleted.
    pub fn leave(&self, endpoint_id: &str) {
        self.set_endpoint_state(endpoint_id, EndpointState::Left);
        debug!(endpoint = endpoint_id, "Endpoint left");
    }

    /// Release the address of the endpoint and remove its link.
    pub async fn delete_endpoint(&self, endpoint_id: &str) {
        let released = {
            let mut network = self.network.lock().unwrap();
            match network.as_mut() {
                Some(network) => match network.endpoints.remove(endpoint_id) {
                    Some(endpoint) => network
                        .ipam
                        .release(endpoint.address)
                        .map(|_| Some(endpoint.address)),
                    None => {
                        warn!(endpoint = endpoint_id, "Deleting unknown endpoint");
                        Ok(None)
                    }
                },
                None => {
                    warn!(
                        endpoint = endpoint_id,
                        "No network, not releasing endpoint address"
                    );
                    Ok(None)
                }
            }
        };
        match released {
            Ok(Some(address)) => info!(endpoint = endpoint_id, %address, "Released address"),
            Ok(None) => {}
            Err(e) => error!(err=%e, endpoint = endpoint_id, "Failed to release address"),
        }

        let name = link_name(endpoint_id);
        match self.host.delete_link(&name).await {
            Ok(()) => debug!(link = %name, "Deleted endpoint link"),
            Err(e) => warn!(err=%e, link = %name, "Failed to delete endpoint link"),
        }
    }

    fn set_endpoint_state(&self, endpoint_id: &str, state: EndpointState) {
        let mut network = self.network.lock().unwrap();
        match network
            .as_mut()
            .and_then(|n| n.endpoints.get_mut(endpoint_id))
        {
            Some(endpoint) => endpoint.state = state,
            None => warn!(endpoint = endpoint_id, ?state, "Unknown endpoint"),
        }
    }
}
