//! Routing backends exchange the container subnet of this host with other hosts.
//!
//! The driver only knows about the [`RoutingBackend`] trait. Implementations are looked up by
//! name in a [`Registry`].

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    bgp::{speaker::SpeakerError, BgpRouteManager},
    config::{Config, DEFAULT_ROUTING_MANAGER},
    host::HostNetwork,
    subnet::Subnet,
};

/// Errors returned by routing backends.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("routing backend is not running")]
    NotRunning,
    #[error("routing backend has already been started")]
    AlreadyStarted,
    #[error(transparent)]
    Speaker(#[from] SpeakerError),
    #[error("lost the connection to the routing speaker")]
    SpeakerGone,
    #[error("routing engine task stopped unexpectedly")]
    Crashed,
    #[error("router id must be an IPv4 address, got {0}")]
    InvalidRouterId(IpAddr),
    #[error("no routing backend named {0}")]
    UnknownBackend(String),
}

/// Handle to a running routing engine.
///
/// The engine is stopped when this handle is dropped.
pub struct Monitor {
    handle: JoinHandle<RoutingError>,
}

impl Monitor {
    pub fn new(handle: JoinHandle<RoutingError>) -> Self {
        Self { handle }
    }

    /// Wait for the engine to stop. An engine never stops without an error.
    pub async fn wait(mut self) -> RoutingError {
        match (&mut self.handle).await {
            Ok(err) => err,
            Err(_) => RoutingError::Crashed,
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A control plane which distributes container routes between hosts.
///
/// Apart from starting, all operations only queue work for the engine and return immediately.
#[async_trait]
pub trait RoutingBackend: Send + Sync {
    /// Connect to the control plane and start converging the host routing table.
    async fn start_monitoring(&self) -> Result<Monitor, RoutingError>;

    /// Announce a prefix reachable through this host.
    fn advertize_new_route(&self, prefix: Subnet) -> Result<(), RoutingError>;

    /// Stop announcing a prefix.
    fn withdraw_route(&self, prefix: Subnet) -> Result<(), RoutingError>;

    /// A host appeared. If `is_self` is set, this is the address of the local host.
    fn discover_new(&self, is_self: bool, address: IpAddr) -> Result<(), RoutingError>;

    /// A host disappeared.
    fn discover_delete(&self, is_self: bool, address: IpAddr) -> Result<(), RoutingError>;
}

/// Constructor of a [`RoutingBackend`].
pub type BackendConstructor = fn(Arc<Config>, Arc<dyn HostNetwork>) -> Arc<dyn RoutingBackend>;

/// Known routing backends, by name.
pub struct Registry {
    backends: HashMap<&'static str, BackendConstructor>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, constructor: BackendConstructor) {
        self.backends.insert(name, constructor);
    }

    /// Names of all registered backends, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = self.backends.keys().copied().collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Build the backend with the given name. Unknown names fall back to the default backend.
    pub fn build(
        &self,
        name: &str,
        config: Arc<Config>,
        host: Arc<dyn HostNetwork>,
    ) -> Result<Arc<dyn RoutingBackend>, RoutingError> {
        let constructor = match self.backends.get(name) {
            Some(constructor) => {
                info!(backend = name, "Selected routing manager");
                constructor
            }
            None => {
                warn!(
                    backend = name,
                    default = DEFAULT_ROUTING_MANAGER,
                    "Unknown routing manager, using default"
                );
                self.backends
                    .get(DEFAULT_ROUTING_MANAGER)
                    .ok_or_else(|| RoutingError::UnknownBackend(name.to_string()))?
            }
        };

        Ok(constructor(config, host))
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_ROUTING_MANAGER, BgpRouteManager::from_config);
        registry
    }
}
