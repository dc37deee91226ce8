//! Route synchronization with a local BGP speaker.
//!
//! The [`BgpRouteManager`] subscribes to the best paths of the speaker and installs every path
//! learned from another host as a kernel route over the host interface. It also announces the
//! local container subnet, and manages the neighbors of the speaker.
//!
//! All calls to the speaker are made from a single event loop task. Requests from the driver are
//! queued on channels and applied in order.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::{
    select,
    sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    host::{HostNetwork, HostRoute},
    routing::{Monitor, RoutingBackend, RoutingError},
    subnet::Subnet,
};

use self::{
    gobgp::GobgpConnect,
    rib::RibLocal,
    speaker::{BestPathStream, Connect, PathUpdate, Speaker, SpeakerError},
};

pub mod attr;
pub mod gobgp;
pub mod rib;
pub mod speaker;

/// Amount of best path updates buffered between the stream reader and the event loop.
const BEST_PATH_BUFFER: usize = 256;

/// Neighbor and global configuration changes, applied by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerRequest {
    Global { router_id: Ipv4Addr },
    Add(IpAddr),
    Delete(IpAddr),
}

struct Queues {
    peers: UnboundedReceiver<PeerRequest>,
    paths: UnboundedReceiver<PathUpdate>,
}

/// BGP implementation of a [`RoutingBackend`].
pub struct BgpRouteManager {
    asn: u32,
    link: String,
    host: Arc<dyn HostNetwork>,
    connect: Box<dyn Connect>,
    peers_tx: UnboundedSender<PeerRequest>,
    paths_tx: UnboundedSender<PathUpdate>,
    queues: Mutex<Option<Queues>>,
    learned_routes: Arc<Mutex<Vec<RibLocal>>>,
}

impl BgpRouteManager {
    /// Create a new manager for the local AS `asn`, installing routes over `link`.
    pub fn new(
        asn: u32,
        link: String,
        host: Arc<dyn HostNetwork>,
        connect: Box<dyn Connect>,
    ) -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let (paths_tx, paths) = mpsc::unbounded_channel();

        Self {
            asn,
            link,
            host,
            connect,
            peers_tx,
            paths_tx,
            queues: Mutex::new(Some(Queues { peers, paths })),
            learned_routes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a manager talking to the gobgp speaker from the configuration.
    pub fn from_config(config: Arc<Config>, host: Arc<dyn HostNetwork>) -> Arc<dyn RoutingBackend> {
        Arc::new(Self::new(
            config.bgp.asn,
            config.host_interface.clone(),
            host,
            Box::new(GobgpConnect::new(
                config.bgp.speaker.clone(),
                config.bgp.connect_timeout,
            )),
        ))
    }

    /// Every route learned from the speaker so far, in the order it was learned.
    ///
    /// This is a log: a prefix which is learned multiple times appears multiple times, and
    /// withdrawn routes are not removed.
    pub fn learned_routes(&self) -> Vec<RibLocal> {
        self.learned_routes.lock().unwrap().clone()
    }

    fn queue_path(&self, path: PathUpdate) -> Result<(), RoutingError> {
        self.paths_tx
            .send(path)
            .map_err(|_| RoutingError::NotRunning)
    }

    fn queue_peer(&self, request: PeerRequest) -> Result<(), RoutingError> {
        self.peers_tx
            .send(request)
            .map_err(|_| RoutingError::NotRunning)
    }
}

#[async_trait]
impl RoutingBackend for BgpRouteManager {
    async fn start_monitoring(&self) -> Result<Monitor, RoutingError> {
        let queues = self
            .queues
            .lock()
            .unwrap()
            .take()
            .ok_or(RoutingError::AlreadyStarted)?;

        match self.host.flush_bgp_routes(&self.link).await {
            Ok(removed) => debug!(removed, link = %self.link, "Removed stale BGP routes"),
            Err(e) => warn!(err=%e, link = %self.link, "Failed to remove stale BGP routes"),
        }

        let mut speaker = self.connect.connect().await?;
        let best_paths = speaker.best_paths().await?;

        let (best_tx, best_rx) = mpsc::channel(BEST_PATH_BUFFER);
        let reader = tokio::spawn(forward_best_paths(best_paths, best_tx));

        let event_loop = EventLoop {
            asn: self.asn,
            link: self.link.clone(),
            host: self.host.clone(),
            speaker,
            learned_routes: self.learned_routes.clone(),
            neighbors: HashMap::new(),
            best_paths: best_rx,
            peers: queues.peers,
            paths: queues.paths,
            reader,
        };

        info!("Initialization complete, monitoring BGP for new routes");
        Ok(Monitor::new(tokio::spawn(event_loop.run())))
    }

    fn advertize_new_route(&self, prefix: Subnet) -> Result<(), RoutingError> {
        info!(%prefix, "Advertising container network into the BGP domain");
        self.queue_path(PathUpdate::local(prefix, false))
    }

    fn withdraw_route(&self, prefix: Subnet) -> Result<(), RoutingError> {
        info!(%prefix, "Withdrawing container network from the BGP domain");
        self.queue_path(PathUpdate::local(prefix, true))
    }

    fn discover_new(&self, is_self: bool, address: IpAddr) -> Result<(), RoutingError> {
        if is_self {
            match address {
                IpAddr::V4(router_id) => self.queue_peer(PeerRequest::Global { router_id }),
                IpAddr::V6(_) => Err(RoutingError::InvalidRouterId(address)),
            }
        } else {
            self.queue_peer(PeerRequest::Add(address))
        }
    }

    fn discover_delete(&self, is_self: bool, address: IpAddr) -> Result<(), RoutingError> {
        if is_self {
            debug!(%address, "Ignoring removal of the local host");
            Ok(())
        } else {
            self.queue_peer(PeerRequest::Delete(address))
        }
    }
}

/// Pump the best path stream into the event loop.
async fn forward_best_paths(
    mut best_paths: BestPathStream,
    tx: mpsc::Sender<Result<PathUpdate, SpeakerError>>,
) {
    while let Some(update) = best_paths.next().await {
        let failed = update.is_err();
        if tx.send(update).await.is_err() || failed {
            return;
        }
    }
}

struct EventLoop {
    asn: u32,
    link: String,
    host: Arc<dyn HostNetwork>,
    speaker: Box<dyn Speaker>,
    learned_routes: Arc<Mutex<Vec<RibLocal>>>,
    neighbors: HashMap<IpAddr, u32>,
    best_paths: Receiver<Result<PathUpdate, SpeakerError>>,
    peers: UnboundedReceiver<PeerRequest>,
    paths: UnboundedReceiver<PathUpdate>,
    reader: JoinHandle<()>,
}

impl EventLoop {
    async fn run(mut self) -> RoutingError {
        let err = loop {
            select! {
                update = self.best_paths.recv() => match update {
                    Some(Ok(path)) => self.handle_best_path(path).await,
                    Some(Err(e)) => {
                        error!(err=%e, "Best path stream failed");
                        break RoutingError::Speaker(e);
                    }
                    None => {
                        error!("Best path stream ended");
                        break RoutingError::SpeakerGone;
                    }
                },
                Some(request) = self.peers.recv() => self.handle_peer_request(request).await,
                Some(path) = self.paths.recv() => self.submit_path(path).await,
            }
        };

        self.reader.abort();
        err
    }

    async fn handle_best_path(&mut self, path: PathUpdate) {
        let rib = match RibLocal::decode(&path) {
            Ok(rib) => rib,
            Err(e) => {
                error!(err=%e, "Failed to decode best path");
                return;
            }
        };
        debug!(%rib, "Best path update");

        if rib.is_local {
            return;
        }

        let route = HostRoute::learned(rib.prefix, rib.next_hop, &self.link);
        if rib.is_withdraw {
            info!(prefix = %rib.prefix, "BGP withdrew prefix");
            if let Err(e) = self.host.del_route(&route).await {
                error!(err=%e, %route, "Failed to remove learned BGP route");
            }
            return;
        }

        {
            let mut learned = self.learned_routes.lock().unwrap();
            learned.push(rib.clone());
            info!(prefix = %rib.prefix, learned = learned.len(), "Learned BGP route");
            for (n, entry) in learned.iter().enumerate() {
                debug!("{} - {entry}", n + 1);
            }
        }

        if let Err(e) = self.host.add_route(&route).await {
            error!(err=%e, %route, "Failed to install learned BGP route");
        }
    }

    async fn handle_peer_request(&mut self, request: PeerRequest) {
        match request {
            PeerRequest::Global { router_id } => {
                match self.speaker.set_global(self.asn, router_id).await {
                    Ok(()) => debug!(asn = self.asn, %router_id, "Set BGP global config"),
                    Err(e) => error!(err=%e, "Failed to set BGP global config"),
                }
            }
            PeerRequest::Add(address) => {
                if self.neighbors.contains_key(&address) {
                    debug!(%address, "BGP neighbor already known");
                    return;
                }
                match self.speaker.add_neighbor(address, self.asn).await {
                    Ok(()) => {
                        info!(%address, asn = self.asn, "Added BGP neighbor");
                        self.neighbors.insert(address, self.asn);
                    }
                    Err(e) => error!(err=%e, %address, "Failed to add BGP neighbor"),
                }
            }
            PeerRequest::Delete(address) => {
                if self.neighbors.remove(&address).is_none() {
                    debug!(%address, "Ignoring removal of unknown BGP neighbor");
                    return;
                }
                match self.speaker.delete_neighbor(address).await {
                    Ok(()) => info!(%address, "Removed BGP neighbor"),
                    Err(e) => error!(err=%e, %address, "Failed to remove BGP neighbor"),
                }
            }
        }
    }

    async fn submit_path(&mut self, path: PathUpdate) {
        let withdraw = path.is_withdraw;
        match self.speaker.submit_path(path).await {
            Ok(()) => debug!(withdraw, "Submitted local path"),
            Err(e) => error!(err=%e, withdraw, "Failed to submit local path"),
        }
    }
}
