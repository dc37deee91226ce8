//! In memory [`HostNetwork`] which records every mutating call.

use std::{collections::HashMap, net::Ipv4Addr, sync::Mutex};

use async_trait::async_trait;

use super::{HostError, HostNetwork, HostRoute, IpVlanMode, RouteOrigin};
use crate::subnet::Subnet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateIpvlan {
        name: String,
        parent: String,
        mode: IpVlanMode,
        mtu: u32,
    },
    DeleteLink(String),
    AddRoute(HostRoute),
    DelRoute(HostRoute),
    FlushBgpRoutes(String),
    EnsureMasquerade(Subnet),
}

pub struct FakeHost {
    links: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    routes: Mutex<Vec<HostRoute>>,
    calls: Mutex<Vec<HostCall>>,
    failing: bool,
}

impl FakeHost {
    /// A host with the given links, without addresses.
    pub fn new(links: &[&str]) -> Self {
        Self {
            links: Mutex::new(links.iter().map(|l| (l.to_string(), Vec::new())).collect()),
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing: false,
        }
    }

    /// Make every route and NAT operation fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Pretend a BGP route was left behind by a previous run.
    pub fn with_route(self, route: HostRoute) -> Self {
        self.routes.lock().unwrap().push(route);
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn routes(&self) -> Vec<HostRoute> {
        self.routes.lock().unwrap().clone()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.lock().unwrap().contains_key(name)
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_link(&self, name: &str) -> Result<(), HostError> {
        if self.has_link(name) {
            Ok(())
        } else {
            Err(HostError::LinkNotFound(name.to_string()))
        }
    }

    fn fail(&self) -> Result<(), HostError> {
        if self.failing {
            Err(HostError::Io(std::io::Error::other("operation failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn link_index(&self, name: &str) -> Result<u32, HostError> {
        let links = self.links.lock().unwrap();
        let mut names = links.keys().collect::<Vec<_>>();
        names.sort();
        names
            .iter()
            .position(|l| *l == name)
            .map(|pos| pos as u32 + 1)
            .ok_or_else(|| HostError::LinkNotFound(name.to_string()))
    }

    async fn link_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, HostError> {
        self.links
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::LinkNotFound(name.to_string()))
    }

    async fn create_ipvlan(
        &self,
        name: &str,
        parent: &str,
        mode: IpVlanMode,
        mtu: u32,
    ) -> Result<(), HostError> {
        self.record(HostCall::CreateIpvlan {
            name: name.to_string(),
            parent: parent.to_string(),
            mode,
            mtu,
        });
        self.check_link(parent)?;
        self.links
            .lock()
            .unwrap()
            .insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        self.record(HostCall::DeleteLink(name.to_string()));
        self.links
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HostError::LinkNotFound(name.to_string()))
    }

    async fn add_route(&self, route: &HostRoute) -> Result<(), HostError> {
        self.record(HostCall::AddRoute(route.clone()));
        self.fail()?;
        self.check_link(&route.link)?;
        let mut routes = self.routes.lock().unwrap();
        if !routes.contains(route) {
            routes.push(route.clone());
        }
        Ok(())
    }

    async fn del_route(&self, route: &HostRoute) -> Result<(), HostError> {
        self.record(HostCall::DelRoute(route.clone()));
        self.fail()?;
        let mut routes = self.routes.lock().unwrap();
        let before = routes.len();
        routes.retain(|r| r != route);
        if routes.len() == before {
            return Err(HostError::Io(std::io::Error::other("no such route")));
        }
        Ok(())
    }

    async fn flush_bgp_routes(&self, link: &str) -> Result<usize, HostError> {
        self.record(HostCall::FlushBgpRoutes(link.to_string()));
        self.check_link(link)?;
        let mut routes = self.routes.lock().unwrap();
        let before = routes.len();
        routes.retain(|r| !(r.origin == RouteOrigin::Bgp && r.link == link));
        Ok(before - routes.len())
    }

    async fn ensure_masquerade(&self, subnet: Subnet) -> Result<(), HostError> {
        self.record(HostCall::EnsureMasquerade(subnet));
        self.fail()
    }
}
