//! Linux implementation of [`HostNetwork`], using rtnetlink.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::{
    packet_route::{
        address::AddressAttribute,
        link::{InfoData, InfoIpVlan, InfoKind, IpVlanMode as NlIpVlanMode},
        route::{RouteAttribute, RouteMessage, RouteProtocol, RouteScope as NlRouteScope},
    },
    Handle, LinkMessageBuilder, LinkUnspec, RouteMessageBuilder,
};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{iptables, HostError, HostNetwork, HostRoute, IpVlanMode, RouteOrigin, RouteScope};
use crate::subnet::Subnet;

const ENODEV: i32 = 19;
const EEXIST: i32 = 17;

/// Host networking backed by a netlink connection which lives as long as this value.
pub struct Netlink {
    handle: Handle,
    connection: JoinHandle<()>,
}

impl Netlink {
    /// Open a new netlink connection.
    ///
    /// # Panics
    ///
    /// This function will panic if called outside of the context of a tokio runtime.
    pub fn new() -> Result<Self, HostError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let connection = tokio::spawn(conn);

        Ok(Self { handle, connection })
    }

    fn route_message(route: &HostRoute, index: u32) -> RouteMessage {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(route.destination.network(), route.destination.prefix_len())
            .output_interface(index)
            .scope(match route.scope {
                RouteScope::Host => NlRouteScope::Host,
                RouteScope::Link => NlRouteScope::Link,
            })
            .protocol(match route.origin {
                RouteOrigin::Static => RouteProtocol::Static,
                RouteOrigin::Bgp => RouteProtocol::Bgp,
            });
        if let Some(gw) = route.gateway {
            builder = builder.gateway(gw);
        }
        builder.build()
    }
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl HostNetwork for Netlink {
    async fn link_index(&self, name: &str) -> Result<u32, HostError> {
        match self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
        {
            Ok(Some(link_message)) => Ok(link_message.header.index),
            Ok(None) => Err(HostError::LinkNotFound(name.to_string())),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -ENODEV => {
                Err(HostError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn link_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, HostError> {
        let index = self.link_index(name).await?;
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = addresses.try_next().await? {
            for attr in msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                    if !out.contains(&ip) {
                        out.push(ip);
                    }
                }
            }
        }

        Ok(out)
    }

    async fn create_ipvlan(
        &self,
        name: &str,
        parent: &str,
        mode: IpVlanMode,
        mtu: u32,
    ) -> Result<(), HostError> {
        let parent_index = self.link_index(parent).await?;
        let mode = match mode {
            IpVlanMode::L2 => NlIpVlanMode::L2,
            IpVlanMode::L3 => NlIpVlanMode::L3,
        };
        let message = LinkMessageBuilder::<LinkUnspec>::new_with_info_kind(InfoKind::IpVlan)
            .name(name.to_string())
            .link(parent_index)
            .set_info_data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)]))
            .mtu(mtu)
            .up()
            .build();

        self.handle.link().add(message).execute().await?;
        debug!(link = name, parent, mtu, "Created ipvlan link");
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        let index = self.link_index(name).await?;
        Ok(self.handle.link().del(index).execute().await?)
    }

    async fn add_route(&self, route: &HostRoute) -> Result<(), HostError> {
        let index = self.link_index(&route.link).await?;
        match self
            .handle
            .route()
            .add(Self::route_message(route, index))
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -EEXIST => {
                debug!(%route, "Route already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn del_route(&self, route: &HostRoute) -> Result<(), HostError> {
        let index = self.link_index(&route.link).await?;
        Ok(self
            .handle
            .route()
            .del(Self::route_message(route, index))
            .execute()
            .await?)
    }

    async fn flush_bgp_routes(&self, link: &str) -> Result<usize, HostError> {
        let index = self.link_index(link).await?;
        let mut routes = self
            .handle
            .route()
            .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
            .execute();

        let mut stale = Vec::new();
        while let Some(route) = routes.try_next().await? {
            let on_link = route.attributes.contains(&RouteAttribute::Oif(index));
            if on_link && route.header.protocol == RouteProtocol::Bgp {
                stale.push(route);
            }
        }

        let removed = stale.len();
        for route in stale {
            self.handle.route().del(route).execute().await?;
        }

        Ok(removed)
    }

    async fn ensure_masquerade(&self, subnet: Subnet) -> Result<(), HostError> {
        iptables::ensure_masquerade(subnet).await.map(|_| ())
    }
}
