//! [`Speaker`] implementation for gobgp, over its gRPC API.
//!
//! Only the handful of API messages and methods the route engine uses are declared here. The
//! layout matches the `gobgpapi` protobuf package.

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use async_trait::async_trait;
use futures::{future, stream, StreamExt, TryStreamExt};
use tonic::{
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
};
use tracing::debug;

use super::speaker::{BestPathStream, Connect, PathUpdate, Speaker, SpeakerError};

/// Address family identifier of IPv4 unicast, AFI 1 and SAFI 1.
pub const RF_IPV4_UC: u32 = 1 << 16 | 1;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum Resource {
    Global = 0,
    Local = 1,
    AdjIn = 2,
    AdjOut = 3,
    Vrf = 4,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum Operation {
    Add = 0,
    Del = 1,
    DelAll = 2,
    Replace = 3,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Fail = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Arguments {
    #[prost(enumeration = "Resource", tag = "1")]
    pub resource: i32,
    #[prost(uint32, tag = "2")]
    pub rf: u32,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Path {
    #[prost(bytes = "bytes", tag = "1")]
    pub nlri: ::bytes::Bytes,
    #[prost(bytes = "bytes", repeated, tag = "2")]
    pub pattrs: Vec<::bytes::Bytes>,
    #[prost(int64, tag = "3")]
    pub age: i64,
    #[prost(bool, tag = "4")]
    pub best: bool,
    #[prost(bool, tag = "5")]
    pub is_withdraw: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Destination {
    #[prost(string, tag = "1")]
    pub prefix: String,
    #[prost(message, repeated, tag = "2")]
    pub paths: Vec<Path>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModPathArguments {
    #[prost(enumeration = "Resource", tag = "1")]
    pub resource: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub paths: Vec<Path>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub msg: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerConf {
    #[prost(string, tag = "1")]
    pub auth_password: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(uint32, tag = "3")]
    pub local_as: u32,
    #[prost(string, tag = "4")]
    pub neighbor_address: String,
    #[prost(uint32, tag = "5")]
    pub peer_as: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(uint32, repeated, tag = "1")]
    pub families: Vec<u32>,
    #[prost(message, optional, tag = "3")]
    pub conf: Option<PeerConf>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModNeighborArguments {
    #[prost(enumeration = "Operation", tag = "1")]
    pub operation: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Global {
    #[prost(uint32, tag = "1")]
    pub asn: u32,
    #[prost(string, tag = "2")]
    pub router_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModGlobalConfigArguments {
    #[prost(enumeration = "Operation", tag = "1")]
    pub operation: i32,
    #[prost(message, optional, tag = "2")]
    pub global: Option<Global>,
}

impl From<Path> for PathUpdate {
    fn from(path: Path) -> Self {
        PathUpdate {
            nlri: path.nlri,
            attributes: path.pattrs,
            is_withdraw: path.is_withdraw,
            best: path.best,
        }
    }
}

impl From<PathUpdate> for Path {
    fn from(path: PathUpdate) -> Self {
        Path {
            nlri: path.nlri,
            pattrs: path.attributes,
            age: 0,
            best: path.best,
            is_withdraw: path.is_withdraw,
        }
    }
}

/// Raw client for the `gobgpapi.GobgpApi` service.
#[derive(Debug, Clone)]
pub struct GobgpApiClient {
    inner: tonic::client::Grpc<Channel>,
}

impl GobgpApiClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {e}"))
            })
    }

    pub async fn get_rib(
        &mut self,
        request: Arguments,
    ) -> Result<tonic::Streaming<Destination>, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static("/gobgpapi.GobgpApi/GetRib");
        Ok(self
            .inner
            .server_streaming(tonic::Request::new(request), path, ProstCodec::default())
            .await?
            .into_inner())
    }

    pub async fn monitor_best_changed(
        &mut self,
        request: Arguments,
    ) -> Result<tonic::Streaming<Destination>, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static("/gobgpapi.GobgpApi/MonitorBestChanged");
        Ok(self
            .inner
            .server_streaming(tonic::Request::new(request), path, ProstCodec::default())
            .await?
            .into_inner())
    }

    pub async fn mod_path(&mut self, request: ModPathArguments) -> Result<Error, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static("/gobgpapi.GobgpApi/ModPath");
        Ok(self
            .inner
            .client_streaming(
                tonic::Request::new(stream::iter(vec![request])),
                path,
                ProstCodec::default(),
            )
            .await?
            .into_inner())
    }

    pub async fn mod_neighbor(
        &mut self,
        request: ModNeighborArguments,
    ) -> Result<Error, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static("/gobgpapi.GobgpApi/ModNeighbor");
        Ok(self
            .inner
            .unary(tonic::Request::new(request), path, ProstCodec::default())
            .await?
            .into_inner())
    }

    pub async fn mod_global_config(
        &mut self,
        request: ModGlobalConfigArguments,
    ) -> Result<Error, tonic::Status> {
        self.ready().await?;
        let path = PathAndQuery::from_static("/gobgpapi.GobgpApi/ModGlobalConfig");
        Ok(self
            .inner
            .unary(tonic::Request::new(request), path, ProstCodec::default())
            .await?
            .into_inner())
    }
}

fn check(res: Error) -> Result<(), SpeakerError> {
    if res.code == ErrorCode::Success as i32 {
        Ok(())
    } else {
        Err(SpeakerError::Rejected {
            code: res.code,
            msg: res.msg,
        })
    }
}

fn rib_arguments() -> Arguments {
    Arguments {
        resource: Resource::Global as i32,
        rf: RF_IPV4_UC,
        name: String::new(),
    }
}

/// The first path of a changed destination, which is the new best path.
fn first_path(dst: Destination) -> Option<PathUpdate> {
    dst.paths.into_iter().next().map(PathUpdate::from)
}

/// A connected gobgp speaker.
pub struct GobgpSpeaker {
    client: GobgpApiClient,
}

impl GobgpSpeaker {
    pub fn new(client: GobgpApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Speaker for GobgpSpeaker {
    async fn best_paths(&mut self) -> Result<BestPathStream, SpeakerError> {
        let mut table = self.client.get_rib(rib_arguments()).await?;
        let mut current = Vec::new();
        while let Some(dst) = table.message().await? {
            if let Some(best) = dst.paths.into_iter().find(|p| p.best) {
                current.push(Ok(PathUpdate::from(best)));
            }
        }
        debug!(paths = current.len(), "Fetched current best paths");

        // The change stream is opened once the current table has been consumed.
        let mut client = self.client.clone();
        let changes = stream::once(async move {
            client
                .monitor_best_changed(rib_arguments())
                .await
                .map(|s| s.map_err(SpeakerError::from))
                .map_err(SpeakerError::from)
        })
        .try_flatten()
        .try_filter_map(|dst| future::ready(Ok(first_path(dst))));

        Ok(stream::iter(current).chain(changes).boxed())
    }

    async fn submit_path(&mut self, path: PathUpdate) -> Result<(), SpeakerError> {
        let res = self
            .client
            .mod_path(ModPathArguments {
                resource: Resource::Global as i32,
                name: String::new(),
                paths: vec![path.into()],
            })
            .await?;
        check(res)
    }

    async fn add_neighbor(&mut self, address: IpAddr, asn: u32) -> Result<(), SpeakerError> {
        let res = self
            .client
            .mod_neighbor(ModNeighborArguments {
                operation: Operation::Add as i32,
                peer: Some(Peer {
                    families: Vec::new(),
                    conf: Some(PeerConf {
                        neighbor_address: address.to_string(),
                        peer_as: asn,
                        ..PeerConf::default()
                    }),
                }),
            })
            .await?;
        check(res)
    }

    async fn delete_neighbor(&mut self, address: IpAddr) -> Result<(), SpeakerError> {
        let res = self
            .client
            .mod_neighbor(ModNeighborArguments {
                operation: Operation::Del as i32,
                peer: Some(Peer {
                    families: Vec::new(),
                    conf: Some(PeerConf {
                        neighbor_address: address.to_string(),
                        ..PeerConf::default()
                    }),
                }),
            })
            .await?;
        check(res)
    }

    async fn set_global(&mut self, asn: u32, router_id: Ipv4Addr) -> Result<(), SpeakerError> {
        let res = self
            .client
            .mod_global_config(ModGlobalConfigArguments {
                operation: Operation::Add as i32,
                global: Some(Global {
                    asn,
                    router_id: router_id.to_string(),
                }),
            })
            .await?;
        check(res)
    }
}

/// Connects to a gobgp speaker over plaintext gRPC.
pub struct GobgpConnect {
    endpoint: String,
    timeout: Duration,
}

impl GobgpConnect {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connect for GobgpConnect {
    async fn connect(&self) -> Result<Box<dyn Speaker>, SpeakerError> {
        let endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|_| SpeakerError::InvalidEndpoint(self.endpoint.clone()))?
            .connect_timeout(self.timeout);

        let channel = tokio::time::timeout(self.timeout, endpoint.connect())
            .await
            .map_err(|_| SpeakerError::ConnectTimeout(self.endpoint.clone()))??;

        debug!(endpoint = %self.endpoint, "Connected to gobgp");
        Ok(Box::new(GobgpSpeaker::new(GobgpApiClient::new(channel))))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use prost::Message;

    use super::{check, ErrorCode, Path, RF_IPV4_UC};
    use crate::bgp::speaker::{PathUpdate, SpeakerError};

    #[test]
    fn ipv4_unicast_family() {
        assert_eq!(RF_IPV4_UC, 65537);
    }

    #[test]
    fn path_conversion_keeps_wire_data() {
        let update = PathUpdate::local("10.0.0.0/24".parse().unwrap(), true);
        let path = Path::from(update.clone());
        assert!(path.is_withdraw);

        let decoded = Path::decode(Bytes::from(path.encode_to_vec())).unwrap();
        assert_eq!(PathUpdate::from(decoded), update);
    }

    #[test]
    fn rejected_requests_are_errors() {
        let accepted = super::Error {
            code: ErrorCode::Success as i32,
            msg: String::new(),
        };
        assert!(check(accepted).is_ok());
        assert!(matches!(
            check(super::Error {
                code: ErrorCode::Fail as i32,
                msg: "peer exists".into(),
            }),
            Err(SpeakerError::Rejected { code: 1, msg }) if msg == "peer exists"
        ));
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        use super::GobgpConnect;
        use crate::bgp::speaker::Connect;

        let connect = GobgpConnect::new("not a uri", std::time::Duration::from_millis(10));
        assert!(matches!(
            connect.connect().await,
            Err(SpeakerError::InvalidEndpoint(_))
        ));
    }
}
