//! Abstraction over the local BGP speaker.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;

use super::attr::{encode_prefix, Origin, PathAttribute};
use crate::subnet::Subnet;

/// Errors returned while talking to the speaker.
#[derive(Debug, thiserror::Error)]
pub enum SpeakerError {
    #[error("timed out connecting to speaker at {0}")]
    ConnectTimeout(String),
    #[error("invalid speaker endpoint {0}")]
    InvalidEndpoint(String),
    #[error("speaker transport failure: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("speaker call failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("speaker rejected request with code {code}: {msg}")]
    Rejected { code: i32, msg: String },
}

/// A path as exchanged with the speaker: the serialized NLRI and path attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathUpdate {
    pub nlri: Bytes,
    /// Every entry is one attribute including its header.
    pub attributes: Vec<Bytes>,
    pub is_withdraw: bool,
    pub best: bool,
}

impl PathUpdate {
    /// A path for a prefix originated by this host.
    ///
    /// The next hop is left unspecified, the speaker substitutes its own address when
    /// announcing the path to its neighbors.
    pub fn local(prefix: Subnet, withdraw: bool) -> Self {
        let mut nlri = BytesMut::new();
        encode_prefix(prefix, &mut nlri);

        Self {
            nlri: nlri.freeze(),
            attributes: vec![
                PathAttribute::NextHop(Ipv4Addr::UNSPECIFIED).encode(),
                PathAttribute::Origin(Origin::Igp).encode(),
            ],
            is_withdraw: withdraw,
            best: false,
        }
    }
}

/// Stream of best paths: first the current table, then every change.
pub type BestPathStream = BoxStream<'static, Result<PathUpdate, SpeakerError>>;

/// A connection to a BGP speaker.
///
/// Calls are made sequentially by a single owner.
#[async_trait]
pub trait Speaker: Send {
    /// Open the best path stream.
    async fn best_paths(&mut self) -> Result<BestPathStream, SpeakerError>;

    /// Add or withdraw a path in the global table.
    async fn submit_path(&mut self, path: PathUpdate) -> Result<(), SpeakerError>;

    async fn add_neighbor(&mut self, address: IpAddr, asn: u32) -> Result<(), SpeakerError>;

    async fn delete_neighbor(&mut self, address: IpAddr) -> Result<(), SpeakerError>;

    /// Configure the local AS and router id.
    async fn set_global(&mut self, asn: u32, router_id: Ipv4Addr) -> Result<(), SpeakerError>;
}

/// Factory for [`Speaker`] connections.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Speaker>, SpeakerError>;
}
