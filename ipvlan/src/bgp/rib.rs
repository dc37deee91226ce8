//! Decoded view of a single best path.

use core::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, error, warn};

use super::{
    attr::{decode_prefix, DecodeError, Origin, PathAttribute},
    speaker::PathUpdate,
};
use crate::subnet::Subnet;

/// A path received from the speaker, decoded into the parts the route engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibLocal {
    pub prefix: Subnet,
    pub next_hop: Option<Ipv4Addr>,
    pub originator: Option<Ipv4Addr>,
    pub as_path: Vec<u32>,
    pub origin: Option<Origin>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub cluster_list: Vec<Ipv4Addr>,
    /// The path was originated by this host. Such paths have an unspecified next hop.
    pub is_local: bool,
    pub is_withdraw: bool,
    pub best: bool,
}

impl RibLocal {
    /// Decode a path update.
    ///
    /// Attributes which fail to decode are logged and skipped, a path without a valid prefix
    /// is an error.
    pub fn decode(path: &PathUpdate) -> Result<RibLocal, DecodeError> {
        let mut prefix = if path.nlri.is_empty() {
            None
        } else {
            Some(decode_prefix(&mut &path.nlri[..])?)
        };

        let mut next_hop = None;
        let mut originator = None;
        let mut as_path = Vec::new();
        let mut origin = None;
        let mut med = None;
        let mut local_pref = None;
        let mut cluster_list = Vec::new();

        for raw in &path.attributes {
            let attr = match PathAttribute::decode(raw) {
                Ok(attr) => attr,
                Err(e) => {
                    error!(err=%e, "Failed to decode path attribute");
                    continue;
                }
            };

            match attr {
                PathAttribute::Origin(o) => origin = Some(o),
                PathAttribute::AsPath(asns) => as_path = asns,
                PathAttribute::NextHop(nh) => next_hop = Some(nh),
                PathAttribute::MultiExitDisc(v) => med = Some(v),
                PathAttribute::LocalPref(v) => local_pref = Some(v),
                PathAttribute::OriginatorId(id) => originator = Some(id),
                PathAttribute::ClusterList(ids) => cluster_list = ids,
                PathAttribute::MpReachNlri {
                    next_hop: mp_next_hop,
                    prefixes,
                    ..
                } => {
                    if prefixes.len() != 1 {
                        warn!(
                            prefixes = prefixes.len(),
                            "MP_REACH_NLRI should carry exactly one prefix"
                        );
                    }
                    if let Some(first) = prefixes.first() {
                        prefix = Some(*first);
                    }
                    if mp_next_hop.is_some() {
                        next_hop = mp_next_hop;
                    }
                }
                PathAttribute::MpUnreachNlri { prefixes, .. } => {
                    debug!(?prefixes, "Path carries MP_UNREACH_NLRI");
                }
                PathAttribute::ExtendedCommunities(communities) => {
                    debug!(?communities, "Path carries extended communities");
                }
                PathAttribute::Unknown { type_code, .. } => {
                    debug!(type_code, "Ignoring unknown path attribute");
                }
            }
        }

        Ok(RibLocal {
            prefix: prefix.ok_or(DecodeError::MissingPrefix)?,
            next_hop,
            originator,
            as_path,
            origin,
            med,
            local_pref,
            cluster_list,
            is_local: next_hop == Some(Ipv4Addr::UNSPECIFIED),
            is_withdraw: path.is_withdraw,
            best: path.best,
        })
    }
}

impl fmt::Display for RibLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prefix {}", self.prefix)?;
        match self.next_hop {
            Some(nh) => write!(f, ", next hop {nh}")?,
            None => f.write_str(", no next hop")?,
        }
        if let Some(originator) = self.originator {
            write!(f, ", originator {originator}")?;
        }
        if !self.as_path.is_empty() {
            let path = self
                .as_path
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            write!(f, ", as path [{path}]")?;
        }
        if let Some(origin) = self.origin {
            write!(f, ", origin {origin}")?;
        }
        write!(
            f,
            ", local {}, withdraw {}, best {}",
            self.is_local, self.is_withdraw, self.best
        )
    }
}
