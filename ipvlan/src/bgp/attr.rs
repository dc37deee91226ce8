//! Encoding and decoding of the BGP wire elements carried in speaker path updates.
//!
//! A path is exchanged with the speaker as a serialized NLRI plus a list of serialized path
//! attributes, each with its own attribute header. Only IPv4 unicast is supported.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::subnet::Subnet;

/// Attribute flag: optional attribute.
pub const FLAG_OPTIONAL: u8 = 0x80;
/// Attribute flag: transitive attribute.
pub const FLAG_TRANSITIVE: u8 = 0x40;
/// Attribute flag: the length field is 2 bytes.
pub const FLAG_EXTENDED_LENGTH: u8 = 0x10;

pub const TYPE_ORIGIN: u8 = 1;
pub const TYPE_AS_PATH: u8 = 2;
pub const TYPE_NEXT_HOP: u8 = 3;
pub const TYPE_MULTI_EXIT_DISC: u8 = 4;
pub const TYPE_LOCAL_PREF: u8 = 5;
pub const TYPE_ORIGINATOR_ID: u8 = 9;
pub const TYPE_CLUSTER_LIST: u8 = 10;
pub const TYPE_MP_REACH_NLRI: u8 = 14;
pub const TYPE_MP_UNREACH_NLRI: u8 = 15;
pub const TYPE_EXTENDED_COMMUNITIES: u8 = 16;

const AFI_IPV4: u16 = 1;
const SAFI_UNICAST: u8 = 1;

/// Errors encountered while decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),
    #[error("invalid IPv4 prefix length {0}")]
    PrefixLen(u8),
    #[error("invalid length {len} for {what} attribute")]
    AttributeLength { what: &'static str, len: usize },
    #[error("invalid origin value {0}")]
    Origin(u8),
    #[error("malformed AS path")]
    AsPath,
    #[error("path carries no prefix")]
    MissingPrefix,
}

/// Value of the ORIGIN attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    fn from_wire(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            v => Err(DecodeError::Origin(v)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Origin::Igp => 0,
            Origin::Egp => 1,
            Origin::Incomplete => 2,
        }
    }
}

impl core::fmt::Display for Origin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Origin::Igp => "IGP",
            Origin::Egp => "EGP",
            Origin::Incomplete => "INCOMPLETE",
        })
    }
}

/// A single decoded path attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAttribute {
    Origin(Origin),
    /// All AS numbers of all segments, in order.
    AsPath(Vec<u32>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    MpReachNlri {
        afi: u16,
        safi: u8,
        /// Only set for IPv4 next hops.
        next_hop: Option<Ipv4Addr>,
        /// Only decoded for IPv4 unicast.
        prefixes: Vec<Subnet>,
    },
    MpUnreachNlri {
        afi: u16,
        safi: u8,
        prefixes: Vec<Subnet>,
    },
    ExtendedCommunities(Vec<u64>),
    Unknown {
        flags: u8,
        type_code: u8,
        value: Bytes,
    },
}

fn need(buf: &impl Buf, len: usize, what: &'static str) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(DecodeError::Truncated(what))
    } else {
        Ok(())
    }
}

/// Decode a single prefix in NLRI encoding from the front of `buf`.
pub fn decode_prefix(buf: &mut impl Buf) -> Result<Subnet, DecodeError> {
    need(&*buf, 1, "prefix length")?;
    let prefix_len = buf.get_u8();
    if prefix_len > 32 {
        return Err(DecodeError::PrefixLen(prefix_len));
    }
    let octets = usize::from(prefix_len).div_ceil(8);
    need(&*buf, octets, "prefix")?;
    let mut raw = [0; 4];
    buf.copy_to_slice(&mut raw[..octets]);

    Subnet::new(Ipv4Addr::from(raw), prefix_len)
        .map(|s| s.trunc())
        .map_err(|_| DecodeError::PrefixLen(prefix_len))
}

/// Encode a prefix in NLRI encoding.
pub fn encode_prefix(prefix: Subnet, out: &mut impl BufMut) {
    let prefix = prefix.trunc();
    let octets = usize::from(prefix.prefix_len()).div_ceil(8);
    out.put_u8(prefix.prefix_len());
    out.put_slice(&prefix.network().octets()[..octets]);
}

/// Decode all prefixes in an NLRI field.
pub fn decode_prefixes(mut buf: impl Buf) -> Result<Vec<Subnet>, DecodeError> {
    let mut prefixes = Vec::new();
    while buf.has_remaining() {
        prefixes.push(decode_prefix(&mut buf)?);
    }
    Ok(prefixes)
}

fn decode_ipv4(value: &[u8], what: &'static str) -> Result<Ipv4Addr, DecodeError> {
    <[u8; 4]>::try_from(value)
        .map(Ipv4Addr::from)
        .map_err(|_| DecodeError::AttributeLength {
            what,
            len: value.len(),
        })
}

fn decode_u32(value: &[u8], what: &'static str) -> Result<u32, DecodeError> {
    <[u8; 4]>::try_from(value)
        .map(u32::from_be_bytes)
        .map_err(|_| DecodeError::AttributeLength {
            what,
            len: value.len(),
        })
}

/// Decode an AS_PATH value. The speaker hands out attributes with 4 octet AS numbers regardless
/// of what the peer negotiated, so 2 octet encodings are not recognized.
fn decode_as_path(mut value: &[u8]) -> Result<Vec<u32>, DecodeError> {
    let mut path = Vec::new();
    while value.has_remaining() {
        if value.remaining() < 2 {
            return Err(DecodeError::AsPath);
        }
        let _segment_type = value.get_u8();
        let count = usize::from(value.get_u8());
        if value.remaining() < count * 4 {
            return Err(DecodeError::AsPath);
        }
        for _ in 0..count {
            path.push(value.get_u32());
        }
    }
    Ok(path)
}

fn decode_mp_reach(mut value: &[u8]) -> Result<PathAttribute, DecodeError> {
    need(&value, 4, "MP_REACH_NLRI header")?;
    let afi = value.get_u16();
    let safi = value.get_u8();
    let nh_len = usize::from(value.get_u8());
    need(&value, nh_len + 1, "MP_REACH_NLRI next hop")?;
    let next_hop = if afi == AFI_IPV4 && nh_len >= 4 {
        Some(decode_ipv4(&value[..4], "MP_REACH_NLRI")?)
    } else {
        None
    };
    value.advance(nh_len);
    // Reserved.
    value.advance(1);

    let prefixes = if afi == AFI_IPV4 && safi == SAFI_UNICAST {
        decode_prefixes(value)?
    } else {
        Vec::new()
    };

    Ok(PathAttribute::MpReachNlri {
        afi,
        safi,
        next_hop,
        prefixes,
    })
}

fn decode_mp_unreach(mut value: &[u8]) -> Result<PathAttribute, DecodeError> {
    need(&value, 3, "MP_UNREACH_NLRI header")?;
    let afi = value.get_u16();
    let safi = value.get_u8();
    let prefixes = if afi == AFI_IPV4 && safi == SAFI_UNICAST {
        decode_prefixes(value)?
    } else {
        Vec::new()
    };

    Ok(PathAttribute::MpUnreachNlri {
        afi,
        safi,
        prefixes,
    })
}

impl PathAttribute {
    /// Decode a single attribute, including its header.
    pub fn decode(mut buf: &[u8]) -> Result<PathAttribute, DecodeError> {
        need(&buf, 2, "attribute header")?;
        let flags = buf.get_u8();
        let type_code = buf.get_u8();
        let len = if flags & FLAG_EXTENDED_LENGTH != 0 {
            need(&buf, 2, "attribute length")?;
            usize::from(buf.get_u16())
        } else {
            need(&buf, 1, "attribute length")?;
            usize::from(buf.get_u8())
        };
        need(&buf, len, "attribute value")?;
        let value = &buf[..len];

        Ok(match type_code {
            TYPE_ORIGIN => match value {
                [origin] => PathAttribute::Origin(Origin::from_wire(*origin)?),
                _ => {
                    return Err(DecodeError::AttributeLength {
                        what: "ORIGIN",
                        len,
                    })
                }
            },
            TYPE_AS_PATH => PathAttribute::AsPath(decode_as_path(value)?),
            TYPE_NEXT_HOP => PathAttribute::NextHop(decode_ipv4(value, "NEXT_HOP")?),
            TYPE_MULTI_EXIT_DISC => {
                PathAttribute::MultiExitDisc(decode_u32(value, "MULTI_EXIT_DISC")?)
            }
            TYPE_LOCAL_PREF => PathAttribute::LocalPref(decode_u32(value, "LOCAL_PREF")?),
            TYPE_ORIGINATOR_ID => PathAttribute::OriginatorId(decode_ipv4(value, "ORIGINATOR_ID")?),
            TYPE_CLUSTER_LIST => PathAttribute::ClusterList(
                value
                    .chunks(4)
                    .map(|c| decode_ipv4(c, "CLUSTER_LIST"))
                    .collect::<Result<_, _>>()?,
            ),
            TYPE_MP_REACH_NLRI => decode_mp_reach(value)?,
            TYPE_MP_UNREACH_NLRI => decode_mp_unreach(value)?,
            TYPE_EXTENDED_COMMUNITIES => {
                if len % 8 != 0 {
                    return Err(DecodeError::AttributeLength {
                        what: "EXTENDED_COMMUNITIES",
                        len,
                    });
                }
                PathAttribute::ExtendedCommunities(
                    value.chunks_exact(8).map(|mut c| c.get_u64()).collect(),
                )
            }
            _ => PathAttribute::Unknown {
                flags,
                type_code,
                value: Bytes::copy_from_slice(value),
            },
        })
    }

    /// The attribute type code.
    pub fn type_code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => TYPE_ORIGIN,
            PathAttribute::AsPath(_) => TYPE_AS_PATH,
            PathAttribute::NextHop(_) => TYPE_NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => TYPE_MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => TYPE_LOCAL_PREF,
            PathAttribute::OriginatorId(_) => TYPE_ORIGINATOR_ID,
            PathAttribute::ClusterList(_) => TYPE_CLUSTER_LIST,
            PathAttribute::MpReachNlri { .. } => TYPE_MP_REACH_NLRI,
            PathAttribute::MpUnreachNlri { .. } => TYPE_MP_UNREACH_NLRI,
            PathAttribute::ExtendedCommunities(_) => TYPE_EXTENDED_COMMUNITIES,
            PathAttribute::Unknown { type_code, .. } => *type_code,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            PathAttribute::Origin(_)
            | PathAttribute::AsPath(_)
            | PathAttribute::NextHop(_)
            | PathAttribute::LocalPref(_) => FLAG_TRANSITIVE,
            PathAttribute::MultiExitDisc(_)
            | PathAttribute::OriginatorId(_)
            | PathAttribute::ClusterList(_)
            | PathAttribute::MpReachNlri { .. }
            | PathAttribute::MpUnreachNlri { .. } => FLAG_OPTIONAL,
            PathAttribute::ExtendedCommunities(_) => FLAG_OPTIONAL | FLAG_TRANSITIVE,
            PathAttribute::Unknown { flags, .. } => *flags & !FLAG_EXTENDED_LENGTH,
        }
    }

    fn encode_value(&self, out: &mut BytesMut) {
        match self {
            PathAttribute::Origin(origin) => out.put_u8(origin.to_wire()),
            PathAttribute::AsPath(path) => {
                // A single AS_SEQUENCE segment per 255 AS numbers.
                for segment in path.chunks(255) {
                    out.put_u8(2);
                    out.put_u8(segment.len() as u8);
                    for asn in segment {
                        out.put_u32(*asn);
                    }
                }
            }
            PathAttribute::NextHop(ip) | PathAttribute::OriginatorId(ip) => {
                out.put_slice(&ip.octets())
            }
            PathAttribute::MultiExitDisc(v) | PathAttribute::LocalPref(v) => out.put_u32(*v),
            PathAttribute::ClusterList(ids) => {
                for id in ids {
                    out.put_slice(&id.octets());
                }
            }
            PathAttribute::MpReachNlri {
                afi,
                safi,
                next_hop,
                prefixes,
            } => {
                out.put_u16(*afi);
                out.put_u8(*safi);
                match next_hop {
                    Some(nh) => {
                        out.put_u8(4);
                        out.put_slice(&nh.octets());
                    }
                    None => out.put_u8(0),
                }
                out.put_u8(0);
                for prefix in prefixes {
                    encode_prefix(*prefix, out);
                }
            }
            PathAttribute::MpUnreachNlri {
                afi,
                safi,
                prefixes,
            } => {
                out.put_u16(*afi);
                out.put_u8(*safi);
                for prefix in prefixes {
                    encode_prefix(*prefix, out);
                }
            }
            PathAttribute::ExtendedCommunities(communities) => {
                for c in communities {
                    out.put_u64(*c);
                }
            }
            PathAttribute::Unknown { value, .. } => out.put_slice(value),
        }
    }

    /// Encode the attribute, including its header.
    pub fn encode(&self) -> Bytes {
        let mut value = BytesMut::new();
        self.encode_value(&mut value);

        let mut out = BytesMut::with_capacity(value.len() + 4);
        if value.len() > usize::from(u8::MAX) {
            out.put_u8(self.flags() | FLAG_EXTENDED_LENGTH);
            out.put_u8(self.type_code());
            out.put_u16(value.len() as u16);
        } else {
            out.put_u8(self.flags());
            out.put_u8(self.type_code());
            out.put_u8(value.len() as u8);
        }
        out.put_slice(&value);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::BytesMut;

    use super::{decode_prefix, encode_prefix, DecodeError, Origin, PathAttribute};

    #[test]
    fn prefix_uses_minimal_octets() {
        let mut out = BytesMut::new();
        encode_prefix("10.1.0.0/16".parse().unwrap(), &mut out);
        assert_eq!(&out[..], &[16, 10, 1]);

        let mut out = BytesMut::new();
        encode_prefix("0.0.0.0/0".parse().unwrap(), &mut out);
        assert_eq!(&out[..], &[0]);

        let mut raw: &[u8] = &[25, 192, 168, 1, 128];
        assert_eq!(
            decode_prefix(&mut raw).unwrap().to_string(),
            "192.168.1.128/25"
        );
        assert!(raw.is_empty());
    }

    #[test]
    fn reject_bad_prefixes() {
        let mut raw: &[u8] = &[33, 1, 2, 3, 4, 5];
        assert_eq!(decode_prefix(&mut raw), Err(DecodeError::PrefixLen(33)));
        let mut raw: &[u8] = &[24, 10, 0];
        assert_eq!(
            decode_prefix(&mut raw),
            Err(DecodeError::Truncated("prefix"))
        );
    }

    #[test]
    fn decode_well_known_attributes() {
        assert_eq!(
            PathAttribute::decode(&[0x40, 1, 1, 0]).unwrap(),
            PathAttribute::Origin(Origin::Igp)
        );
        assert_eq!(
            PathAttribute::decode(&[0x40, 3, 4, 192, 168, 10, 2]).unwrap(),
            PathAttribute::NextHop(Ipv4Addr::new(192, 168, 10, 2))
        );
        assert_eq!(
            PathAttribute::decode(&[0x40, 5, 4, 0, 0, 0, 100]).unwrap(),
            PathAttribute::LocalPref(100)
        );
        assert_eq!(
            PathAttribute::decode(&[0x80, 4, 4, 0, 0, 1, 0]).unwrap(),
            PathAttribute::MultiExitDisc(256)
        );
    }

    #[test]
    fn decode_four_octet_as_path() {
        // AS_SEQUENCE 65001 65002.
        let four = [0x40, 2, 10, 2, 2, 0, 0, 0xfd, 0xe9, 0, 0, 0xfd, 0xea];
        assert_eq!(
            PathAttribute::decode(&four).unwrap(),
            PathAttribute::AsPath(vec![65001, 65002])
        );
        assert_eq!(
            PathAttribute::decode(&[0x40, 2, 0]).unwrap(),
            PathAttribute::AsPath(vec![])
        );
    }

    #[test]
    fn reject_two_octet_as_path() {
        // AS_SEQUENCE 100 200 300 with 2 octet AS numbers.
        let two = [0x40, 2, 8, 2, 3, 0, 100, 0, 200, 1, 44];
        assert!(matches!(
            PathAttribute::decode(&two),
            Err(DecodeError::AsPath)
        ));
    }

    #[test]
    fn decode_mp_reach_ipv4() {
        let raw = [
            0x90, 14, 0, 13, 0, 1, 1, 4, 10, 0, 0, 9, 0, 24, 172, 16, 3,
        ];
        assert_eq!(
            PathAttribute::decode(&raw).unwrap(),
            PathAttribute::MpReachNlri {
                afi: 1,
                safi: 1,
                next_hop: Some(Ipv4Addr::new(10, 0, 0, 9)),
                prefixes: vec!["172.16.3.0/24".parse().unwrap()],
            }
        );
    }

    #[test]
    fn unknown_attributes_are_kept() {
        let raw = [0xc0, 99, 2, 0xaa, 0xbb];
        let attr = PathAttribute::decode(&raw).unwrap();
        assert_eq!(attr.type_code(), 99);
        assert_eq!(&attr.encode()[..], &raw);
    }

    #[test]
    fn truncated_attribute() {
        assert_eq!(
            PathAttribute::decode(&[0x40, 3, 4, 10, 0]),
            Err(DecodeError::Truncated("attribute value"))
        );
        assert!(matches!(
            PathAttribute::decode(&[0x40, 3, 3, 10, 0, 0]),
            Err(DecodeError::AttributeLength { .. })
        ));
    }

    #[test]
    fn extended_length_is_used_for_long_values() {
        let attr = PathAttribute::ExtendedCommunities((0..40).collect());
        let encoded = attr.encode();
        assert_eq!(encoded[0], 0xc0 | 0x10);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 320);
        assert_eq!(PathAttribute::decode(&encoded).unwrap(), attr);
    }

    #[test]
    fn local_path_attributes_encoding() {
        assert_eq!(
            &PathAttribute::NextHop(Ipv4Addr::UNSPECIFIED).encode()[..],
            &[0x40, 3, 4, 0, 0, 0, 0]
        );
        assert_eq!(
            &PathAttribute::Origin(Origin::Igp).encode()[..],
            &[0x40, 1, 1, 0]
        );
    }
}
