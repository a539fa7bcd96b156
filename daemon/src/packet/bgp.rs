// Copyright (C) 2019-2021 The RustyBGP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use once_cell::sync::Lazy;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::{fmt, io};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// NOTIFICATION error codes and subcodes (RFC4271 section 4.5, RFC4486).
pub mod notification {
    pub const MESSAGE_HEADER_ERROR: u8 = 1;
    pub const OPEN_MESSAGE_ERROR: u8 = 2;
    pub const UPDATE_MESSAGE_ERROR: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM_ERROR: u8 = 5;
    pub const CEASE: u8 = 6;

    // message header
    pub const CONNECTION_NOT_SYNC: u8 = 1;
    pub const BAD_MESSAGE_LENGTH: u8 = 2;
    pub const BAD_MESSAGE_TYPE: u8 = 3;

    // open
    pub const UNSUPPORTED_VERSION_NUMBER: u8 = 1;
    pub const BAD_PEER_AS: u8 = 2;
    pub const BAD_BGP_IDENTIFIER: u8 = 3;
    pub const UNSUPPORTED_OPTIONAL_PARAMETER: u8 = 4;
    pub const UNACCEPTABLE_HOLD_TIME: u8 = 6;

    // update
    pub const MALFORMED_ATTRIBUTE_LIST: u8 = 1;
    pub const UNRECOGNIZED_WELL_KNOWN_ATTR: u8 = 2;
    pub const MISSING_WELL_KNOWN_ATTR: u8 = 3;
    pub const ATTRIBUTE_FLAGS_ERROR: u8 = 4;
    pub const ATTRIBUTE_LENGTH_ERROR: u8 = 5;
    pub const INVALID_ORIGIN_ATTR: u8 = 6;
    pub const OPTIONAL_ATTRIBUTE_ERROR: u8 = 9;
    pub const INVALID_NETWORK_FIELD: u8 = 10;
    pub const MALFORMED_AS_PATH: u8 = 11;

    // cease (RFC4486)
    pub const MAX_PREFIX_REACHED: u8 = 1;
    pub const ADMINISTRATIVE_SHUTDOWN: u8 = 2;
    pub const PEER_DECONFIGURED: u8 = 3;
    pub const ADMINISTRATIVE_RESET: u8 = 4;
    pub const CONNECTION_REJECTED: u8 = 5;
    pub const OTHER_CONFIGURATION_CHANGE: u8 = 6;
    pub const CONNECTION_COLLISION_RESOLUTION: u8 = 7;
    pub const OUT_OF_RESOURCES: u8 = 8;

    /// Whether the pair is one of the codes assigned by RFC4271 and
    /// RFC4486.
    pub fn is_valid(code: u8, subcode: u8) -> bool {
        match code {
            MESSAGE_HEADER_ERROR => (1..=BAD_MESSAGE_TYPE).contains(&subcode),
            OPEN_MESSAGE_ERROR => (1..=UNACCEPTABLE_HOLD_TIME).contains(&subcode) && subcode != 5,
            UPDATE_MESSAGE_ERROR => (1..=MALFORMED_AS_PATH).contains(&subcode) && subcode != 7,
            HOLD_TIMER_EXPIRED | FSM_ERROR => subcode == 0,
            CEASE => subcode <= OUT_OF_RESOURCES,
            _ => false,
        }
    }
}

fn wire_error(code: u8, subcode: u8, data: Vec<u8>) -> Error {
    Error::InvalidMessageFormat {
        code,
        subcode,
        data,
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Family(u32);

impl Family {
    pub const AFI_IP: u16 = 1;
    pub const AFI_IP6: u16 = 2;

    pub const SAFI_UNICAST: u8 = 1;

    pub const EMPTY: Family = Family(0);
    pub const IPV4: Family = Family((Family::AFI_IP as u32) << 16 | Family::SAFI_UNICAST as u32);
    pub const IPV6: Family = Family((Family::AFI_IP6 as u32) << 16 | Family::SAFI_UNICAST as u32);

    pub fn new(afi: u16, safi: u8) -> Self {
        Family((afi as u32) << 16 | safi as u32)
    }

    pub fn afi(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn safi(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    fn addr_len(&self) -> usize {
        if self.afi() == Family::AFI_IP6 {
            16
        } else {
            4
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Family::IPV4 => write!(f, "ipv4-unicast"),
            Family::IPV6 => write!(f, "ipv6-unicast"),
            _ => write!(f, "afi {} safi {}", self.afi(), self.safi()),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Copy, PartialOrd, Ord)]
pub enum Net {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl Net {
    /// Builds a prefix with the host bits cleared.
    pub fn new(addr: IpAddr, mask: u8) -> Result<Net, Error> {
        match addr {
            IpAddr::V4(addr) => {
                if mask > 32 {
                    return Err(Error::InvalidArgument(format!(
                        "mask is too large: {}",
                        mask
                    )));
                }
                Ok(Net::V4(Ipv4Net::new(addr, mask)))
            }
            IpAddr::V6(addr) => {
                if mask > 128 {
                    return Err(Error::InvalidArgument(format!(
                        "mask is too large: {}",
                        mask
                    )));
                }
                Ok(Net::V6(Ipv6Net::new(addr, mask)))
            }
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Net::V4(net) => IpAddr::V4(net.addr),
            Net::V6(net) => IpAddr::V6(net.addr),
        }
    }

    pub fn mask(&self) -> u8 {
        match self {
            Net::V4(net) => net.mask,
            Net::V6(net) => net.mask,
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Net::V4(_) => Family::IPV4,
            Net::V6(_) => Family::IPV6,
        }
    }

    /// Address bits aligned to the most significant end of a u128.
    pub(crate) fn bits(&self) -> u128 {
        match self {
            Net::V4(net) => (u32::from(net.addr) as u128) << 96,
            Net::V6(net) => u128::from(net.addr),
        }
    }

    /// Number of leading bits `self` and `other` share, capped by both masks.
    pub(crate) fn common_len(&self, other: &Net) -> u8 {
        let diff = (self.bits() ^ other.bits()).leading_zeros() as u8;
        std::cmp::min(diff, std::cmp::min(self.mask(), other.mask()))
    }

    pub fn contains(&self, other: &Net) -> bool {
        if self.family() != other.family() || self.mask() > other.mask() {
            return false;
        }
        self.common_len(other) == self.mask()
    }

    /// The covering prefix of length `mask`, which must not exceed ours.
    pub(crate) fn truncate(&self, mask: u8) -> Net {
        match self {
            Net::V4(net) => Net::V4(Ipv4Net::new(net.addr, std::cmp::min(mask, net.mask))),
            Net::V6(net) => Net::V6(Ipv6Net::new(net.addr, std::cmp::min(mask, net.mask))),
        }
    }

    pub(crate) fn bytes_in_addr(&self) -> usize {
        (self.mask() as usize + 7) / 8
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> u16 {
        match self {
            Net::V4(net) => net.encode(dst),
            Net::V6(net) => net.encode(dst),
        }
    }
}

impl FromStr for Net {
    type Err = Error;

    fn from_str(s: &str) -> Result<Net, Error> {
        let addr_and_mask: Vec<_> = s.split('/').collect();
        if addr_and_mask.len() != 2 {
            return Err(Error::InvalidArgument(s.to_string()));
        }
        let addr = IpAddr::from_str(addr_and_mask[0])
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let mask =
            u8::from_str(addr_and_mask[1]).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Net::new(addr, mask)
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Net::V4(net) => net.fmt(f),
            Net::V6(net) => net.fmt(f),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Copy, PartialOrd, Ord)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub mask: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, mask: u8) -> Self {
        let bits = if mask == 0 {
            0
        } else {
            u32::from(addr) & (u32::MAX << (32 - mask as u32))
        };
        Ipv4Net {
            addr: Ipv4Addr::from(bits),
            mask,
        }
    }

    fn decode<T: io::Read>(c: &mut T, len: usize) -> Result<Ipv4Net, Error> {
        let bit_len = c.read_u8()?;
        if len < ((bit_len as usize + 7) / 8) + 1 || bit_len > 32 {
            return Err(wire_error(
                notification::UPDATE_MESSAGE_ERROR,
                notification::MALFORMED_ATTRIBUTE_LIST,
                Vec::new(),
            ));
        }
        let mut addr = [0_u8; 4];
        for i in 0..(bit_len + 7) / 8 {
            addr[i as usize] = c.read_u8()?;
        }
        Ok(Ipv4Net::new(Ipv4Addr::from(addr), bit_len))
    }

    fn encode(&self, dst: &mut BytesMut) -> u16 {
        let head_pos = dst.len();
        let prefix_len = (self.mask + 7) / 8;
        dst.put_u8(self.mask);
        for i in 0..prefix_len {
            dst.put_u8(self.addr.octets()[i as usize]);
        }
        (dst.len() - head_pos) as u16
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

#[test]
fn parse_bogus_ipv4net() {
    // try to ipv6 prefix
    let mut buf = vec![128];
    buf.append(&mut Ipv6Addr::from(139930210).octets().to_vec());
    let len = buf.len();
    let mut c = Cursor::new(buf);
    assert!(Ipv4Net::decode(&mut c, len).is_err());
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Copy, PartialOrd, Ord)]
pub struct Ipv6Net {
    pub addr: Ipv6Addr,
    pub mask: u8,
}

impl Ipv6Net {
    pub fn new(addr: Ipv6Addr, mask: u8) -> Self {
        let bits = if mask == 0 {
            0
        } else {
            u128::from(addr) & (u128::MAX << (128 - mask as u32))
        };
        Ipv6Net {
            addr: Ipv6Addr::from(bits),
            mask,
        }
    }

    fn decode<T: io::Read>(c: &mut T, len: usize) -> Result<Ipv6Net, Error> {
        let bit_len = c.read_u8()?;
        if len < ((bit_len as usize + 7) / 8) + 1 || bit_len > 128 {
            return Err(wire_error(
                notification::UPDATE_MESSAGE_ERROR,
                notification::MALFORMED_ATTRIBUTE_LIST,
                Vec::new(),
            ));
        }
        let mut addr = [0_u8; 16];
        for i in 0..(bit_len + 7) / 8 {
            addr[i as usize] = c.read_u8()?;
        }
        Ok(Ipv6Net::new(Ipv6Addr::from(addr), bit_len))
    }

    fn encode(&self, dst: &mut BytesMut) -> u16 {
        let head_pos = dst.len();
        let prefix_len = (self.mask + 7) / 8;
        dst.put_u8(self.mask);
        for i in 0..prefix_len {
            dst.put_u8(self.addr.octets()[i as usize]);
        }
        (dst.len() - head_pos) as u16
    }
}

impl fmt::Display for Ipv6Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

#[test]
fn parse_bogus_ipv6net() {
    // try to ipv6 prefix
    let mut buf = vec![192];
    buf.append(&mut Ipv6Addr::from(139930210).octets().to_vec());
    buf.append(&mut (0..8).collect::<Vec<u8>>());
    let len = buf.len();
    let mut c = Cursor::new(buf);
    assert!(Ipv6Net::decode(&mut c, len).is_err());
}

/// One NLRI entry, optionally tagged with an add-path identifier.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Copy)]
pub struct Nlri {
    pub net: Net,
    pub path_id: u32,
}

impl Nlri {
    pub fn new(net: Net) -> Self {
        Nlri { net, path_id: 0 }
    }

    pub fn with_path_id(net: Net, path_id: u32) -> Self {
        Nlri { net, path_id }
    }

    fn encode(&self, dst: &mut BytesMut, addpath: bool) {
        if addpath {
            dst.put_u32(self.path_id);
        }
        self.net.encode(dst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    MultiProtocol(Family),
    RouteRefresh,
    GracefulRestart(u8, u16, Vec<(Family, u8)>),
    FourOctetAsNumber(u32),
    AddPath(Vec<(Family, u8)>),
    Unknown { code: u8, bin: Vec<u8> },
}

impl Capability {
    const MULTI_PROTOCOL: u8 = 1;
    const ROUTE_REFRESH: u8 = 2;
    const GRACEFUL_RESTART: u8 = 64;
    const FOUR_OCTET_AS_NUMBER: u8 = 65;
    const ADD_PATH: u8 = 69;

    pub const TRANS_ASN: u16 = 23456;

    pub const ADD_PATH_RECEIVE: u8 = 1;
    pub const ADD_PATH_SEND: u8 = 2;
    pub const ADD_PATH_BOTH: u8 = 3;
}

impl From<&Capability> for u8 {
    fn from(cap: &Capability) -> u8 {
        match cap {
            Capability::MultiProtocol(_) => Capability::MULTI_PROTOCOL,
            Capability::RouteRefresh => Capability::ROUTE_REFRESH,
            Capability::GracefulRestart(..) => Capability::GRACEFUL_RESTART,
            Capability::FourOctetAsNumber(_) => Capability::FOUR_OCTET_AS_NUMBER,
            Capability::AddPath(_) => Capability::ADD_PATH,
            Capability::Unknown { code, bin: _ } => *code,
        }
    }
}

impl Capability {
    fn encode(&self, c: &mut BytesMut) -> u8 {
        let head = c.len();
        c.put_u8(self.into());
        match self {
            Capability::MultiProtocol(family) => {
                c.put_u8(4);
                c.put_u16(family.afi());
                c.put_u8(0);
                c.put_u8(family.safi());
            }
            Capability::RouteRefresh => {
                c.put_u8(0);
            }
            Capability::GracefulRestart(flags, time, v) => {
                c.put_u8(v.len() as u8 * 4 + 2);
                c.put_u16((*flags as u16) << 12 | (*time & 0xfff));
                for (family, af_flags) in v {
                    c.put_u16(family.afi());
                    c.put_u8(family.safi());
                    c.put_u8(*af_flags);
                }
            }
            Capability::FourOctetAsNumber(as_number) => {
                c.put_u8(4);
                c.put_u32(*as_number);
            }
            Capability::AddPath(v) => {
                c.put_u8(v.len() as u8 * 4);
                for (family, mode) in v {
                    c.put_u16(family.afi());
                    c.put_u8(family.safi());
                    c.put_u8(*mode);
                }
            }
            Capability::Unknown { code: _, bin } => {
                c.put_u8(bin.len() as u8);
                c.put_slice(bin);
            }
        }
        (c.len() - head) as u8
    }
}

struct CapDesc {
    code: u8,
    decode: fn(c: &mut Cursor<&[u8]>, len: u8) -> io::Result<Option<Capability>>,
}

static CAP_DESCS: Lazy<FnvHashMap<u8, CapDesc>> = Lazy::new(|| {
    vec![
        CapDesc {
            code: Capability::MULTI_PROTOCOL,
            decode: (|c, len| {
                if len != 4 {
                    return Ok(None);
                }
                let afi = c.read_u16::<NetworkEndian>()?;
                let _ = c.read_u8()?;
                let safi = c.read_u8()?;
                Ok(Some(Capability::MultiProtocol(Family::new(afi, safi))))
            }),
        },
        CapDesc {
            code: Capability::ROUTE_REFRESH,
            decode: (|_c, len| {
                if len != 0 {
                    return Ok(None);
                }
                Ok(Some(Capability::RouteRefresh))
            }),
        },
        CapDesc {
            code: Capability::GRACEFUL_RESTART,
            decode: (|c, len| {
                if len % 4 != 2 {
                    return Ok(None);
                }
                let restart = c.read_u16::<NetworkEndian>()?;
                let flags = (restart >> 12) as u8;
                let time = restart & 0xfff;
                let mut v = Vec::new();
                for _ in 0..(len - 2) / 4 {
                    let afi = c.read_u16::<NetworkEndian>()?;
                    let safi = c.read_u8()?;
                    let af_flag = c.read_u8()?;
                    v.push((Family::new(afi, safi), af_flag));
                }
                Ok(Some(Capability::GracefulRestart(flags, time, v)))
            }),
        },
        CapDesc {
            code: Capability::FOUR_OCTET_AS_NUMBER,
            decode: (|c, len| {
                if len != 4 {
                    return Ok(None);
                }
                Ok(Some(Capability::FourOctetAsNumber(
                    c.read_u32::<NetworkEndian>()?,
                )))
            }),
        },
        CapDesc {
            code: Capability::ADD_PATH,
            decode: (|c, len| {
                if len % 4 != 0 {
                    return Ok(None);
                }
                let mut v = Vec::new();
                for _ in 0..len / 4 {
                    let afi = c.read_u16::<NetworkEndian>()?;
                    let safi = c.read_u8()?;
                    let val = c.read_u8()?;
                    if val > Capability::ADD_PATH_BOTH {
                        continue;
                    }
                    v.push((Family::new(afi, safi), val));
                }
                Ok(Some(Capability::AddPath(v)))
            }),
        },
    ]
    .into_iter()
    .map(|x| (x.code, x))
    .collect()
});

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct AsPathSegment {
    pub segment_type: u8,
    pub asns: Vec<u32>,
}

impl AsPathSegment {
    pub const AS_SET: u8 = 1;
    pub const AS_SEQUENCE: u8 = 2;
    pub const AS_CONFED_SEQUENCE: u8 = 3;
    pub const AS_CONFED_SET: u8 = 4;

    pub fn sequence(asns: Vec<u32>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegment::AS_SEQUENCE,
            asns,
        }
    }

    pub fn set(asns: Vec<u32>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegment::AS_SET,
            asns,
        }
    }

    fn is_sequence(&self) -> bool {
        self.segment_type == AsPathSegment::AS_SEQUENCE
    }
}

/// Ordered list of AS_PATH segments.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Default)]
pub struct AsPath(pub Vec<AsPathSegment>);

impl AsPath {
    /// Path length for best path selection: each sequence member counts,
    /// a set counts as one, confederation segments do not count.
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .map(|s| match s.segment_type {
                AsPathSegment::AS_SEQUENCE => s.asns.len(),
                AsPathSegment::AS_SET => 1,
                _ => 0,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|s| s.asns.is_empty())
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.0.iter().any(|s| s.asns.contains(&asn))
    }

    pub fn first_asn(&self) -> Option<u32> {
        self.0
            .first()
            .filter(|s| s.is_sequence())
            .and_then(|s| s.asns.first().copied())
    }

    /// Last ASN of the last sequence, the origin AS.
    pub fn origin_asn(&self) -> Option<u32> {
        self.0
            .iter()
            .rev()
            .find(|s| s.is_sequence())
            .and_then(|s| s.asns.last().copied())
    }

    pub fn prepend(&mut self, asn: u32, times: usize) {
        if times == 0 {
            return;
        }
        let head = match self.0.first_mut() {
            Some(s) if s.is_sequence() && s.asns.len() + times <= 255 => s,
            _ => {
                self.0.insert(0, AsPathSegment::sequence(Vec::new()));
                &mut self.0[0]
            }
        };
        for _ in 0..times {
            head.asns.insert(0, asn);
        }
    }

    fn has_four_octet(&self) -> bool {
        self.0.iter().any(|s| s.asns.iter().any(|a| *a > u16::MAX as u32))
    }

    fn encode(&self, dst: &mut BytesMut, four_octet: bool) {
        for s in &self.0 {
            dst.put_u8(s.segment_type);
            dst.put_u8(s.asns.len() as u8);
            for asn in &s.asns {
                if four_octet {
                    dst.put_u32(*asn);
                } else if *asn > u16::MAX as u32 {
                    dst.put_u16(Capability::TRANS_ASN);
                } else {
                    dst.put_u16(*asn as u16);
                }
            }
        }
    }

    fn decode(v: &[u8], four_octet: bool) -> Result<AsPath, u8> {
        let width = if four_octet { 4 } else { 2 };
        let mut c = Cursor::new(v);
        let mut segments = Vec::new();
        while (c.position() as usize) < v.len() {
            let rest = v.len() - c.position() as usize;
            if rest < 2 {
                return Err(notification::MALFORMED_AS_PATH);
            }
            let segment_type = c.read_u8().map_err(|_| notification::MALFORMED_AS_PATH)?;
            let count = c.read_u8().map_err(|_| notification::MALFORMED_AS_PATH)? as usize;
            if !(AsPathSegment::AS_SET..=AsPathSegment::AS_CONFED_SET).contains(&segment_type)
                || count == 0
                || rest - 2 < count * width
            {
                return Err(notification::MALFORMED_AS_PATH);
            }
            let mut asns = Vec::with_capacity(count);
            for _ in 0..count {
                let asn = if four_octet {
                    c.read_u32::<NetworkEndian>()
                } else {
                    c.read_u16::<NetworkEndian>().map(|a| a as u32)
                }
                .map_err(|_| notification::MALFORMED_AS_PATH)?;
                asns.push(asn);
            }
            segments.push(AsPathSegment { segment_type, asns });
        }
        Ok(AsPath(segments))
    }

    /// Rebuilds the real path from AS_PATH and AS4_PATH (RFC6793 4.2.3).
    fn merge_as4(&self, as4: &AsPath) -> AsPath {
        let as_len = self.len();
        let as4_len = as4.len();
        if as4_len > as_len {
            return self.clone();
        }
        let mut keep = as_len - as4_len;
        let mut segments = Vec::new();
        for s in &self.0 {
            if keep == 0 {
                break;
            }
            match s.segment_type {
                AsPathSegment::AS_SEQUENCE => {
                    let n = std::cmp::min(keep, s.asns.len());
                    segments.push(AsPathSegment::sequence(s.asns[..n].to_vec()));
                    keep -= n;
                }
                AsPathSegment::AS_SET => {
                    segments.push(s.clone());
                    keep -= 1;
                }
                _ => segments.push(s.clone()),
            }
        }
        segments.extend(as4.0.iter().cloned());
        AsPath(segments)
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut v = Vec::new();
        for s in &self.0 {
            let asns: Vec<String> = s.asns.iter().map(|a| a.to_string()).collect();
            match s.segment_type {
                AsPathSegment::AS_SET | AsPathSegment::AS_CONFED_SET => {
                    v.push(format!("({})", asns.join(" ")))
                }
                _ => v.push(asns.join(" ")),
            }
        }
        write!(f, "{}", v.join(" "))
    }
}

impl FromStr for AsPath {
    type Err = Error;

    /// "100 200 (300 400)" is a sequence followed by a set.
    fn from_str(s: &str) -> Result<AsPath, Error> {
        let mut segments: Vec<AsPathSegment> = Vec::new();
        let mut in_set = false;
        let mut set = Vec::new();
        for token in s.split_whitespace() {
            let mut t = token;
            if let Some(rest) = t.strip_prefix('(') {
                if in_set {
                    return Err(Error::InvalidArgument(s.to_string()));
                }
                in_set = true;
                t = rest;
            }
            let close = t.ends_with(')');
            let t = t.trim_end_matches(')');
            if !t.is_empty() {
                let asn = u32::from_str(t).map_err(|e| Error::InvalidArgument(e.to_string()))?;
                if in_set {
                    set.push(asn);
                } else {
                    match segments.last_mut() {
                        Some(seg) if seg.is_sequence() => seg.asns.push(asn),
                        _ => segments.push(AsPathSegment::sequence(vec![asn])),
                    }
                }
            }
            if close {
                if !in_set {
                    return Err(Error::InvalidArgument(s.to_string()));
                }
                in_set = false;
                segments.push(AsPathSegment::set(std::mem::take(&mut set)));
            }
        }
        if in_set {
            return Err(Error::InvalidArgument(s.to_string()));
        }
        Ok(AsPath(segments))
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Aggregator {
    pub asn: u32,
    pub addr: Ipv4Addr,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct LargeCommunity {
    pub global_administrator: u32,
    pub local_data_part1: u32,
    pub local_data_part2: u32,
}

impl fmt::Display for LargeCommunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.global_administrator, self.local_data_part1, self.local_data_part2
        )
    }
}

impl FromStr for LargeCommunity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let v: Vec<&str> = s.split(':').collect();
        if v.len() != 3 {
            return Err(Error::InvalidArgument(s.to_string()));
        }
        let p = |x: &str| u32::from_str(x).map_err(|e| Error::InvalidArgument(e.to_string()));
        Ok(LargeCommunity {
            global_administrator: p(v[0])?,
            local_data_part1: p(v[1])?,
            local_data_part2: p(v[2])?,
        })
    }
}

/// Parses "65000:100" or one of the well-known community names.
pub fn parse_community(s: &str) -> Result<u32, Error> {
    match s {
        "no-export" => return Ok(Attribute::COMMUNITY_NO_EXPORT),
        "no-advertise" => return Ok(Attribute::COMMUNITY_NO_ADVERTISE),
        _ => {}
    }
    let v: Vec<&str> = s.split(':').collect();
    if v.len() != 2 {
        return Err(Error::InvalidArgument(s.to_string()));
    }
    let high = u16::from_str(v[0]).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let low = u16::from_str(v[1]).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok((high as u32) << 16 | low as u32)
}

pub fn format_community(c: u32) -> String {
    format!("{}:{}", c >> 16, c & 0xffff)
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MpReach {
    pub family: Family,
    pub next_hop: IpAddr,
    pub link_local: Option<Ipv6Addr>,
    pub nlri: Vec<Nlri>,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MpUnreach {
    pub family: Family,
    pub nlri: Vec<Nlri>,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Attribute {
    Origin(u8),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    Communities(Vec<u32>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<u32>),
    MpReach(MpReach),
    MpUnreach(MpUnreach),
    As4Path(AsPath),
    As4Aggregator(Aggregator),
    LargeCommunities(Vec<LargeCommunity>),
    Unknown { flags: u8, code: u8, bin: Vec<u8> },
}

impl Attribute {
    pub const FLAG_EXTENDED: u8 = 1 << 4;
    pub const FLAG_PARTIAL: u8 = 1 << 5;
    pub const FLAG_TRANSITIVE: u8 = 1 << 6;
    pub const FLAG_OPTIONAL: u8 = 1 << 7;

    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXTHOP: u8 = 3;
    pub const MULTI_EXIT_DESC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITY: u8 = 8;
    pub const ORIGINATOR_ID: u8 = 9;
    pub const CLUSTER_LIST: u8 = 10;
    pub const MP_REACH: u8 = 14;
    pub const MP_UNREACH: u8 = 15;
    pub const AS4_PATH: u8 = 17;
    pub const AS4_AGGREGATOR: u8 = 18;
    pub const LARGE_COMMUNITY: u8 = 32;

    pub const ORIGIN_IGP: u8 = 0;
    pub const ORIGIN_EGP: u8 = 1;
    pub const ORIGIN_INCOMPLETE: u8 = 2;

    pub const DEFAULT_LOCAL_PREF: u32 = 100;

    pub const COMMUNITY_NO_EXPORT: u32 = 0xffff_ff01;
    pub const COMMUNITY_NO_ADVERTISE: u32 = 0xffff_ff02;

    pub fn code(&self) -> u8 {
        match self {
            Attribute::Origin(_) => Attribute::ORIGIN,
            Attribute::AsPath(_) => Attribute::AS_PATH,
            Attribute::NextHop(_) => Attribute::NEXTHOP,
            Attribute::MultiExitDisc(_) => Attribute::MULTI_EXIT_DESC,
            Attribute::LocalPref(_) => Attribute::LOCAL_PREF,
            Attribute::AtomicAggregate => Attribute::ATOMIC_AGGREGATE,
            Attribute::Aggregator(_) => Attribute::AGGREGATOR,
            Attribute::Communities(_) => Attribute::COMMUNITY,
            Attribute::OriginatorId(_) => Attribute::ORIGINATOR_ID,
            Attribute::ClusterList(_) => Attribute::CLUSTER_LIST,
            Attribute::MpReach(_) => Attribute::MP_REACH,
            Attribute::MpUnreach(_) => Attribute::MP_UNREACH,
            Attribute::As4Path(_) => Attribute::AS4_PATH,
            Attribute::As4Aggregator(_) => Attribute::AS4_AGGREGATOR,
            Attribute::LargeCommunities(_) => Attribute::LARGE_COMMUNITY,
            Attribute::Unknown { code, .. } => *code,
        }
    }

    /// Flags as sent on the wire, without the extended length bit.
    pub fn flags(&self) -> u8 {
        match self {
            Attribute::Unknown { flags, .. } => *flags & !Attribute::FLAG_EXTENDED,
            _ => ATTR_DESCS.get(&self.code()).map_or(0, |d| d.flags),
        }
    }

    fn encode_value(&self, codec: &Codec, dst: &mut BytesMut) {
        match self {
            Attribute::Origin(v) => dst.put_u8(*v),
            Attribute::AsPath(path) => path.encode(dst, codec.four_octet_asn),
            Attribute::NextHop(addr) => dst.put_slice(&addr.octets()),
            Attribute::MultiExitDisc(v) | Attribute::LocalPref(v) => dst.put_u32(*v),
            Attribute::AtomicAggregate => {}
            Attribute::Aggregator(aggr) => {
                if codec.four_octet_asn {
                    dst.put_u32(aggr.asn);
                } else if aggr.asn > u16::MAX as u32 {
                    dst.put_u16(Capability::TRANS_ASN);
                } else {
                    dst.put_u16(aggr.asn as u16);
                }
                dst.put_slice(&aggr.addr.octets());
            }
            Attribute::Communities(v) | Attribute::ClusterList(v) => {
                for c in v {
                    dst.put_u32(*c);
                }
            }
            Attribute::OriginatorId(addr) => dst.put_slice(&addr.octets()),
            Attribute::MpReach(mp) => {
                dst.put_u16(mp.family.afi());
                dst.put_u8(mp.family.safi());
                match mp.next_hop {
                    IpAddr::V4(addr) => {
                        dst.put_u8(4);
                        dst.put_slice(&addr.octets());
                    }
                    IpAddr::V6(addr) => {
                        if let Some(ll) = mp.link_local {
                            dst.put_u8(32);
                            dst.put_slice(&addr.octets());
                            dst.put_slice(&ll.octets());
                        } else {
                            dst.put_u8(16);
                            dst.put_slice(&addr.octets());
                        }
                    }
                }
                // reserved
                dst.put_u8(0);
                let addpath = codec.addpath_tx(mp.family);
                for n in &mp.nlri {
                    n.encode(dst, addpath);
                }
            }
            Attribute::MpUnreach(mp) => {
                dst.put_u16(mp.family.afi());
                dst.put_u8(mp.family.safi());
                let addpath = codec.addpath_tx(mp.family);
                for n in &mp.nlri {
                    n.encode(dst, addpath);
                }
            }
            Attribute::As4Path(path) => path.encode(dst, true),
            Attribute::As4Aggregator(aggr) => {
                dst.put_u32(aggr.asn);
                dst.put_slice(&aggr.addr.octets());
            }
            Attribute::LargeCommunities(v) => {
                for c in v {
                    dst.put_u32(c.global_administrator);
                    dst.put_u32(c.local_data_part1);
                    dst.put_u32(c.local_data_part2);
                }
            }
            Attribute::Unknown { bin, .. } => dst.put_slice(bin),
        }
    }

    fn encode(&self, codec: &Codec, dst: &mut BytesMut) -> usize {
        let mut value = BytesMut::with_capacity(64);
        self.encode_value(codec, &mut value);
        let code = self.code();
        let head = dst.len();
        // MP_REACH/MP_UNREACH always use extended length
        let extended =
            value.len() > 255 || code == Attribute::MP_REACH || code == Attribute::MP_UNREACH;
        if extended {
            dst.put_u8(self.flags() | Attribute::FLAG_EXTENDED);
            dst.put_u8(code);
            dst.put_u16(value.len() as u16);
        } else {
            dst.put_u8(self.flags());
            dst.put_u8(code);
            dst.put_u8(value.len() as u8);
        }
        dst.put_slice(&value);
        dst.len() - head
    }
}

struct AttrDesc {
    code: u8,
    flags: u8,
    decode: fn(s: &Codec, v: &[u8]) -> Result<Attribute, u8>,
}

impl AttrDesc {
    fn decode_u32(v: &[u8]) -> Result<u32, u8> {
        if v.len() != 4 {
            return Err(notification::ATTRIBUTE_LENGTH_ERROR);
        }
        (&v[..])
            .read_u32::<NetworkEndian>()
            .map_err(|_| notification::ATTRIBUTE_LENGTH_ERROR)
    }

    fn decode_u32_list(v: &[u8]) -> Result<Vec<u32>, u8> {
        if v.len() % 4 != 0 {
            return Err(notification::ATTRIBUTE_LENGTH_ERROR);
        }
        Ok(v.chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn decode_aggregator(v: &[u8], four_octet: bool) -> Result<Aggregator, u8> {
        let mut c = Cursor::new(v);
        let err = |_| notification::ATTRIBUTE_LENGTH_ERROR;
        let asn = if four_octet {
            if v.len() != 8 {
                return Err(notification::ATTRIBUTE_LENGTH_ERROR);
            }
            c.read_u32::<NetworkEndian>().map_err(err)?
        } else {
            if v.len() != 6 {
                return Err(notification::ATTRIBUTE_LENGTH_ERROR);
            }
            c.read_u16::<NetworkEndian>().map_err(err)? as u32
        };
        let addr = Ipv4Addr::from(c.read_u32::<NetworkEndian>().map_err(err)?);
        Ok(Aggregator { asn, addr })
    }
}

static ATTR_DESCS: Lazy<FnvHashMap<u8, AttrDesc>> = Lazy::new(|| {
    vec![
        AttrDesc {
            code: Attribute::ORIGIN,
            flags: Attribute::FLAG_TRANSITIVE,
            decode: (|_s, v| {
                if v.len() != 1 {
                    return Err(notification::ATTRIBUTE_LENGTH_ERROR);
                }
                if v[0] > Attribute::ORIGIN_INCOMPLETE {
                    return Err(notification::INVALID_ORIGIN_ATTR);
                }
                Ok(Attribute::Origin(v[0]))
            }),
        },
        AttrDesc {
            code: Attribute::AS_PATH,
            flags: Attribute::FLAG_TRANSITIVE,
            decode: (|s, v| Ok(Attribute::AsPath(AsPath::decode(v, s.four_octet_asn)?))),
        },
        AttrDesc {
            code: Attribute::NEXTHOP,
            flags: Attribute::FLAG_TRANSITIVE,
            decode: (|_s, v| Ok(Attribute::NextHop(Ipv4Addr::from(AttrDesc::decode_u32(v)?)))),
        },
        AttrDesc {
            code: Attribute::MULTI_EXIT_DESC,
            flags: Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| Ok(Attribute::MultiExitDisc(AttrDesc::decode_u32(v)?))),
        },
        AttrDesc {
            code: Attribute::LOCAL_PREF,
            flags: Attribute::FLAG_TRANSITIVE,
            decode: (|_s, v| Ok(Attribute::LocalPref(AttrDesc::decode_u32(v)?))),
        },
        AttrDesc {
            code: Attribute::ATOMIC_AGGREGATE,
            flags: Attribute::FLAG_TRANSITIVE,
            decode: (|_s, v| {
                if !v.is_empty() {
                    return Err(notification::ATTRIBUTE_LENGTH_ERROR);
                }
                Ok(Attribute::AtomicAggregate)
            }),
        },
        AttrDesc {
            code: Attribute::AGGREGATOR,
            flags: Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL,
            decode: (|s, v| {
                Ok(Attribute::Aggregator(AttrDesc::decode_aggregator(
                    v,
                    s.four_octet_asn,
                )?))
            }),
        },
        AttrDesc {
            code: Attribute::COMMUNITY,
            flags: Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| Ok(Attribute::Communities(AttrDesc::decode_u32_list(v)?))),
        },
        AttrDesc {
            code: Attribute::ORIGINATOR_ID,
            flags: Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| {
                Ok(Attribute::OriginatorId(Ipv4Addr::from(
                    AttrDesc::decode_u32(v)?,
                )))
            }),
        },
        AttrDesc {
            code: Attribute::CLUSTER_LIST,
            flags: Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| Ok(Attribute::ClusterList(AttrDesc::decode_u32_list(v)?))),
        },
        AttrDesc {
            code: Attribute::MP_REACH,
            flags: Attribute::FLAG_OPTIONAL,
            decode: (|s, v| s.decode_mp_reach(v).map(Attribute::MpReach)),
        },
        AttrDesc {
            code: Attribute::MP_UNREACH,
            flags: Attribute::FLAG_OPTIONAL,
            decode: (|s, v| s.decode_mp_unreach(v).map(Attribute::MpUnreach)),
        },
        AttrDesc {
            code: Attribute::AS4_PATH,
            flags: Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| {
                AsPath::decode(v, true)
                    .map(Attribute::As4Path)
                    .map_err(|_| notification::OPTIONAL_ATTRIBUTE_ERROR)
            }),
        },
        AttrDesc {
            code: Attribute::AS4_AGGREGATOR,
            flags: Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| {
                Ok(Attribute::As4Aggregator(AttrDesc::decode_aggregator(
                    v, true,
                )?))
            }),
        },
        AttrDesc {
            code: Attribute::LARGE_COMMUNITY,
            flags: Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL,
            decode: (|_s, v| {
                if v.len() % 12 != 0 {
                    return Err(notification::ATTRIBUTE_LENGTH_ERROR);
                }
                let list = AttrDesc::decode_u32_list(v)?;
                Ok(Attribute::LargeCommunities(
                    list.chunks(3)
                        .map(|c| LargeCommunity {
                            global_administrator: c[0],
                            local_data_part1: c[1],
                            local_data_part2: c[2],
                        })
                        .collect(),
                ))
            }),
        },
    ]
    .into_iter()
    .map(|x| (x.code, x))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub version: u8,
    pub as_number: u32,
    pub holdtime: u16,
    pub router_id: Ipv4Addr,
    pub capability: Vec<Capability>,
}

impl Open {
    pub fn four_octet_as_number(&self) -> Option<u32> {
        self.capability.iter().find_map(|c| match c {
            Capability::FourOctetAsNumber(asn) => Some(*asn),
            _ => None,
        })
    }

    /// Add-path modes announced for `family`.
    pub fn addpath(&self, family: Family) -> u8 {
        self.capability
            .iter()
            .filter_map(|c| match c {
                Capability::AddPath(v) => Some(v),
                _ => None,
            })
            .flatten()
            .filter(|(f, _)| *f == family)
            .fold(0, |acc, (_, m)| acc | m)
    }

    pub fn multiprotocol(&self) -> impl Iterator<Item = Family> + '_ {
        self.capability.iter().filter_map(|c| match c {
            Capability::MultiProtocol(f) => Some(*f),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Update {
    pub withdrawn: Vec<Nlri>,
    pub attrs: Vec<Attribute>,
    pub nlri: Vec<Nlri>,
}

impl Update {
    pub fn eor(family: Family) -> Update {
        if family == Family::IPV4 {
            Update::default()
        } else {
            Update {
                attrs: vec![Attribute::MpUnreach(MpUnreach {
                    family,
                    nlri: Vec::new(),
                })],
                ..Default::default()
            }
        }
    }

    pub fn end_of_rib(&self) -> Option<Family> {
        if !self.withdrawn.is_empty() || !self.nlri.is_empty() {
            return None;
        }
        match self.attrs.as_slice() {
            [] => Some(Family::IPV4),
            [Attribute::MpUnreach(mp)] if mp.nlri.is_empty() => Some(mp.family),
            _ => None,
        }
    }

    pub fn mp_reach(&self) -> Option<&MpReach> {
        self.attrs.iter().find_map(|a| match a {
            Attribute::MpReach(mp) => Some(mp),
            _ => None,
        })
    }

    pub fn mp_unreach(&self) -> Option<&MpUnreach> {
        self.attrs.iter().find_map(|a| match a {
            Attribute::MpUnreach(mp) => Some(mp),
            _ => None,
        })
    }

    pub fn attr(&self, code: u8) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.code() == code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification { code: u8, subcode: u8, data: Vec<u8> },
    Keepalive,
    RouteRefresh { family: Family },
}

impl Message {
    pub const HEADER_LENGTH: u16 = 19;
    pub const MAX_LENGTH: usize = 4096;
    pub const MIN_OPEN_LENGTH: usize = 29;
    pub const MIN_UPDATE_LENGTH: usize = 4;

    pub const OPEN: u8 = 1;
    pub const UPDATE: u8 = 2;
    pub const NOTIFICATION: u8 = 3;
    pub const KEEPALIVE: u8 = 4;
    pub const ROUTE_REFRESH: u8 = 5;

    pub fn code(&self) -> u8 {
        match self {
            Message::Open(_) => Message::OPEN,
            Message::Update(_) => Message::UPDATE,
            Message::Notification { .. } => Message::NOTIFICATION,
            Message::Keepalive => Message::KEEPALIVE,
            Message::RouteRefresh { .. } => Message::ROUTE_REFRESH,
        }
    }

    pub fn notification(code: u8, subcode: u8) -> Message {
        Message::Notification {
            code,
            subcode,
            data: Vec::new(),
        }
    }
}

/// Checks the fixed header and returns the full message length once
/// `src` holds a complete message.
fn check_header(src: &[u8]) -> Result<Option<usize>, Error> {
    if src.len() < Message::HEADER_LENGTH as usize {
        return Ok(None);
    }
    if src[..16].iter().any(|b| *b != 0xff) {
        return Err(wire_error(
            notification::MESSAGE_HEADER_ERROR,
            notification::CONNECTION_NOT_SYNC,
            Vec::new(),
        ));
    }
    let message_len = u16::from_be_bytes([src[16], src[17]]) as usize;
    if message_len < Message::HEADER_LENGTH as usize || message_len > Message::MAX_LENGTH {
        return Err(wire_error(
            notification::MESSAGE_HEADER_ERROR,
            notification::BAD_MESSAGE_LENGTH,
            src[16..18].to_vec(),
        ));
    }
    let code = src[18];
    if !(Message::OPEN..=Message::ROUTE_REFRESH).contains(&code) {
        return Err(wire_error(
            notification::MESSAGE_HEADER_ERROR,
            notification::BAD_MESSAGE_TYPE,
            vec![code],
        ));
    }
    if src.len() < message_len {
        return Ok(None);
    }
    Ok(Some(message_len))
}

/// Splits a byte stream into whole BGP messages without interpreting
/// their bodies.
#[derive(Default)]
pub struct Framer;

impl Decoder for Framer {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match check_header(src)? {
            Some(len) => Ok(Some(src.split_to(len))),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Channel {
    family: Family,
    addpath: u8,
}

impl Channel {
    pub fn addpath_rx(&self) -> bool {
        self.addpath & 0x1 > 0
    }

    pub fn addpath_tx(&self) -> bool {
        self.addpath & 0x2 > 0
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn new(family: Family, rx: bool, tx: bool) -> Self {
        let mut addpath = 0;
        if rx {
            addpath |= 0x1;
        }
        if tx {
            addpath |= 0x2;
        }
        Channel { family, addpath }
    }
}

/// Families both sides announced, with the add-path directions usable on
/// each: we receive ids when we asked to receive and the peer offered to
/// send, and the other way around.
pub fn create_channel(
    local: &[Capability],
    remote: &[Capability],
) -> impl Iterator<Item = (Family, Channel)> {
    let f = |v: &[Capability]| -> FnvHashMap<Family, u8> {
        let mut h = FnvHashMap::default();
        for c in v {
            if let Capability::MultiProtocol(f) = c {
                h.insert(*f, 0);
            }
        }
        for c in v {
            if let Capability::AddPath(v) = c {
                for (f, mode) in v {
                    if let Some(m) = h.get_mut(f) {
                        *m = *mode;
                    }
                }
            }
        }
        h
    };
    let mut l = f(local);
    f(remote).into_iter().filter_map(move |(f, rmode)| {
        l.remove(&f).map(|lmode| {
            let rx = lmode & Capability::ADD_PATH_RECEIVE > 0 && rmode & Capability::ADD_PATH_SEND > 0;
            let tx = lmode & Capability::ADD_PATH_SEND > 0 && rmode & Capability::ADD_PATH_RECEIVE > 0;
            (f, Channel::new(f, rx, tx))
        })
    })
}

pub struct CodecBuilder {
    four_octet_asn: bool,
    family: Vec<Family>,
    addpath: Vec<(Family, bool, bool)>,
}

impl CodecBuilder {
    pub fn new() -> Self {
        CodecBuilder {
            four_octet_asn: true,
            family: Vec::new(),
            addpath: Vec::new(),
        }
    }

    pub fn build(&mut self) -> Codec {
        let mut channel: FnvHashMap<Family, Channel> = self
            .family
            .iter()
            .map(|f| (*f, Channel::new(*f, false, false)))
            .collect();
        for (f, rx, tx) in &self.addpath {
            channel.insert(*f, Channel::new(*f, *rx, *tx));
        }
        Codec {
            four_octet_asn: self.four_octet_asn,
            channel,
        }
    }

    pub fn four_octet_asn(&mut self, y: bool) -> &mut Self {
        self.four_octet_asn = y;
        self
    }

    pub fn families(&mut self, v: Vec<Family>) -> &mut Self {
        self.family = v;
        self
    }

    pub fn addpath(&mut self, family: Family, rx: bool, tx: bool) -> &mut Self {
        self.addpath.push((family, rx, tx));
        self
    }
}

impl Default for CodecBuilder {
    fn default() -> Self {
        CodecBuilder::new()
    }
}

/// BGP message codec. The decode options (4-octet ASN and per family
/// add-path) are the negotiated session state.
#[derive(Clone)]
pub struct Codec {
    four_octet_asn: bool,
    pub(crate) channel: FnvHashMap<Family, Channel>,
}

impl Codec {
    pub fn set_four_octet_asn(&mut self, y: bool) {
        self.four_octet_asn = y;
    }

    pub fn four_octet_asn(&self) -> bool {
        self.four_octet_asn
    }

    pub fn set_channel(&mut self, channel: Channel) {
        self.channel.insert(channel.family, channel);
    }

    fn addpath_rx(&self, family: Family) -> bool {
        self.channel.get(&family).map_or(false, |c| c.addpath_rx())
    }

    pub(crate) fn addpath_tx(&self, family: Family) -> bool {
        self.channel.get(&family).map_or(false, |c| c.addpath_tx())
    }

    fn decode_nlri_list(&self, family: Family, v: &[u8], addpath: bool) -> Result<Vec<Nlri>, Error> {
        let mut c = Cursor::new(v);
        let mut list = Vec::new();
        while (c.position() as usize) < v.len() {
            let mut rest = v.len() - c.position() as usize;
            let path_id = if addpath {
                if rest < 5 {
                    return Err(wire_error(
                        notification::UPDATE_MESSAGE_ERROR,
                        notification::MALFORMED_ATTRIBUTE_LIST,
                        Vec::new(),
                    ));
                }
                rest -= 4;
                c.read_u32::<NetworkEndian>()?
            } else {
                0
            };
            let net = match family.afi() {
                Family::AFI_IP => Net::V4(Ipv4Net::decode(&mut c, rest)?),
                Family::AFI_IP6 => Net::V6(Ipv6Net::decode(&mut c, rest)?),
                _ => {
                    return Err(wire_error(
                        notification::UPDATE_MESSAGE_ERROR,
                        notification::OPTIONAL_ATTRIBUTE_ERROR,
                        Vec::new(),
                    ))
                }
            };
            list.push(Nlri { net, path_id });
        }
        Ok(list)
    }

    fn decode_mp_reach(&self, v: &[u8]) -> Result<MpReach, u8> {
        let err = notification::OPTIONAL_ATTRIBUTE_ERROR;
        if v.len() < 5 {
            return Err(err);
        }
        let afi = u16::from_be_bytes([v[0], v[1]]);
        match afi {
            Family::AFI_IP | Family::AFI_IP6 => {}
            _ => return Err(err),
        }
        let family = Family::new(afi, v[2]);
        let nexthop_len = v[3] as usize;
        if v.len() < 5 + nexthop_len {
            return Err(err);
        }
        let nh = &v[4..4 + nexthop_len];
        let (next_hop, link_local) = match nexthop_len {
            4 => (IpAddr::V4(Ipv4Addr::new(nh[0], nh[1], nh[2], nh[3])), None),
            16 | 32 => {
                let mut a = [0_u8; 16];
                a.copy_from_slice(&nh[..16]);
                let ll = if nexthop_len == 32 {
                    let mut b = [0_u8; 16];
                    b.copy_from_slice(&nh[16..]);
                    Some(Ipv6Addr::from(b))
                } else {
                    None
                };
                (IpAddr::V6(Ipv6Addr::from(a)), ll)
            }
            _ => return Err(err),
        };
        // skip the reserved octet
        let rest = &v[5 + nexthop_len..];
        let nlri = self
            .decode_nlri_list(family, rest, self.addpath_rx(family))
            .map_err(|_| err)?;
        Ok(MpReach {
            family,
            next_hop,
            link_local,
            nlri,
        })
    }

    fn decode_mp_unreach(&self, v: &[u8]) -> Result<MpUnreach, u8> {
        let err = notification::OPTIONAL_ATTRIBUTE_ERROR;
        if v.len() < 3 {
            return Err(err);
        }
        let afi = u16::from_be_bytes([v[0], v[1]]);
        match afi {
            Family::AFI_IP | Family::AFI_IP6 => {}
            _ => return Err(err),
        }
        let family = Family::new(afi, v[2]);
        let nlri = self
            .decode_nlri_list(family, &v[3..], self.addpath_rx(family))
            .map_err(|_| err)?;
        Ok(MpUnreach { family, nlri })
    }

    fn decode_open(&self, buf: &[u8]) -> Result<Open, Error> {
        let header_len_error = || {
            wire_error(
                notification::MESSAGE_HEADER_ERROR,
                notification::BAD_MESSAGE_LENGTH,
                buf[16..18].to_vec(),
            )
        };
        if buf.len() < Message::MIN_OPEN_LENGTH {
            return Err(header_len_error());
        }
        let mut c = Cursor::new(buf);
        c.set_position(Message::HEADER_LENGTH.into());
        let version = c.read_u8()?;
        if version != 4 {
            return Err(wire_error(
                notification::OPEN_MESSAGE_ERROR,
                notification::UNSUPPORTED_VERSION_NUMBER,
                vec![0, 4],
            ));
        }
        let mut as_number = c.read_u16::<NetworkEndian>()? as u32;
        let holdtime = c.read_u16::<NetworkEndian>()?;
        if holdtime == 1 || holdtime == 2 {
            return Err(wire_error(
                notification::OPEN_MESSAGE_ERROR,
                notification::UNACCEPTABLE_HOLD_TIME,
                Vec::new(),
            ));
        }
        let router_id = Ipv4Addr::from(c.read_u32::<NetworkEndian>()?);
        if !is_valid_identifier(&router_id) {
            return Err(wire_error(
                notification::OPEN_MESSAGE_ERROR,
                notification::BAD_BGP_IDENTIFIER,
                router_id.octets().to_vec(),
            ));
        }
        let param_len = c.read_u8()?;
        if buf.len() != Message::MIN_OPEN_LENGTH + param_len as usize {
            return Err(header_len_error());
        }
        let param_end = c.position() + param_len as u64;
        let mut cap = Vec::new();
        while c.position() < param_end {
            if param_end < c.position() + 2 {
                return Err(header_len_error());
            }
            let op_type = c.read_u8()?;
            let op_len = c.read_u8()?;
            if param_end < c.position() + op_len as u64 {
                return Err(header_len_error());
            }
            if op_type != 2 {
                let pos = c.position() as usize;
                return Err(wire_error(
                    notification::OPEN_MESSAGE_ERROR,
                    notification::UNSUPPORTED_OPTIONAL_PARAMETER,
                    buf[pos - 2..pos + op_len as usize].to_vec(),
                ));
            }
            let op_end = c.position() + op_len as u64;
            while c.position() < op_end {
                if op_end < c.position() + 2 {
                    return Err(header_len_error());
                }
                let cap_type = c.read_u8()?;
                let cap_len = c.read_u8()?;
                let cap_start = c.position() as usize;
                if op_end < c.position() + cap_len as u64 {
                    return Err(header_len_error());
                }
                let value = &buf[cap_start..cap_start + cap_len as usize];
                let decoded = match CAP_DESCS.get(&cap_type) {
                    Some(desc) => (desc.decode)(&mut Cursor::new(value), cap_len)?,
                    None => None,
                };
                // a known capability with a bogus length is kept opaque
                cap.push(decoded.unwrap_or_else(|| Capability::Unknown {
                    code: cap_type,
                    bin: value.to_vec(),
                }));
                c.set_position((cap_start + cap_len as usize) as u64);
            }
        }
        if as_number == Capability::TRANS_ASN as u32 {
            if let Some(asn) = cap.iter().find_map(|c| match c {
                Capability::FourOctetAsNumber(asn) => Some(*asn),
                _ => None,
            }) {
                as_number = asn;
            }
        }
        Ok(Open {
            version,
            as_number,
            holdtime,
            router_id,
            capability: cap,
        })
    }

    fn decode_update(&self, buf: &[u8]) -> Result<Update, Error> {
        let malformed = || {
            wire_error(
                notification::UPDATE_MESSAGE_ERROR,
                notification::MALFORMED_ATTRIBUTE_LIST,
                Vec::new(),
            )
        };
        let min_len = Message::HEADER_LENGTH as usize + Message::MIN_UPDATE_LENGTH;
        if buf.len() < min_len {
            return Err(wire_error(
                notification::MESSAGE_HEADER_ERROR,
                notification::BAD_MESSAGE_LENGTH,
                buf[16..18].to_vec(),
            ));
        }
        let mut pos = Message::HEADER_LENGTH as usize;
        let withdrawn_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if buf.len() < min_len + withdrawn_len {
            return Err(malformed());
        }
        let withdrawn = self.decode_nlri_list(
            Family::IPV4,
            &buf[pos..pos + withdrawn_len],
            self.addpath_rx(Family::IPV4),
        )?;
        pos += withdrawn_len;
        let attr_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if buf.len() < min_len + withdrawn_len + attr_len {
            return Err(malformed());
        }
        let attr_end = pos + attr_len;
        let mut attrs = Vec::new();
        let mut seen = FnvHashSet::default();
        while pos < attr_end {
            let head = pos;
            if attr_end < pos + 3 {
                return Err(malformed());
            }
            let flags = buf[pos];
            let code = buf[pos + 1];
            pos += 2;
            let alen = if flags & Attribute::FLAG_EXTENDED != 0 {
                if attr_end < pos + 2 {
                    return Err(malformed());
                }
                pos += 2;
                u16::from_be_bytes([buf[pos - 2], buf[pos - 1]]) as usize
            } else {
                pos += 1;
                buf[pos - 1] as usize
            };
            if attr_end < pos + alen {
                return Err(wire_error(
                    notification::UPDATE_MESSAGE_ERROR,
                    notification::ATTRIBUTE_LENGTH_ERROR,
                    buf[head..attr_end].to_vec(),
                ));
            }
            let value = &buf[pos..pos + alen];
            let whole = buf[head..pos + alen].to_vec();
            pos += alen;
            if !seen.insert(code) {
                return Err(malformed());
            }
            match ATTR_DESCS.get(&code) {
                Some(desc) => {
                    if (flags ^ desc.flags) & (Attribute::FLAG_TRANSITIVE | Attribute::FLAG_OPTIONAL)
                        > 0
                    {
                        return Err(wire_error(
                            notification::UPDATE_MESSAGE_ERROR,
                            notification::ATTRIBUTE_FLAGS_ERROR,
                            whole,
                        ));
                    }
                    let a = (desc.decode)(self, value).map_err(|subcode| {
                        wire_error(notification::UPDATE_MESSAGE_ERROR, subcode, whole)
                    })?;
                    attrs.push(a);
                }
                None => {
                    if flags & Attribute::FLAG_OPTIONAL == 0 {
                        return Err(wire_error(
                            notification::UPDATE_MESSAGE_ERROR,
                            notification::UNRECOGNIZED_WELL_KNOWN_ATTR,
                            whole,
                        ));
                    }
                    // unknown optional non-transitive attributes are quietly dropped
                    if flags & Attribute::FLAG_TRANSITIVE != 0 {
                        attrs.push(Attribute::Unknown {
                            flags: flags & !Attribute::FLAG_EXTENDED,
                            code,
                            bin: value.to_vec(),
                        });
                    }
                }
            }
        }
        let nlri = self.decode_nlri_list(
            Family::IPV4,
            &buf[attr_end..],
            self.addpath_rx(Family::IPV4),
        )?;

        let missing = |code: u8| {
            wire_error(
                notification::UPDATE_MESSAGE_ERROR,
                notification::MISSING_WELL_KNOWN_ATTR,
                vec![code],
            )
        };
        let has_mp_reach = seen.contains(&Attribute::MP_REACH);
        if !nlri.is_empty() || has_mp_reach {
            for code in &[Attribute::ORIGIN, Attribute::AS_PATH] {
                if !seen.contains(code) {
                    return Err(missing(*code));
                }
            }
            if !nlri.is_empty() && !seen.contains(&Attribute::NEXTHOP) {
                return Err(missing(Attribute::NEXTHOP));
            }
        }

        if !self.four_octet_asn {
            merge_four_octet_attributes(&mut attrs);
        }

        Ok(Update {
            withdrawn,
            attrs,
            nlri,
        })
    }

    fn decode_notification(&self, buf: &[u8]) -> Result<Message, Error> {
        let min_len = Message::HEADER_LENGTH as usize + 2;
        if buf.len() < min_len {
            return Err(wire_error(
                notification::MESSAGE_HEADER_ERROR,
                notification::BAD_MESSAGE_LENGTH,
                buf[16..18].to_vec(),
            ));
        }
        let code = buf[19];
        let subcode = buf[20];
        // the peer is closing the session either way
        if !notification::is_valid(code, subcode) {
            log::warn!("unknown notification error code {}/{}", code, subcode);
        }
        Ok(Message::Notification {
            code,
            subcode,
            data: buf[min_len..].to_vec(),
        })
    }

    /// Parses one complete message, header included.
    pub fn parse(&self, buf: &[u8]) -> Result<Message, Error> {
        let len = match check_header(buf)? {
            Some(len) => len,
            None => {
                return Err(Error::StdIoErr(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated bgp message",
                )))
            }
        };
        let buf = &buf[..len];
        let header_len_error = || {
            wire_error(
                notification::MESSAGE_HEADER_ERROR,
                notification::BAD_MESSAGE_LENGTH,
                buf[16..18].to_vec(),
            )
        };
        match buf[18] {
            Message::OPEN => Ok(Message::Open(self.decode_open(buf)?)),
            Message::UPDATE => Ok(Message::Update(self.decode_update(buf)?)),
            Message::NOTIFICATION => self.decode_notification(buf),
            Message::KEEPALIVE => {
                if len != Message::HEADER_LENGTH as usize {
                    return Err(header_len_error());
                }
                Ok(Message::Keepalive)
            }
            Message::ROUTE_REFRESH => {
                if len != Message::HEADER_LENGTH as usize + 4 {
                    return Err(header_len_error());
                }
                let afi = u16::from_be_bytes([buf[19], buf[20]]);
                Ok(Message::RouteRefresh {
                    family: Family::new(afi, buf[22]),
                })
            }
            code => Err(wire_error(
                notification::MESSAGE_HEADER_ERROR,
                notification::BAD_MESSAGE_TYPE,
                vec![code],
            )),
        }
    }

    fn do_encode(&self, item: &Message, dst: &mut BytesMut) -> Result<(), Error> {
        let pos_head = dst.len();
        dst.put_u64(u64::MAX);
        dst.put_u64(u64::MAX);
        // updated later
        let pos_header_len = dst.len();
        dst.put_u16(Message::HEADER_LENGTH);
        dst.put_u8(item.code());

        match item {
            Message::Open(open) => {
                let trans_asn = if open.as_number > u16::MAX as u32 {
                    Capability::TRANS_ASN
                } else {
                    open.as_number as u16
                };
                dst.put_u8(open.version);
                dst.put_u16(trans_asn);
                dst.put_u16(open.holdtime);
                dst.put_u32(u32::from(open.router_id));
                if open.capability.is_empty() {
                    dst.put_u8(0);
                } else {
                    let op_param_len_pos = dst.len();
                    dst.put_u8(0);
                    dst.put_u8(2); // capability parameter type
                    let param_len_pos = dst.len();
                    dst.put_u8(0);

                    let mut cap_len: usize = 0;
                    for cap in &open.capability {
                        cap_len += cap.encode(dst) as usize;
                    }
                    if cap_len + 2 > u8::MAX as usize {
                        return Err(Error::InvalidArgument(
                            "too many capabilities".to_string(),
                        ));
                    }
                    (&mut dst.as_mut()[param_len_pos..]).write_u8(cap_len as u8)?;
                    (&mut dst.as_mut()[op_param_len_pos..]).write_u8(cap_len as u8 + 2)?;
                }
            }
            Message::Update(update) => {
                let addpath = self.addpath_tx(Family::IPV4);
                let pos_withdrawn_len = dst.len();
                dst.put_u16(0);
                for n in &update.withdrawn {
                    n.encode(dst, addpath);
                }
                let withdrawn_len = dst.len() - pos_withdrawn_len - 2;
                (&mut dst.as_mut()[pos_withdrawn_len..])
                    .write_u16::<NetworkEndian>(withdrawn_len as u16)?;

                let pos_attr_len = dst.len();
                dst.put_u16(0);
                let mut attr_len = 0;
                for a in &update.attrs {
                    attr_len += a.encode(self, dst);
                }
                for a in self.four_octet_companions(&update.attrs) {
                    attr_len += a.encode(self, dst);
                }
                (&mut dst.as_mut()[pos_attr_len..]).write_u16::<NetworkEndian>(attr_len as u16)?;

                for n in &update.nlri {
                    n.encode(dst, addpath);
                }
            }
            Message::Notification {
                code,
                subcode,
                data,
            } => {
                dst.put_u8(*code);
                dst.put_u8(*subcode);
                dst.put_slice(data);
            }
            Message::Keepalive => {}
            Message::RouteRefresh { family } => {
                dst.put_u16(family.afi());
                dst.put_u8(0);
                dst.put_u8(family.safi());
            }
        }

        let len = dst.len() - pos_head;
        if len > Message::MAX_LENGTH {
            return Err(Error::UpdateTooLong { len });
        }
        (&mut dst.as_mut()[pos_header_len..]).write_u16::<NetworkEndian>(len as u16)?;
        Ok(())
    }

    /// AS4_PATH/AS4_AGGREGATOR carrying the ASNs a 2-octet session can't.
    fn four_octet_companions(&self, attrs: &[Attribute]) -> Vec<Attribute> {
        let mut v = Vec::new();
        if self.four_octet_asn {
            return v;
        }
        let has = |code: u8| attrs.iter().any(|a| a.code() == code);
        for a in attrs {
            match a {
                Attribute::AsPath(path) if path.has_four_octet() && !has(Attribute::AS4_PATH) => {
                    v.push(Attribute::As4Path(path.clone()))
                }
                Attribute::Aggregator(aggr)
                    if aggr.asn > u16::MAX as u32 && !has(Attribute::AS4_AGGREGATOR) =>
                {
                    v.push(Attribute::As4Aggregator(*aggr))
                }
                _ => {}
            }
        }
        v
    }
}

fn merge_four_octet_attributes(attrs: &mut Vec<Attribute>) {
    let as4_path = attrs.iter().find_map(|a| match a {
        Attribute::As4Path(p) => Some(p.clone()),
        _ => None,
    });
    let as4_aggr = attrs.iter().find_map(|a| match a {
        Attribute::As4Aggregator(a) => Some(*a),
        _ => None,
    });
    if as4_path.is_none() && as4_aggr.is_none() {
        return;
    }
    for a in attrs.iter_mut() {
        match a {
            Attribute::AsPath(path) => {
                if let Some(as4) = &as4_path {
                    *path = path.merge_as4(as4);
                }
            }
            Attribute::Aggregator(aggr) => {
                if aggr.asn == Capability::TRANS_ASN as u32 {
                    if let Some(as4) = as4_aggr {
                        *aggr = as4;
                    }
                }
            }
            _ => {}
        }
    }
    attrs.retain(|a| a.code() != Attribute::AS4_PATH && a.code() != Attribute::AS4_AGGREGATOR);
}

pub fn is_valid_identifier(id: &Ipv4Addr) -> bool {
    let o = id.octets();
    !(id.is_loopback() || id.is_multicast() || o[0] == 0 || *id == Ipv4Addr::BROADCAST)
}

impl Encoder<&Message> for Codec {
    type Error = Error;

    /// Encodes one message. An UPDATE that doesn't fit in 4096 bytes is
    /// rejected and `dst` is left untouched; callers split.
    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Error> {
        let pos_head = dst.len();
        dst.reserve(Message::MAX_LENGTH);
        let ret = self.do_encode(item, dst);
        if ret.is_err() {
            dst.truncate(pos_head);
        }
        ret
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match check_header(src)? {
            Some(len) => {
                let buf = src.split_to(len).freeze();
                self.parse(&buf).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
fn v4(s: &str) -> Net {
    Net::from_str(s).unwrap()
}

#[cfg(test)]
fn encode_update(codec: &mut Codec, u: Update) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4096);
    codec.encode(&Message::Update(u), &mut buf).unwrap();
    buf
}

#[test]
fn keepalive() {
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x13, 0x04]);
    buf.push(0xff);
    let mut b = BytesMut::from(&buf[..]);
    let mut codec = CodecBuilder::new().build();
    let msg = codec.decode(&mut b).unwrap().unwrap();
    assert_eq!(msg, Message::Keepalive);
    assert_eq!(b.len(), 1);
}

#[test]
fn bad_marker() {
    let mut buf = [0xff; 16].to_vec();
    buf[3] = 0;
    buf.append(&mut vec![0x00, 0x13, 0x04]);
    let mut b = BytesMut::from(&buf[..]);
    match CodecBuilder::new().build().decode(&mut b) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (1, 1));
        }
        _ => panic!("marker must be checked"),
    }
}

#[test]
fn bad_length_and_type() {
    let mut codec = CodecBuilder::new().build();
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x12, 0x04]);
    match codec.decode(&mut BytesMut::from(&buf[..])) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (1, 2))
        }
        _ => panic!("length 18 must be rejected"),
    }
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x13, 0x09]);
    match codec.decode(&mut BytesMut::from(&buf[..])) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (1, 3))
        }
        _ => panic!("type 9 must be rejected"),
    }
}

#[test]
fn partial_message() {
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x17, 0x02, 0x00]);
    let mut b = BytesMut::from(&buf[..]);
    assert!(CodecBuilder::new().build().decode(&mut b).unwrap().is_none());
    assert_eq!(b.len(), 20);
}

#[test]
fn open_as_trans() {
    let mut codec = CodecBuilder::new().build();
    let msg = Message::Open(Open {
        version: 4,
        as_number: 4_200_000_000,
        holdtime: 90,
        router_id: Ipv4Addr::new(10, 0, 0, 1),
        capability: vec![
            Capability::MultiProtocol(Family::IPV6),
            Capability::FourOctetAsNumber(4_200_000_000),
            Capability::AddPath(vec![(Family::IPV4, 3)]),
            Capability::Unknown {
                code: 250,
                bin: vec![1, 2],
            },
        ],
    });
    let mut buf = BytesMut::new();
    codec.encode(&msg, &mut buf).unwrap();
    assert_eq!(&buf[20..22], &Capability::TRANS_ASN.to_be_bytes());
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
}

#[test]
fn open_bad_identifier() {
    let codec = CodecBuilder::new().build();
    for id in &[
        Ipv4Addr::new(127, 0, 0, 1),
        Ipv4Addr::new(224, 0, 0, 5),
        Ipv4Addr::new(0, 1, 2, 3),
        Ipv4Addr::BROADCAST,
    ] {
        let mut buf = BytesMut::new();
        let msg = Message::Open(Open {
            version: 4,
            as_number: 65001,
            holdtime: 90,
            router_id: *id,
            capability: Vec::new(),
        });
        codec.clone().encode(&msg, &mut buf).unwrap();
        match codec.parse(&buf) {
            Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
                assert_eq!((code, subcode), (2, 3))
            }
            _ => panic!("{} must be rejected", id),
        }
    }
}

#[test]
fn open_bad_version() {
    let mut codec = CodecBuilder::new().build();
    let mut buf = BytesMut::new();
    let msg = Message::Open(Open {
        version: 3,
        as_number: 65001,
        holdtime: 90,
        router_id: Ipv4Addr::new(1, 1, 1, 1),
        capability: Vec::new(),
    });
    codec.encode(&msg, &mut buf).unwrap();
    match codec.decode(&mut buf) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (2, 1))
        }
        _ => panic!("version 3 must be rejected"),
    }
}

#[test]
fn withdrawn_routes() {
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x1c, 0x02, 0x00, 0x05, 8, 10, 16, 192, 168, 0x00, 0x00]);
    let mut b = BytesMut::from(&buf[..]);
    let mut codec = CodecBuilder::new().build();
    match codec.decode(&mut b).unwrap().unwrap() {
        Message::Update(u) => {
            assert_eq!(
                u.withdrawn,
                vec![Nlri::new(v4("10.0.0.0/8")), Nlri::new(v4("192.168.0.0/16"))]
            );
            assert!(u.attrs.is_empty());
            assert!(u.nlri.is_empty());
        }
        _ => panic!("update expected"),
    }
}

#[test]
fn ipv6_eor() {
    let mut buf = [0xff; 16].to_vec();
    let mut body: Vec<u8> = vec![
        0x00, 0x1e, 0x02, 0x00, 0x00, 0x00, 0x07, 0x90, 0x0f, 0x00, 0x03, 0x00, 0x02, 0x01,
    ];
    buf.append(&mut body);
    let mut b = BytesMut::from(&buf[..]);
    let mut codec = CodecBuilder::new().families(vec![Family::IPV6]).build();
    match codec.decode(&mut b).unwrap().unwrap() {
        Message::Update(u) => assert_eq!(u.end_of_rib(), Some(Family::IPV6)),
        _ => panic!("update expected"),
    }
}

#[test]
fn update_attributes() {
    let mut codec = CodecBuilder::new().build();
    let u = Update {
        withdrawn: vec![Nlri::new(v4("10.1.0.0/16"))],
        attrs: vec![
            Attribute::Origin(Attribute::ORIGIN_IGP),
            Attribute::AsPath(AsPath::from_str("65001 65002 (65003 65004)").unwrap()),
            Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
            Attribute::MultiExitDisc(10),
            Attribute::LocalPref(200),
            Attribute::AtomicAggregate,
            Attribute::Aggregator(Aggregator {
                asn: 65001,
                addr: Ipv4Addr::new(192, 0, 2, 9),
            }),
            Attribute::Communities(vec![0xfde8_0064, Attribute::COMMUNITY_NO_EXPORT]),
            Attribute::OriginatorId(Ipv4Addr::new(1, 1, 1, 1)),
            Attribute::ClusterList(vec![1, 2]),
            Attribute::LargeCommunities(vec![LargeCommunity::from_str("1:2:3").unwrap()]),
            Attribute::Unknown {
                flags: Attribute::FLAG_OPTIONAL | Attribute::FLAG_TRANSITIVE,
                code: 99,
                bin: vec![1, 2, 3],
            },
            Attribute::Unknown {
                flags: Attribute::FLAG_OPTIONAL
                    | Attribute::FLAG_TRANSITIVE
                    | Attribute::FLAG_PARTIAL,
                code: 100,
                bin: vec![4],
            },
        ],
        nlri: vec![
            Nlri::new(v4("10.2.0.0/16")),
            Nlri::new(v4("0.0.0.0/0")),
            Nlri::new(v4("10.2.3.4/32")),
        ],
    };
    let mut buf = encode_update(&mut codec, u.clone());
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Update(u));
}

#[test]
fn unknown_non_transitive_dropped() {
    let codec = CodecBuilder::new().build();
    let buf = encode_update(
        &mut codec.clone(),
        Update {
            attrs: vec![
                Attribute::Origin(0),
                Attribute::AsPath(AsPath::default()),
                Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
                Attribute::Unknown {
                    flags: Attribute::FLAG_OPTIONAL,
                    code: 200,
                    bin: vec![0; 3],
                },
            ],
            nlri: vec![Nlri::new(v4("10.0.0.0/8"))],
            ..Default::default()
        },
    );
    match codec.parse(&buf).unwrap() {
        Message::Update(u) => {
            assert_eq!(u.attrs.len(), 3);
            assert!(u.attr(200).is_none());
        }
        _ => panic!("update expected"),
    }
}

#[test]
fn missing_well_known() {
    let codec = CodecBuilder::new().build();
    let buf = encode_update(
        &mut codec.clone(),
        Update {
            attrs: vec![
                Attribute::Origin(0),
                Attribute::AsPath(AsPath::default()),
            ],
            nlri: vec![Nlri::new(v4("10.0.0.0/8"))],
            ..Default::default()
        },
    );
    match codec.parse(&buf) {
        Err(Error::InvalidMessageFormat {
            code,
            subcode,
            data,
        }) => {
            assert_eq!((code, subcode), (3, 3));
            assert_eq!(data, vec![Attribute::NEXTHOP]);
        }
        _ => panic!("missing next hop must be rejected"),
    }
}

#[test]
fn attribute_flags_error() {
    let mut buf = [0xff; 16].to_vec();
    // ORIGIN sent as optional
    buf.append(&mut vec![0x00, 0x1b, 0x02, 0x00, 0x00, 0x00, 0x04, 0xc0, 0x01, 0x01, 0x00]);
    let codec = CodecBuilder::new().build();
    match codec.parse(&buf) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (3, 4))
        }
        _ => panic!("flags must be checked"),
    }
}

#[test]
fn invalid_origin() {
    let mut buf = [0xff; 16].to_vec();
    buf.append(&mut vec![0x00, 0x1b, 0x02, 0x00, 0x00, 0x00, 0x04, 0x40, 0x01, 0x01, 0x05]);
    match CodecBuilder::new().build().parse(&buf) {
        Err(Error::InvalidMessageFormat { code, subcode, .. }) => {
            assert_eq!((code, subcode), (3, 6))
        }
        _ => panic!("origin 5 must be rejected"),
    }
}

#[test]
fn two_octet_session() {
    let mut codec = CodecBuilder::new().four_octet_asn(false).build();
    let path = AsPath::from_str("65001 4200000000 65002").unwrap();
    let u = Update {
        attrs: vec![
            Attribute::Origin(0),
            Attribute::AsPath(path.clone()),
            Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
            Attribute::Aggregator(Aggregator {
                asn: 4_200_000_000,
                addr: Ipv4Addr::new(192, 0, 2, 1),
            }),
        ],
        nlri: vec![Nlri::new(v4("10.0.0.0/8"))],
        ..Default::default()
    };
    let mut buf = encode_update(&mut codec, u.clone());
    match codec.decode(&mut buf).unwrap().unwrap() {
        Message::Update(got) => {
            assert_eq!(got.attr(Attribute::AS_PATH), Some(&Attribute::AsPath(path)));
            assert!(got.attr(Attribute::AS4_PATH).is_none());
            assert_eq!(got, u);
        }
        _ => panic!("update expected"),
    }
}

#[test]
fn addpath_nlri() {
    let mut codec = CodecBuilder::new()
        .addpath(Family::IPV4, true, true)
        .addpath(Family::IPV6, true, true)
        .build();
    let u = Update {
        withdrawn: vec![Nlri::with_path_id(v4("10.0.0.0/8"), 7)],
        attrs: vec![
            Attribute::Origin(0),
            Attribute::AsPath(AsPath::from_str("65001").unwrap()),
            Attribute::MpReach(MpReach {
                family: Family::IPV6,
                next_hop: IpAddr::from_str("2001:db8::1").unwrap(),
                link_local: Some(Ipv6Addr::from_str("fe80::1").unwrap()),
                nlri: vec![Nlri::with_path_id(Net::from_str("2001:db8::/32").unwrap(), 3)],
            }),
        ],
        nlri: Vec::new(),
    };
    let mut buf = encode_update(&mut codec, u.clone());
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Update(u));
}

#[test]
fn update_too_long() {
    let mut codec = CodecBuilder::new().build();
    let nlri: Vec<Nlri> = (0..1200u32)
        .map(|i| Nlri::new(Net::V4(Ipv4Net::new(Ipv4Addr::from(i << 8), 24))))
        .collect();
    let mut buf = BytesMut::from(&b"abc"[..]);
    let msg = Message::Update(Update {
        attrs: vec![
            Attribute::Origin(0),
            Attribute::AsPath(AsPath::default()),
            Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
        ],
        nlri,
        ..Default::default()
    });
    match codec.encode(&msg, &mut buf) {
        Err(Error::UpdateTooLong { .. }) => {}
        _ => panic!("must not fit"),
    }
    assert_eq!(&buf[..], b"abc");
}

#[test]
fn notification_subcodes() {
    assert!(notification::is_valid(6, 0));
    assert!(notification::is_valid(6, 8));
    assert!(notification::is_valid(3, 11));
    assert!(notification::is_valid(4, 0));
    assert!(!notification::is_valid(0, 0));
    assert!(!notification::is_valid(1, 0));
    assert!(!notification::is_valid(2, 5));
    assert!(!notification::is_valid(3, 7));
    assert!(!notification::is_valid(5, 1));
    assert!(!notification::is_valid(6, 9));
    assert!(!notification::is_valid(7, 1));

    // unknown codes still arrive as notifications
    let codec = CodecBuilder::new().build();
    let mut buf = BytesMut::new();
    codec
        .clone()
        .encode(&Message::notification(7, 1), &mut buf)
        .unwrap();
    buf.extend_from_slice(&[0xde, 0xad]);
    let len = buf.len() as u16;
    buf[16..18].copy_from_slice(&len.to_be_bytes());
    assert_eq!(
        codec.parse(&buf).unwrap(),
        Message::Notification {
            code: 7,
            subcode: 1,
            data: vec![0xde, 0xad],
        }
    );
}

#[test]
fn route_refresh() {
    let mut codec = CodecBuilder::new().build();
    let mut buf = BytesMut::new();
    let msg = Message::RouteRefresh {
        family: Family::IPV6,
    };
    codec.encode(&msg, &mut buf).unwrap();
    assert_eq!(buf.len(), 23);
    assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
}

#[test]
fn channel_negotiation() {
    let local = vec![
        Capability::MultiProtocol(Family::IPV4),
        Capability::MultiProtocol(Family::IPV6),
        Capability::AddPath(vec![(Family::IPV4, Capability::ADD_PATH_RECEIVE)]),
    ];
    let remote = vec![
        Capability::MultiProtocol(Family::IPV4),
        Capability::AddPath(vec![(Family::IPV4, Capability::ADD_PATH_BOTH)]),
    ];
    let v: Vec<(Family, Channel)> = create_channel(&local, &remote).collect();
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].0, Family::IPV4);
    assert!(v[0].1.addpath_rx());
    assert!(!v[0].1.addpath_tx());
}

#[test]
fn as_path_text() {
    let mut p = AsPath::from_str("1 2 (3 4) 5").unwrap();
    assert_eq!(p.len(), 4);
    assert_eq!(p.to_string(), "1 2 (3 4) 5");
    assert_eq!(p.origin_asn(), Some(5));
    p.prepend(9, 2);
    assert_eq!(p.to_string(), "9 9 1 2 (3 4) 5");
    assert!(AsPath::from_str("1 (2").is_err());
    let mut empty = AsPath::default();
    empty.prepend(7, 1);
    assert_eq!(empty.first_asn(), Some(7));
}

#[test]
fn net_helpers() {
    let n = v4("10.1.2.3/8");
    assert_eq!(n.to_string(), "10.0.0.0/8");
    assert!(n.contains(&v4("10.200.0.0/16")));
    assert!(!n.contains(&v4("11.0.0.0/16")));
    assert!(!v4("10.0.0.0/16").contains(&n));
    assert_eq!(v4("10.0.0.0/8").common_len(&v4("10.128.0.0/9")), 8);
}
