// Copyright (C) 2021 The RustyBGP Authors.
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
use std::io::{self, Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::packet::bgp;

fn truncated(what: &'static str) -> impl Fn(io::Error) -> Error {
    move |_| Error::InvalidBmpFormat(format!("truncated {}", what))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u8,
    pub length: u32,
    pub msg_type: u8,
}

impl CommonHeader {
    pub const LENGTH: usize = 6;

    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let version = c.read_u8().map_err(truncated("common header"))?;
        let length = c
            .read_u32::<NetworkEndian>()
            .map_err(truncated("common header"))?;
        let msg_type = c.read_u8().map_err(truncated("common header"))?;
        Ok(CommonHeader {
            version,
            length,
            msg_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerPeerHeader {
    pub peer_type: u8,
    pub flags: u8,
    pub distinguisher: u64,
    pub peer_address: IpAddr,
    pub peer_as: u32,
    pub peer_id: Ipv4Addr,
    pub timestamp: u32,
    pub timestamp_micro: u32,
}

impl PerPeerHeader {
    pub const LENGTH: usize = 42;

    pub const FLAG_IPV6: u8 = 0x80;
    pub const FLAG_POST_POLICY: u8 = 0x40;
    pub const FLAG_TWO_OCTET_AS: u8 = 0x20;

    pub fn new(peer_address: IpAddr, peer_as: u32, peer_id: Ipv4Addr) -> Self {
        let flags = if peer_address.is_ipv6() {
            PerPeerHeader::FLAG_IPV6
        } else {
            0
        };
        PerPeerHeader {
            peer_type: 0,
            flags,
            distinguisher: 0,
            peer_address,
            peer_as,
            peer_id,
            timestamp: 0,
            timestamp_micro: 0,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.flags & PerPeerHeader::FLAG_IPV6 != 0
    }

    /// L flag: the monitored routes are post-policy.
    pub fn is_post_policy(&self) -> bool {
        self.flags & PerPeerHeader::FLAG_POST_POLICY != 0
    }

    /// A flag: the embedded messages use 2-octet AS numbers.
    pub fn is_two_octet_as(&self) -> bool {
        self.flags & PerPeerHeader::FLAG_TWO_OCTET_AS != 0
    }

    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let e = truncated("per peer header");
        let peer_type = c.read_u8().map_err(&e)?;
        let flags = c.read_u8().map_err(&e)?;
        let distinguisher = c.read_u64::<NetworkEndian>().map_err(&e)?;
        let mut addr = [0_u8; 16];
        c.read_exact(&mut addr).map_err(&e)?;
        let peer_address = if flags & PerPeerHeader::FLAG_IPV6 != 0 {
            IpAddr::V6(Ipv6Addr::from(addr))
        } else {
            IpAddr::V4(Ipv4Addr::new(addr[12], addr[13], addr[14], addr[15]))
        };
        let peer_as = c.read_u32::<NetworkEndian>().map_err(&e)?;
        let peer_id = Ipv4Addr::from(c.read_u32::<NetworkEndian>().map_err(&e)?);
        let timestamp = c.read_u32::<NetworkEndian>().map_err(&e)?;
        let timestamp_micro = c.read_u32::<NetworkEndian>().map_err(&e)?;
        Ok(PerPeerHeader {
            peer_type,
            flags,
            distinguisher,
            peer_address,
            peer_as,
            peer_id,
            timestamp,
            timestamp_micro,
        })
    }

    fn encode(&self, c: &mut BytesMut) {
        c.put_u8(self.peer_type);
        c.put_u8(self.flags);
        c.put_u64(self.distinguisher);
        encode_ip(c, &self.peer_address);
        c.put_u32(self.peer_as);
        c.put_slice(&self.peer_id.octets());
        c.put_u32(self.timestamp);
        c.put_u32(self.timestamp_micro);
    }
}

fn encode_ip(c: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(addr) => {
            c.put_slice(&[0; 12]);
            c.put_slice(&addr.octets());
        }
        IpAddr::V6(addr) => c.put_slice(&addr.octets()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationTlv {
    pub info_type: u16,
    pub value: Vec<u8>,
}

impl InformationTlv {
    pub const STRING: u16 = 0;
    pub const SYS_DESCR: u16 = 1;
    pub const SYS_NAME: u16 = 2;

    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let e = truncated("information tlv");
        let info_type = c.read_u16::<NetworkEndian>().map_err(&e)?;
        let len = c.read_u16::<NetworkEndian>().map_err(&e)?;
        let mut value = vec![0; len as usize];
        c.read_exact(&mut value).map_err(&e)?;
        Ok(InformationTlv { info_type, value })
    }

    fn decode_all(c: &mut Cursor<&[u8]>) -> Result<Vec<Self>, Error> {
        let mut v = Vec::new();
        while (c.position() as usize) < c.get_ref().len() {
            v.push(InformationTlv::decode(c)?);
        }
        Ok(v)
    }

    fn encode(&self, c: &mut BytesMut) {
        c.put_u16(self.info_type);
        c.put_u16(self.value.len() as u16);
        c.put_slice(&self.value);
    }
}

impl std::fmt::Display for InformationTlv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.info_type, String::from_utf8_lossy(&self.value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatValue {
    Counter(u32),
    Gauge(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub stat_type: u16,
    pub value: StatValue,
}

impl Stat {
    pub const REJECTED_PREFIXES: u16 = 0;
    pub const DUPLICATE_PREFIX_ADVERTISEMENTS: u16 = 1;
    pub const DUPLICATE_WITHDRAWS: u16 = 2;
    pub const ADJ_RIB_IN_ROUTES: u16 = 7;
    pub const LOC_RIB_ROUTES: u16 = 8;

    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let tlv = InformationTlv::decode(c)?;
        let v = &tlv.value;
        let value = match v.len() {
            4 => StatValue::Counter(u32::from_be_bytes([v[0], v[1], v[2], v[3]])),
            8 => StatValue::Gauge(u64::from_be_bytes([
                v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7],
            ])),
            n => {
                return Err(Error::InvalidBmpFormat(format!(
                    "stat {} has length {}",
                    tlv.info_type, n
                )))
            }
        };
        Ok(Stat {
            stat_type: tlv.info_type,
            value,
        })
    }

    fn encode(&self, c: &mut BytesMut) {
        c.put_u16(self.stat_type);
        match self.value {
            StatValue::Counter(v) => {
                c.put_u16(4);
                c.put_u32(v);
            }
            StatValue::Gauge(v) => {
                c.put_u16(8);
                c.put_u64(v);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerDownReason {
    LocalNotification(Vec<u8>),
    LocalFsm(u16),
    RemoteNotification(Vec<u8>),
    RemoteNoData,
    Deconfigured,
    Unknown(u8),
}

impl PeerDownReason {
    fn code(&self) -> u8 {
        match self {
            PeerDownReason::LocalNotification(_) => 1,
            PeerDownReason::LocalFsm(_) => 2,
            PeerDownReason::RemoteNotification(_) => 3,
            PeerDownReason::RemoteNoData => 4,
            PeerDownReason::Deconfigured => 5,
            PeerDownReason::Unknown(code) => *code,
        }
    }

    fn decode(c: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let code = c.read_u8().map_err(truncated("peer down reason"))?;
        let mut rest = Vec::new();
        c.read_to_end(&mut rest)?;
        Ok(match code {
            1 => PeerDownReason::LocalNotification(rest),
            2 => {
                if rest.len() < 2 {
                    return Err(Error::InvalidBmpFormat("truncated fsm event".to_string()));
                }
                PeerDownReason::LocalFsm(u16::from_be_bytes([rest[0], rest[1]]))
            }
            3 => PeerDownReason::RemoteNotification(rest),
            4 => PeerDownReason::RemoteNoData,
            5 => PeerDownReason::Deconfigured,
            code => PeerDownReason::Unknown(code),
        })
    }

    fn encode(&self, c: &mut BytesMut) {
        c.put_u8(self.code());
        match self {
            PeerDownReason::LocalNotification(pdu) | PeerDownReason::RemoteNotification(pdu) => {
                c.put_slice(pdu)
            }
            PeerDownReason::LocalFsm(event) => c.put_u16(*event),
            _ => {}
        }
    }
}

impl std::fmt::Display for PeerDownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codec = bgp::CodecBuilder::new().build();
        match self {
            PeerDownReason::LocalNotification(pdu) | PeerDownReason::RemoteNotification(pdu) => {
                let side = if matches!(self, PeerDownReason::LocalNotification(_)) {
                    "local"
                } else {
                    "remote"
                };
                match codec.parse(pdu) {
                    Ok(bgp::Message::Notification { code, subcode, .. }) => {
                        write!(f, "{} notification {}/{}", side, code, subcode)
                    }
                    _ => write!(f, "{} notification", side),
                }
            }
            PeerDownReason::LocalFsm(event) => write!(f, "local fsm event {}", event),
            PeerDownReason::RemoteNoData => write!(f, "remote closed"),
            PeerDownReason::Deconfigured => write!(f, "peer deconfigured"),
            PeerDownReason::Unknown(code) => write!(f, "unknown reason {}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUp {
    pub header: PerPeerHeader,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub sent_open: Vec<u8>,
    pub received_open: Vec<u8>,
    pub information: Vec<InformationTlv>,
}

impl PeerUp {
    fn decode_open(c: &mut Cursor<&[u8]>) -> Result<Vec<u8>, Error> {
        let start = c.position() as usize;
        let buf = *c.get_ref();
        if buf.len() < start + bgp::Message::MIN_OPEN_LENGTH {
            return Err(Error::InvalidBmpFormat("truncated open message".to_string()));
        }
        let len = u16::from_be_bytes([buf[start + 16], buf[start + 17]]) as usize;
        if len < bgp::Message::MIN_OPEN_LENGTH || buf.len() < start + len {
            return Err(Error::InvalidBmpFormat(format!(
                "bogus open message length {}",
                len
            )));
        }
        c.set_position((start + len) as u64);
        Ok(buf[start..start + len].to_vec())
    }

    /// Decodes both OPEN messages and returns (sent, received).
    pub fn opens(&self) -> Result<(bgp::Open, bgp::Open), Error> {
        let codec = bgp::CodecBuilder::new().build();
        let f = |buf: &[u8]| match codec.parse(buf)? {
            bgp::Message::Open(open) => Ok(open),
            _ => Err(Error::InvalidBmpFormat("open message expected".to_string())),
        };
        Ok((f(&self.sent_open)?, f(&self.received_open)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RouteMonitoring {
        header: PerPeerHeader,
        update: Vec<u8>,
    },
    StatisticsReport {
        header: PerPeerHeader,
        stats: Vec<Stat>,
    },
    PeerDown {
        header: PerPeerHeader,
        reason: PeerDownReason,
    },
    PeerUp(PeerUp),
    Initiation(Vec<InformationTlv>),
    Termination(Vec<InformationTlv>),
    RouteMirroring {
        header: PerPeerHeader,
        tlvs: Vec<InformationTlv>,
    },
}

impl Message {
    pub const VERSION: u8 = 3;

    pub const ROUTE_MONITORING: u8 = 0;
    pub const STATISTICS_REPORT: u8 = 1;
    pub const PEER_DOWN: u8 = 2;
    pub const PEER_UP: u8 = 3;
    pub const INITIATION: u8 = 4;
    pub const TERMINATION: u8 = 5;
    pub const ROUTE_MIRRORING: u8 = 6;

    pub fn code(&self) -> u8 {
        match self {
            Message::RouteMonitoring { .. } => Message::ROUTE_MONITORING,
            Message::StatisticsReport { .. } => Message::STATISTICS_REPORT,
            Message::PeerDown { .. } => Message::PEER_DOWN,
            Message::PeerUp(_) => Message::PEER_UP,
            Message::Initiation(_) => Message::INITIATION,
            Message::Termination(_) => Message::TERMINATION,
            Message::RouteMirroring { .. } => Message::ROUTE_MIRRORING,
        }
    }

    pub fn per_peer_header(&self) -> Option<&PerPeerHeader> {
        match self {
            Message::RouteMonitoring { header, .. }
            | Message::StatisticsReport { header, .. }
            | Message::PeerDown { header, .. }
            | Message::RouteMirroring { header, .. } => Some(header),
            Message::PeerUp(up) => Some(&up.header),
            _ => None,
        }
    }

    /// Parses one complete BMP message. Anything shorter than what the
    /// headers announce is an error.
    pub fn parse(buf: &[u8]) -> Result<Message, Error> {
        let mut c = Cursor::new(buf);
        let header = CommonHeader::decode(&mut c)?;
        if header.version != Message::VERSION {
            return Err(Error::InvalidBmpFormat(format!(
                "unsupported version {}",
                header.version
            )));
        }
        let length = header.length as usize;
        if length < CommonHeader::LENGTH || buf.len() < length {
            return Err(Error::InvalidBmpFormat(format!("bogus length {}", length)));
        }
        let mut c = Cursor::new(&buf[..length]);
        c.set_position(CommonHeader::LENGTH as u64);

        match header.msg_type {
            Message::ROUTE_MONITORING => {
                let header = PerPeerHeader::decode(&mut c)?;
                let pos = c.position() as usize;
                let update = c.get_ref()[pos..].to_vec();
                if update.len() < bgp::Message::HEADER_LENGTH as usize {
                    return Err(Error::InvalidBmpFormat("truncated bgp update".to_string()));
                }
                Ok(Message::RouteMonitoring { header, update })
            }
            Message::STATISTICS_REPORT => {
                let header = PerPeerHeader::decode(&mut c)?;
                let count = c
                    .read_u32::<NetworkEndian>()
                    .map_err(truncated("stats count"))?;
                let mut stats = Vec::new();
                for _ in 0..count {
                    stats.push(Stat::decode(&mut c)?);
                }
                Ok(Message::StatisticsReport { header, stats })
            }
            Message::PEER_DOWN => {
                let header = PerPeerHeader::decode(&mut c)?;
                let reason = PeerDownReason::decode(&mut c)?;
                Ok(Message::PeerDown { header, reason })
            }
            Message::PEER_UP => {
                let header = PerPeerHeader::decode(&mut c)?;
                let e = truncated("peer up");
                let mut addr = [0_u8; 16];
                c.read_exact(&mut addr).map_err(&e)?;
                let local_address = if header.is_ipv6() {
                    IpAddr::V6(Ipv6Addr::from(addr))
                } else {
                    IpAddr::V4(Ipv4Addr::new(addr[12], addr[13], addr[14], addr[15]))
                };
                let local_port = c.read_u16::<NetworkEndian>().map_err(&e)?;
                let remote_port = c.read_u16::<NetworkEndian>().map_err(&e)?;
                let sent_open = PeerUp::decode_open(&mut c)?;
                let received_open = PeerUp::decode_open(&mut c)?;
                let information = InformationTlv::decode_all(&mut c)?;
                Ok(Message::PeerUp(PeerUp {
                    header,
                    local_address,
                    local_port,
                    remote_port,
                    sent_open,
                    received_open,
                    information,
                }))
            }
            Message::INITIATION => Ok(Message::Initiation(InformationTlv::decode_all(&mut c)?)),
            Message::TERMINATION => Ok(Message::Termination(InformationTlv::decode_all(&mut c)?)),
            Message::ROUTE_MIRRORING => {
                let header = PerPeerHeader::decode(&mut c)?;
                let tlvs = InformationTlv::decode_all(&mut c)?;
                Ok(Message::RouteMirroring { header, tlvs })
            }
            t => Err(Error::InvalidBmpFormat(format!("unexpected type {}", t))),
        }
    }
}

#[derive(Default)]
pub struct BmpCodec;

impl BmpCodec {
    pub fn new() -> Self {
        BmpCodec
    }
}

impl Encoder<&Message> for BmpCodec {
    type Error = Error;

    fn encode(&mut self, item: &Message, c: &mut BytesMut) -> Result<(), Error> {
        let pos_first = c.len();
        c.put_u8(Message::VERSION);
        let pos_len = c.len();
        c.put_u32(0);
        c.put_u8(item.code());

        match item {
            Message::RouteMonitoring { header, update } => {
                header.encode(c);
                c.put_slice(update);
            }
            Message::StatisticsReport { header, stats } => {
                header.encode(c);
                c.put_u32(stats.len() as u32);
                for s in stats {
                    s.encode(c);
                }
            }
            Message::PeerDown { header, reason } => {
                header.encode(c);
                reason.encode(c);
            }
            Message::PeerUp(up) => {
                up.header.encode(c);
                encode_ip(c, &up.local_address);
                c.put_u16(up.local_port);
                c.put_u16(up.remote_port);
                c.put_slice(&up.sent_open);
                c.put_slice(&up.received_open);
                for tlv in &up.information {
                    tlv.encode(c);
                }
            }
            Message::Initiation(tlvs) | Message::Termination(tlvs) => {
                for tlv in tlvs {
                    tlv.encode(c);
                }
            }
            Message::RouteMirroring { header, tlvs } => {
                header.encode(c);
                for tlv in tlvs {
                    tlv.encode(c);
                }
            }
        }

        let len = c.len() - pos_first;
        (&mut c.as_mut()[pos_len..]).write_u32::<NetworkEndian>(len as u32)?;
        Ok(())
    }
}

impl Decoder for BmpCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < CommonHeader::LENGTH {
            return Ok(None);
        }
        if src[0] != Message::VERSION {
            return Err(Error::InvalidBmpFormat(format!(
                "unsupported version {}",
                src[0]
            )));
        }
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length < CommonHeader::LENGTH {
            return Err(Error::InvalidBmpFormat(format!("bogus length {}", length)));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        let buf = src.split_to(length);
        Message::parse(&buf).map(Some)
    }
}

#[cfg(test)]
fn sample_open(asn: u32, id: Ipv4Addr) -> Vec<u8> {
    let mut buf = BytesMut::new();
    bgp::CodecBuilder::new()
        .build()
        .encode(
            &bgp::Message::Open(bgp::Open {
                version: 4,
                as_number: asn,
                holdtime: 90,
                router_id: id,
                capability: vec![
                    bgp::Capability::MultiProtocol(bgp::Family::IPV4),
                    bgp::Capability::FourOctetAsNumber(asn),
                ],
            }),
            &mut buf,
        )
        .unwrap();
    buf.to_vec()
}

#[test]
fn route_monitoring_without_peer_header() {
    assert!(Message::parse(&[3, 0, 0, 0, 6, 0]).is_err());
    let mut b = BytesMut::from(&[3, 0, 0, 0, 6, 0][..]);
    assert!(BmpCodec::new().decode(&mut b).is_err());
}

#[test]
fn bad_version() {
    let mut b = BytesMut::from(&[2, 0, 0, 0, 6, 4][..]);
    assert!(BmpCodec::new().decode(&mut b).is_err());
}

#[test]
fn partial_input() {
    let msg = Message::Initiation(vec![InformationTlv {
        info_type: InformationTlv::SYS_NAME,
        value: b"core01".to_vec(),
    }]);
    let mut codec = BmpCodec::new();
    let mut full = BytesMut::new();
    codec.encode(&msg, &mut full).unwrap();
    let mut b = BytesMut::from(&full[..full.len() - 1]);
    assert!(codec.decode(&mut b).unwrap().is_none());
    b.put_u8(*full.last().unwrap());
    assert_eq!(codec.decode(&mut b).unwrap(), Some(msg));
    assert!(b.is_empty());
}

#[test]
fn per_peer_header_flags() {
    let mut h = PerPeerHeader::new(
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        65001,
        Ipv4Addr::new(1, 1, 1, 1),
    );
    h.flags |= PerPeerHeader::FLAG_POST_POLICY;
    assert!(h.is_ipv6());
    assert!(h.is_post_policy());
    assert!(!h.is_two_octet_as());

    let mut buf = BytesMut::new();
    h.encode(&mut buf);
    assert_eq!(buf.len(), PerPeerHeader::LENGTH);
    let mut c = Cursor::new(&buf[..]);
    assert_eq!(PerPeerHeader::decode(&mut c).unwrap(), h);
}

#[test]
fn peer_up() {
    let up = PeerUp {
        header: PerPeerHeader::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            65002,
            Ipv4Addr::new(2, 2, 2, 2),
        ),
        local_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        local_port: 179,
        remote_port: 40000,
        sent_open: sample_open(65001, Ipv4Addr::new(1, 1, 1, 1)),
        received_open: sample_open(65002, Ipv4Addr::new(2, 2, 2, 2)),
        information: vec![InformationTlv {
            info_type: InformationTlv::STRING,
            value: b"hello".to_vec(),
        }],
    };
    let mut codec = BmpCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(&Message::PeerUp(up.clone()), &mut buf).unwrap();
    match codec.decode(&mut buf).unwrap().unwrap() {
        Message::PeerUp(got) => {
            let (sent, received) = got.opens().unwrap();
            assert_eq!(sent.as_number, 65001);
            assert_eq!(received.router_id, Ipv4Addr::new(2, 2, 2, 2));
            assert_eq!(got, up);
        }
        _ => panic!("peer up expected"),
    }
}

#[test]
fn peer_up_truncated_open() {
    let mut open = sample_open(65001, Ipv4Addr::new(1, 1, 1, 1));
    open.truncate(open.len() - 2);
    let up = Message::PeerUp(PeerUp {
        header: PerPeerHeader::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            65002,
            Ipv4Addr::new(2, 2, 2, 2),
        ),
        local_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        local_port: 179,
        remote_port: 40000,
        sent_open: open.clone(),
        received_open: Vec::new(),
        information: Vec::new(),
    });
    let mut buf = BytesMut::new();
    BmpCodec::new().encode(&up, &mut buf).unwrap();
    assert!(Message::parse(&buf).is_err());
}

#[test]
fn stats_and_peer_down() {
    let header = PerPeerHeader::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        65002,
        Ipv4Addr::new(2, 2, 2, 2),
    );
    let mut notification = BytesMut::new();
    bgp::CodecBuilder::new()
        .build()
        .encode(&bgp::Message::notification(6, 2), &mut notification)
        .unwrap();
    let msgs = vec![
        Message::StatisticsReport {
            header: header.clone(),
            stats: vec![
                Stat {
                    stat_type: Stat::REJECTED_PREFIXES,
                    value: StatValue::Counter(3),
                },
                Stat {
                    stat_type: Stat::ADJ_RIB_IN_ROUTES,
                    value: StatValue::Gauge(800_000),
                },
            ],
        },
        Message::PeerDown {
            header: header.clone(),
            reason: PeerDownReason::RemoteNotification(notification.to_vec()),
        },
        Message::PeerDown {
            header: header.clone(),
            reason: PeerDownReason::LocalFsm(7),
        },
        Message::Termination(vec![InformationTlv {
            info_type: 1,
            value: vec![0, 2],
        }]),
        Message::RouteMirroring {
            header,
            tlvs: vec![InformationTlv {
                info_type: 1,
                value: vec![0, 1],
            }],
        },
    ];
    let mut codec = BmpCodec::new();
    let mut buf = BytesMut::new();
    for m in &msgs {
        codec.encode(m, &mut buf).unwrap();
    }
    for m in &msgs {
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap(), m);
    }
    assert_eq!(
        PeerDownReason::RemoteNotification(notification.to_vec()).to_string(),
        "remote notification 6/2"
    );
}

#[test]
fn bad_stat_length() {
    let mut buf = BytesMut::new();
    BmpCodec::new()
        .encode(
            &Message::StatisticsReport {
                header: PerPeerHeader::new(
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    65002,
                    Ipv4Addr::new(2, 2, 2, 2),
                ),
                stats: Vec::new(),
            },
            &mut buf,
        )
        .unwrap();
    // claim one stat of length 3
    let count_pos = CommonHeader::LENGTH + PerPeerHeader::LENGTH;
    buf[count_pos + 3] = 1;
    buf.put_slice(&[0, 0, 0, 3, 1, 2, 3]);
    let len = buf.len() as u32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    assert!(Message::parse(&buf).is_err());
}
