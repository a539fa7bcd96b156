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

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::codec::Encoder;

use rustyrib::bmp::{Router, RouterConfig};
use rustyrib::mirror::{MirrorClient, MirrorMetrics, RouteMirror};
use rustyrib::packet::bgp::{self, Attribute, Capability, CodecBuilder, Family, Nlri, Open};
use rustyrib::packet::bmp::{Message, PeerDownReason, PeerUp, PerPeerHeader};
use rustyrib::table::{LocRib, RouteTableClient};

const PEER: &str = "192.0.2.1";
const PEER_AS: u32 = 65001;

fn encode(msg: &bgp::Message) -> Vec<u8> {
    let mut buf = BytesMut::new();
    CodecBuilder::new().build().encode(msg, &mut buf).unwrap();
    buf.to_vec()
}

fn header() -> PerPeerHeader {
    PerPeerHeader::new(PEER.parse().unwrap(), PEER_AS, Ipv4Addr::new(10, 0, 0, 2))
}

fn open(asn: u32, id: Ipv4Addr) -> Vec<u8> {
    encode(&bgp::Message::Open(Open {
        version: 4,
        as_number: asn,
        holdtime: 90,
        router_id: id,
        capability: vec![
            Capability::MultiProtocol(Family::IPV4),
            Capability::FourOctetAsNumber(asn),
        ],
    }))
}

fn peer_up() -> Message {
    Message::PeerUp(PeerUp {
        header: header(),
        local_address: "192.0.2.254".parse().unwrap(),
        local_port: 179,
        remote_port: 33000,
        sent_open: open(65000, Ipv4Addr::new(10, 0, 0, 1)),
        received_open: open(PEER_AS, Ipv4Addr::new(10, 0, 0, 2)),
        information: Vec::new(),
    })
}

fn announce(prefixes: &[&str]) -> Message {
    Message::RouteMonitoring {
        header: header(),
        update: encode(&bgp::Message::Update(bgp::Update {
            attrs: vec![
                Attribute::Origin(Attribute::ORIGIN_IGP),
                Attribute::AsPath("65001 65100".parse().unwrap()),
                Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
            ],
            nlri: prefixes
                .iter()
                .map(|p| Nlri::new(p.parse().unwrap()))
                .collect(),
            ..Default::default()
        })),
    }
}

fn withdraw(prefix: &str) -> Message {
    Message::RouteMonitoring {
        header: header(),
        update: encode(&bgp::Message::Update(bgp::Update {
            withdrawn: vec![Nlri::new(prefix.parse().unwrap())],
            ..Default::default()
        })),
    }
}

fn collector(name: &'static str, mirror: &Arc<RouteMirror<&'static str>>) -> Router {
    let r = Router::new(
        "198.51.100.1".parse().unwrap(),
        11019,
        RouterConfig::default(),
        None,
    );
    r.register_client(
        Family::IPV4,
        Arc::new(MirrorClient::new(mirror.clone(), name)),
    );
    r
}

// One router seen through two collectors: the mirror keeps each route
// until the last feed withdraws it.
#[test]
fn redundant_feeds() {
    let rib = Arc::new(LocRib::new("mirror"));
    let mirror = Arc::new(RouteMirror::new(rib.clone()));
    let feeds = [collector("a", &mirror), collector("b", &mirror)];

    for r in &feeds {
        r.process(peer_up());
        r.process(announce(&["10.0.0.0/8", "172.16.0.0/12"]));
    }
    assert_eq!(
        mirror.metrics(),
        MirrorMetrics {
            rib_name: "mirror".to_string(),
            unique_route_count: 2,
            routes_with_single_source_count: 0,
        }
    );
    assert_eq!(rib.route_count(), 2);
    assert_eq!(
        rib.get(&"10.0.0.0/8".parse().unwrap())
            .unwrap()
            .paths()
            .len(),
        1
    );

    feeds[0].process(withdraw("10.0.0.0/8"));
    assert_eq!(rib.route_count(), 2);
    assert_eq!(mirror.metrics().routes_with_single_source_count, 1);

    // the first feed flaps; nothing disappears from the mirror
    feeds[0].process(Message::PeerDown {
        header: header(),
        reason: PeerDownReason::RemoteNoData,
    });
    assert_eq!(rib.route_count(), 2);
    assert_eq!(mirror.metrics().routes_with_single_source_count, 2);

    feeds[1].process(withdraw("10.0.0.0/8"));
    assert_eq!(rib.route_count(), 1);
    assert!(rib.get(&"10.0.0.0/8".parse().unwrap()).is_none());

    feeds[1].process(Message::PeerDown {
        header: header(),
        reason: PeerDownReason::Deconfigured,
    });
    assert_eq!(rib.route_count(), 0);
    assert_eq!(mirror.metrics().unique_route_count, 0);
}

#[test]
fn drop_collector() {
    let rib = Arc::new(LocRib::new("mirror"));
    let mirror = Arc::new(RouteMirror::new(rib.clone()));
    let a = collector("a", &mirror);
    let b = collector("b", &mirror);
    a.process(peer_up());
    a.process(announce(&["10.0.0.0/8"]));
    b.process(peer_up());
    b.process(announce(&["10.0.0.0/8", "10.1.0.0/16"]));

    mirror.drop_all_by_src(&"b");
    assert_eq!(rib.route_count(), 1);
    assert!(rib.get(&"10.0.0.0/8".parse().unwrap()).is_some());
}
