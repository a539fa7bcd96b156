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

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use rustyrib::fsm::{CollisionDomain, Connection, Event, Fsm, FsmHandle, Role, State};
use rustyrib::packet::bgp::{notification, AsPath, Capability, CodecBuilder, Message, Open};
use rustyrib::peer::PeerConfig;
use rustyrib::table::vrf::{RouteDistinguisher, DEFAULT_VRF};
use rustyrib::table::{BgpPath, Path, RouteTableClient, VrfRegistry};

const A: &str = "192.0.2.1";
const B: &str = "192.0.2.2";

fn speaker(peer: &str, peer_as: u32, local_as: u32, id: Ipv4Addr) -> Arc<PeerConfig> {
    let vrf = VrfRegistry::new()
        .create_vrf(DEFAULT_VRF, RouteDistinguisher::default())
        .unwrap();
    let mut c = PeerConfig::new(peer.parse().unwrap(), peer_as, local_as, id, vrf);
    // stay in Idle once the session is gone
    c.reconnect_interval = Duration::from_secs(0);
    Arc::new(c)
}

fn start(config: Arc<PeerConfig>) -> FsmHandle {
    let (fsm, handle) = Fsm::new(config, Role::Passive, Arc::new(CollisionDomain::default()));
    tokio::spawn(fsm.run());
    handle
}

fn addr(ip: &str, port: u16) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), port)
}

async fn wait_state(rx: &mut watch::Receiver<State>, state: State) {
    while *rx.borrow() != state {
        rx.changed().await.unwrap();
    }
}

#[tokio::test]
async fn hold_timer_expires() {
    tokio::time::pause();

    let handle = start(speaker(B, 65001, 65000, Ipv4Addr::new(1, 1, 1, 1)));
    let mut st = handle.subscribe();
    let (local, remote) = tokio::io::duplex(1 << 16);
    handle.send(Event::TcpConnectionConfirmed(Connection::new(
        local,
        addr(A, 179),
        addr(B, 40000),
    )));

    let mut framed = Framed::new(remote, CodecBuilder::new().build());
    assert!(matches!(
        framed.next().await.unwrap().unwrap(),
        Message::Open(_)
    ));
    framed
        .send(&Message::Open(Open {
            version: 4,
            as_number: 65001,
            holdtime: 90,
            router_id: Ipv4Addr::new(2, 2, 2, 2),
            capability: vec![Capability::FourOctetAsNumber(65001)],
        }))
        .await
        .unwrap();
    framed.send(&Message::Keepalive).await.unwrap();
    wait_state(&mut st, State::Established).await;
    let established = Instant::now();

    // the remote side goes silent
    let mut keepalives = 0;
    loop {
        match framed.next().await.unwrap().unwrap() {
            Message::Keepalive => keepalives += 1,
            Message::Notification { code, subcode, .. } => {
                assert_eq!(
                    (code, subcode),
                    (notification::HOLD_TIMER_EXPIRED, 0)
                );
                break;
            }
            _ => {}
        }
    }
    let elapsed = established.elapsed();
    assert!(elapsed >= Duration::from_secs(90), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(92), "{:?}", elapsed);
    assert!(keepalives >= 2);

    wait_state(&mut st, State::Idle).await;
    assert_eq!(handle.info().connect_retry_counter(), 1);
    assert_eq!(handle.info().last_down_reason(), "hold timer expired");
}

#[tokio::test]
async fn exchange_routes() {
    let a_config = speaker(B, 65001, 65000, Ipv4Addr::new(1, 1, 1, 1));
    let b_config = speaker(A, 65000, 65001, Ipv4Addr::new(2, 2, 2, 2));
    let a_rib = a_config.vrf.ipv4_unicast_rib();
    let b_rib = b_config.vrf.ipv4_unicast_rib();

    // learned by A from a third speaker
    let upstream: IpAddr = "203.0.113.1".parse().unwrap();
    let mut p = BgpPath::new(upstream, upstream);
    p.as_path = "65010".parse().unwrap();
    p.ebgp = true;
    a_rib
        .add_path(&"10.0.0.0/8".parse().unwrap(), Arc::new(Path::Bgp(p)))
        .unwrap();

    let a = start(a_config);
    let b = start(b_config);
    let (mut a_st, mut b_st) = (a.subscribe(), b.subscribe());
    let (a_io, b_io) = tokio::io::duplex(1 << 16);
    a.send(Event::TcpConnectionConfirmed(Connection::new(
        a_io,
        addr(A, 179),
        addr(B, 40000),
    )));
    b.send(Event::TcpConnectionConfirmed(Connection::new(
        b_io,
        addr(B, 40000),
        addr(A, 179),
    )));
    wait_state(&mut a_st, State::Established).await;
    wait_state(&mut b_st, State::Established).await;
    assert_eq!(a.info().remote_id(), Ipv4Addr::new(2, 2, 2, 2));
    assert_eq!(b.info().remote_asn(), 65000);

    while b_rib.route_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let route = b_rib.get(&"10.0.0.0/8".parse().unwrap()).unwrap();
    let best = route.best_path().unwrap().bgp().unwrap();
    assert_eq!(best.as_path, "65000 65010".parse::<AsPath>().unwrap());
    assert_eq!(best.next_hop, A.parse::<IpAddr>().unwrap());
    assert_eq!(best.source, A.parse::<IpAddr>().unwrap());

    // B must not reflect the route back to its origin
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        a_rib
            .get(&"10.0.0.0/8".parse().unwrap())
            .unwrap()
            .paths()
            .len(),
        1
    );

    let net = "10.0.0.0/8".parse().unwrap();
    let original = a_rib.get(&net).unwrap().paths()[0].clone();
    assert!(a_rib.remove_path(&net, &original));
    while b_rib.route_count() != 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    a.send(Event::ManualStop);
    wait_state(&mut a_st, State::Idle).await;
    wait_state(&mut b_st, State::Idle).await;
    assert_eq!(b.info().last_down_reason(), "notification 6/2 received");
}
