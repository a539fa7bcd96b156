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

use fnv::FnvHashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;

use crate::error::Error;
use crate::fsm::apply_update;
use crate::packet::bgp::{self, Capability, Codec, CodecBuilder, Family};
use crate::packet::bmp::{BmpCodec, InformationTlv, Message, PeerUp, PerPeerHeader, Stat};
use crate::table::adj_rib_in::AdjRibInOptions;
use crate::table::client::RouteTableClient;
use crate::table::vrf::RouteDistinguisher;
use crate::table::{AdjRibIn, FilterChain, LocRib, Vrf, VrfRegistry};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterConfig {
    pub passive: bool,
    /// Route monitoring from peers in these ASes is dropped.
    pub ignore_peer_asns: Vec<u32>,
    pub ignore_pre_policy: bool,
    pub ignore_post_policy: bool,
}

#[derive(Default, Debug)]
struct Counters {
    route_monitoring: AtomicU64,
    statistics_report: AtomicU64,
    peer_down: AtomicU64,
    peer_up: AtomicU64,
    initiation: AtomicU64,
    termination: AtomicU64,
    route_mirroring: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub route_monitoring: u64,
    pub statistics_report: u64,
    pub peer_down: u64,
    pub peer_up: u64,
    pub initiation: u64,
    pub termination: u64,
    pub route_mirroring: u64,
}

impl From<&Counters> for RouterStats {
    fn from(c: &Counters) -> Self {
        RouterStats {
            route_monitoring: c.route_monitoring.load(Ordering::Relaxed),
            statistics_report: c.statistics_report.load(Ordering::Relaxed),
            peer_down: c.peer_down.load(Ordering::Relaxed),
            peer_up: c.peer_up.load(Ordering::Relaxed),
            initiation: c.initiation.load(Ordering::Relaxed),
            termination: c.termination.load(Ordering::Relaxed),
            route_mirroring: c.route_mirroring.load(Ordering::Relaxed),
        }
    }
}

struct NeighborRib {
    family: Family,
    rib_in: Arc<AdjRibIn>,
    loc_rib: Arc<LocRib>,
}

/// A peer of the monitored router. It is Established from the moment
/// its Peer Up notification arrives.
struct Neighbor {
    peer_as: u32,
    local_as: u32,
    router_id: Ipv4Addr,
    codec: Codec,
    ribs: Vec<NeighborRib>,
    stats: Vec<Stat>,
    up_since: u64,
}

impl Neighbor {
    fn rib(&self, family: Family) -> Option<&NeighborRib> {
        self.ribs.iter().find(|r| r.family == family)
    }

    fn dispose(&self, clients: &[(Family, Arc<dyn RouteTableClient>)]) {
        for r in &self.ribs {
            for (_, c) in clients.iter().filter(|(f, _)| *f == r.family) {
                r.rib_in.unregister(c);
            }
            let loc_rib: Arc<dyn RouteTableClient> = r.loc_rib.clone();
            r.rib_in.unregister(&loc_rib);
        }
    }
}

/// A BMP speaking router and what it has told us about its peers.
pub struct Router {
    address: IpAddr,
    port: u16,
    config: RouterConfig,
    name: RwLock<String>,
    vrfs: Arc<VrfRegistry>,
    vrf: Option<Arc<Vrf>>,
    neighbors: Mutex<FnvHashMap<(u64, IpAddr), Neighbor>>,
    clients: Mutex<Vec<(Family, Arc<dyn RouteTableClient>)>>,
    pub(crate) established: AtomicBool,
    counters: Counters,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Router {
    /// Routes land in `vrf` when given, otherwise in a per route
    /// distinguisher VRF of the router's own registry.
    pub fn new(address: IpAddr, port: u16, config: RouterConfig, vrf: Option<Arc<Vrf>>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Router {
            address,
            port,
            config,
            name: RwLock::new(String::new()),
            vrfs: Arc::new(VrfRegistry::new()),
            vrf,
            neighbors: Mutex::new(FnvHashMap::default()),
            clients: Mutex::new(Vec::new()),
            established: AtomicBool::new(false),
            counters: Counters::default(),
            stop_tx,
            stop_rx,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// sysName from the Initiation message.
    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats::from(&self.counters)
    }

    pub(crate) fn initiation_count(&self) -> u64 {
        self.counters.initiation.load(Ordering::Relaxed)
    }

    pub fn vrfs(&self) -> &Arc<VrfRegistry> {
        &self.vrfs
    }

    /// (rd, peer address, peer asn) of every neighbor that is up.
    pub fn neighbors(&self) -> Vec<(RouteDistinguisher, IpAddr, u32)> {
        let mut v: Vec<_> = self
            .neighbors
            .lock()
            .unwrap()
            .iter()
            .map(|((rd, addr), n)| (RouteDistinguisher(*rd), *addr, n.peer_as))
            .collect();
        v.sort();
        v
    }

    pub fn neighbor_rib_in(
        &self,
        rd: RouteDistinguisher,
        addr: IpAddr,
        family: Family,
    ) -> Option<Arc<AdjRibIn>> {
        self.neighbors
            .lock()
            .unwrap()
            .get(&(rd.0, addr))
            .and_then(|n| n.rib(family).map(|r| r.rib_in.clone()))
    }

    /// Latest statistics report of a neighbor.
    pub fn neighbor_stats(&self, rd: RouteDistinguisher, addr: IpAddr) -> Vec<Stat> {
        self.neighbors
            .lock()
            .unwrap()
            .get(&(rd.0, addr))
            .map(|n| n.stats.clone())
            .unwrap_or_default()
    }

    /// (local asn, router id, unix time of peer up)
    pub fn neighbor_session(&self, rd: RouteDistinguisher, addr: IpAddr) -> Option<(u32, Ipv4Addr, u64)> {
        self.neighbors
            .lock()
            .unwrap()
            .get(&(rd.0, addr))
            .map(|n| (n.local_as, n.router_id, n.up_since))
    }

    /// Attaches `client` to the Adj-RIB-In of `family` of every current
    /// and future neighbor.
    pub fn register_client(&self, family: Family, client: Arc<dyn RouteTableClient>) {
        for n in self.neighbors.lock().unwrap().values() {
            if let Some(r) = n.rib(family) {
                r.rib_in.register(client.clone());
            }
        }
        self.clients.lock().unwrap().push((family, client));
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Reads BMP messages until the connection fails, a Termination
    /// arrives or the router is stopped. Every neighbor learned over the
    /// connection is torn down afterwards.
    pub(crate) async fn serve<S: AsyncRead + Unpin>(&self, stream: S) -> Result<(), Error> {
        let mut frames = FramedRead::new(stream, BmpCodec::new());
        let mut stop = self.stop_rx.clone();
        let res = loop {
            if *stop.borrow() {
                break Ok(());
            }
            tokio::select! {
                _ = stop.changed() => {}
                msg = frames.next() => match msg {
                    None => {
                        break Err(Error::StdIoErr(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed",
                        )))
                    }
                    Some(Err(e)) => break Err(e),
                    Some(Ok(msg)) => {
                        if !self.process(msg) {
                            break Ok(());
                        }
                    }
                },
            }
        };
        self.dispose_neighbors();
        self.established.store(false, Ordering::Relaxed);
        res
    }

    /// False once the router said goodbye.
    pub fn process(&self, msg: Message) -> bool {
        match msg {
            Message::RouteMonitoring { header, update } => {
                self.counters
                    .route_monitoring
                    .fetch_add(1, Ordering::Relaxed);
                self.route_monitoring(&header, &update);
            }
            Message::StatisticsReport { header, stats } => {
                self.counters
                    .statistics_report
                    .fetch_add(1, Ordering::Relaxed);
                let key = (header.distinguisher, header.peer_address);
                match self.neighbors.lock().unwrap().get_mut(&key) {
                    Some(n) => {
                        for s in stats {
                            n.stats.retain(|x| x.stat_type != s.stat_type);
                            n.stats.push(s);
                        }
                        n.stats.sort_by_key(|s| s.stat_type);
                    }
                    None => debug!(
                        "{}: statistics for unknown neighbor {}",
                        self.address, header.peer_address
                    ),
                }
            }
            Message::PeerDown { header, reason } => {
                self.counters.peer_down.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{}: peer down {} (rd {}): {}",
                    self.address,
                    header.peer_address,
                    RouteDistinguisher(header.distinguisher),
                    reason
                );
                let removed = self
                    .neighbors
                    .lock()
                    .unwrap()
                    .remove(&(header.distinguisher, header.peer_address));
                match removed {
                    Some(n) => n.dispose(&self.clients.lock().unwrap()),
                    None => warn!(
                        "{}: peer down for unknown neighbor {}",
                        self.address, header.peer_address
                    ),
                }
            }
            Message::PeerUp(up) => {
                self.counters.peer_up.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.peer_up(&up) {
                    warn!(
                        "{}: failed to process peer up for {}: {}",
                        self.address, up.header.peer_address, e
                    );
                }
            }
            Message::Initiation(tlvs) => {
                self.counters.initiation.fetch_add(1, Ordering::Relaxed);
                for tlv in &tlvs {
                    if tlv.info_type == InformationTlv::SYS_NAME {
                        *self.name.write().unwrap() = String::from_utf8_lossy(&tlv.value).to_string();
                    }
                }
                info!("{}: initiation: {}", self.address, describe(&tlvs));
            }
            Message::Termination(tlvs) => {
                self.counters.termination.fetch_add(1, Ordering::Relaxed);
                info!("{}: termination: {}", self.address, describe(&tlvs));
                return false;
            }
            Message::RouteMirroring { .. } => {
                self.counters
                    .route_mirroring
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    fn route_monitoring(&self, header: &PerPeerHeader, update: &[u8]) {
        if self.config.ignore_peer_asns.contains(&header.peer_as) {
            return;
        }
        if (header.is_post_policy() && self.config.ignore_post_policy)
            || (!header.is_post_policy() && self.config.ignore_pre_policy)
        {
            return;
        }
        let neighbors = self.neighbors.lock().unwrap();
        let n = match neighbors.get(&(header.distinguisher, header.peer_address)) {
            Some(n) => n,
            None => {
                warn!(
                    "{}: route monitoring for unknown neighbor {} (rd {})",
                    self.address,
                    header.peer_address,
                    RouteDistinguisher(header.distinguisher)
                );
                return;
            }
        };
        let mut codec = n.codec.clone();
        codec.set_four_octet_asn(!header.is_two_octet_as());
        let update = match codec.parse(update) {
            Ok(bgp::Message::Update(u)) => u,
            Ok(m) => {
                warn!(
                    "{}: route monitoring carries message type {}",
                    self.address,
                    m.code()
                );
                return;
            }
            Err(e) => {
                warn!("{}: malformed route monitoring: {}", self.address, e);
                return;
            }
        };
        if update.end_of_rib().is_some() {
            return;
        }
        let ebgp = n.local_as != n.peer_as;
        let router_id = n.router_id;
        let post_policy = header.is_post_policy();
        apply_update(
            header.peer_address,
            &update,
            |family| n.rib(family).map(|r| r.rib_in.as_ref() as &dyn RouteTableClient),
            |p| {
                p.ebgp = ebgp;
                p.bgp_identifier = router_id;
                p.bmp_post_policy = post_policy;
            },
        );
    }

    fn peer_up(&self, up: &PeerUp) -> Result<(), Error> {
        let header = &up.header;
        let (sent, received) = up.opens()?;
        let rd = RouteDistinguisher(header.distinguisher);
        let vrf = match &self.vrf {
            Some(vrf) => vrf.clone(),
            None => self.vrfs.create_vrf_if_not_exists(&rd.to_string(), rd),
        };

        let families = [Family::IPV4, Family::IPV6];
        let addpath = |f: Family| {
            sent.addpath(f) & Capability::ADD_PATH_RECEIVE != 0
                && received.addpath(f) & Capability::ADD_PATH_SEND != 0
        };
        let mut builder = CodecBuilder::new();
        builder.families(families.to_vec());
        for f in &families {
            builder.addpath(*f, addpath(*f), false);
        }

        let clients = self.clients.lock().unwrap().clone();
        let mut ribs = Vec::with_capacity(families.len());
        for f in &families {
            let loc_rib = vrf
                .rib_by_family(*f)
                .ok_or_else(|| Error::NotFound(format!("no rib for {} in vrf {}", f, vrf.name())))?;
            let rib_in = Arc::new(AdjRibIn::new(
                FilterChain::accept_all(),
                AdjRibInOptions {
                    add_path: addpath(*f),
                    ..Default::default()
                },
            ));
            rib_in.register(loc_rib.clone());
            for (_, c) in clients.iter().filter(|(family, _)| family == f) {
                rib_in.register(c.clone());
            }
            ribs.push(NeighborRib {
                family: *f,
                rib_in,
                loc_rib,
            });
        }

        let neighbor = Neighbor {
            peer_as: header.peer_as,
            local_as: sent.four_octet_as_number().unwrap_or(sent.as_number),
            router_id: received.router_id,
            codec: builder.build(),
            ribs,
            stats: Vec::new(),
            up_since: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        info!(
            "{}: peer up {} (rd {}, as {})",
            self.address, header.peer_address, rd, header.peer_as
        );
        let old = self
            .neighbors
            .lock()
            .unwrap()
            .insert((header.distinguisher, header.peer_address), neighbor);
        if let Some(old) = old {
            warn!(
                "{}: replacing neighbor {} (rd {})",
                self.address, header.peer_address, rd
            );
            old.dispose(&clients);
        }
        Ok(())
    }

    pub(crate) fn dispose_neighbors(&self) {
        let neighbors: Vec<Neighbor> = self
            .neighbors
            .lock()
            .unwrap()
            .drain()
            .map(|(_, n)| n)
            .collect();
        let clients = self.clients.lock().unwrap().clone();
        for n in neighbors {
            n.dispose(&clients);
        }
    }
}

fn describe(tlvs: &[InformationTlv]) -> String {
    tlvs.iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::bgp::{Attribute, Nlri, Open, Update};
    use crate::packet::bmp::{PeerDownReason, StatValue};
    use bytes::BytesMut;
    use tokio_util::codec::Encoder;

    pub(crate) fn encode_bgp(msg: &bgp::Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        CodecBuilder::new().build().encode(msg, &mut buf).unwrap();
        buf.to_vec()
    }

    pub(crate) fn header(peer: &str, asn: u32) -> PerPeerHeader {
        PerPeerHeader::new(peer.parse().unwrap(), asn, Ipv4Addr::new(10, 0, 0, 2))
    }

    pub(crate) fn peer_up(peer: &str, asn: u32) -> Message {
        let open = |asn: u32, id: [u8; 4]| {
            encode_bgp(&bgp::Message::Open(Open {
                version: 4,
                as_number: asn,
                holdtime: 90,
                router_id: Ipv4Addr::from(id),
                capability: vec![
                    Capability::MultiProtocol(Family::IPV4),
                    Capability::FourOctetAsNumber(asn),
                ],
            }))
        };
        Message::PeerUp(PeerUp {
            header: header(peer, asn),
            local_address: "192.0.2.254".parse().unwrap(),
            local_port: 179,
            remote_port: 40000,
            sent_open: open(65000, [10, 0, 0, 1]),
            received_open: open(asn, [10, 0, 0, 2]),
            information: Vec::new(),
        })
    }

    pub(crate) fn route_monitoring(peer: &str, asn: u32, prefix: &str, withdraw: bool) -> Message {
        let nlri = vec![Nlri::new(prefix.parse().unwrap())];
        let update = if withdraw {
            Update {
                withdrawn: nlri,
                ..Default::default()
            }
        } else {
            Update {
                attrs: vec![
                    Attribute::Origin(Attribute::ORIGIN_IGP),
                    Attribute::AsPath(asn.to_string().parse().unwrap()),
                    Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
                ],
                nlri,
                ..Default::default()
            }
        };
        Message::RouteMonitoring {
            header: header(peer, asn),
            update: encode_bgp(&bgp::Message::Update(update)),
        }
    }

    #[test]
    fn peer_lifecycle() {
        let r = Router::new("198.51.100.1".parse().unwrap(), 11019, RouterConfig::default(), None);
        assert!(r.process(Message::Initiation(vec![InformationTlv {
            info_type: InformationTlv::SYS_NAME,
            value: b"edge1".to_vec(),
        }])));
        assert_eq!(r.name(), "edge1");

        r.process(peer_up("192.0.2.1", 65001));
        let rd = RouteDistinguisher::default();
        assert_eq!(
            r.neighbors(),
            vec![(rd, "192.0.2.1".parse().unwrap(), 65001)]
        );
        let (local_as, router_id, _) = r.neighbor_session(rd, "192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(local_as, 65000);
        assert_eq!(router_id, Ipv4Addr::new(10, 0, 0, 2));

        r.process(route_monitoring("192.0.2.1", 65001, "10.0.0.0/8", false));
        r.process(route_monitoring("192.0.2.1", 65001, "11.0.0.0/8", false));
        let loc_rib = r.vrfs().get_by_rd(rd).unwrap().ipv4_unicast_rib();
        assert_eq!(loc_rib.route_count(), 2);
        let route = loc_rib.get(&"10.0.0.0/8".parse().unwrap()).unwrap();
        let path = route.best_path().unwrap().bgp().unwrap().clone();
        assert!(path.ebgp);
        assert!(!path.bmp_post_policy);
        assert_eq!(path.source, "192.0.2.1".parse::<IpAddr>().unwrap());

        r.process(route_monitoring("192.0.2.1", 65001, "11.0.0.0/8", true));
        assert_eq!(loc_rib.route_count(), 1);

        r.process(Message::StatisticsReport {
            header: header("192.0.2.1", 65001),
            stats: vec![Stat {
                stat_type: Stat::ADJ_RIB_IN_ROUTES,
                value: StatValue::Gauge(1),
            }],
        });
        assert_eq!(r.neighbor_stats(rd, "192.0.2.1".parse().unwrap()).len(), 1);

        r.process(Message::PeerDown {
            header: header("192.0.2.1", 65001),
            reason: PeerDownReason::RemoteNoData,
        });
        assert!(r.neighbors().is_empty());
        assert_eq!(loc_rib.route_count(), 0);

        let stats = r.stats();
        assert_eq!(stats.peer_up, 1);
        assert_eq!(stats.peer_down, 1);
        assert_eq!(stats.route_monitoring, 3);
        assert_eq!(stats.statistics_report, 1);
        assert!(!r.process(Message::Termination(Vec::new())));
    }

    #[test]
    fn ignored_monitoring() {
        let config = RouterConfig {
            ignore_peer_asns: vec![65002],
            ignore_post_policy: true,
            ..Default::default()
        };
        let r = Router::new("198.51.100.1".parse().unwrap(), 11019, config, None);
        r.process(peer_up("192.0.2.1", 65001));
        r.process(peer_up("192.0.2.2", 65002));
        r.process(route_monitoring("192.0.2.2", 65002, "10.0.0.0/8", false));
        let mut post = route_monitoring("192.0.2.1", 65001, "11.0.0.0/8", false);
        if let Message::RouteMonitoring { header, .. } = &mut post {
            header.flags |= PerPeerHeader::FLAG_POST_POLICY;
        }
        r.process(post);
        let rd = RouteDistinguisher::default();
        let loc_rib = r.vrfs().get_by_rd(rd).unwrap().ipv4_unicast_rib();
        assert_eq!(loc_rib.route_count(), 0);

        r.process(route_monitoring("192.0.2.1", 65001, "12.0.0.0/8", false));
        assert_eq!(loc_rib.route_count(), 1);
        // counted even when dropped
        assert_eq!(r.stats().route_monitoring, 3);
    }

    #[test]
    fn replaced_neighbor() {
        let r = Router::new("198.51.100.1".parse().unwrap(), 11019, RouterConfig::default(), None);
        r.process(peer_up("192.0.2.1", 65001));
        r.process(route_monitoring("192.0.2.1", 65001, "10.0.0.0/8", false));
        r.process(peer_up("192.0.2.1", 65001));
        let loc_rib = r
            .vrfs()
            .get_by_rd(RouteDistinguisher::default())
            .unwrap()
            .ipv4_unicast_rib();
        assert_eq!(loc_rib.route_count(), 0);
        assert_eq!(r.neighbors().len(), 1);
    }
}
