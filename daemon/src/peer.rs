// Copyright (C) 2020-2021 The RustyBGP Authors.
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
use log::{info, warn};
use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

use crate::config;
use crate::error::Error;
use crate::fsm::{
    CollisionDomain, Connection, Event, Fsm, FsmHandle, MessageStats, Role, State,
};
use crate::packet::bgp::{notification, Family};
use crate::table::filter::Filter;
use crate::table::vrf::DEFAULT_VRF;
use crate::table::{FilterChain, Vrf, VrfRegistry};

#[derive(Clone)]
pub struct FamilyConfig {
    pub family: Family,
    pub add_path_recv: bool,
    pub add_path_send: config::AddPathSend,
    pub import_filter: FilterChain,
    pub export_filter: FilterChain,
    pub prefix_limit: Option<u64>,
}

impl FamilyConfig {
    pub fn new(family: Family) -> Self {
        FamilyConfig {
            family,
            add_path_recv: false,
            add_path_send: config::AddPathSend::default(),
            import_filter: FilterChain::accept_all(),
            export_filter: FilterChain::accept_all(),
            prefix_limit: None,
        }
    }
}

#[derive(Clone)]
pub struct PeerConfig {
    pub peer_address: IpAddr,
    pub peer_port: u16,
    pub local_address: Option<IpAddr>,
    pub local_as: u32,
    pub peer_as: u32,
    pub router_id: Ipv4Addr,
    pub hold_time: u16,
    pub reconnect_interval: Duration,
    pub passive: bool,
    pub route_server_client: bool,
    pub route_reflector_client: bool,
    pub cluster_id: Ipv4Addr,
    pub advertise_ipv4_multiprotocol: bool,
    pub graceful_restart: bool,
    pub ttl: Option<u8>,
    pub description: String,
    pub families: Vec<FamilyConfig>,
    pub vrf: Arc<Vrf>,
}

impl PeerConfig {
    /// IPv4 unicast only, default timers.
    pub fn new(
        peer_address: IpAddr,
        peer_as: u32,
        local_as: u32,
        router_id: Ipv4Addr,
        vrf: Arc<Vrf>,
    ) -> Self {
        PeerConfig {
            peer_address,
            peer_port: config::DEFAULT_LISTEN_PORT,
            local_address: None,
            local_as,
            peer_as,
            router_id,
            hold_time: config::DEFAULT_HOLD_TIME,
            reconnect_interval: Duration::from_secs(config::DEFAULT_RECONNECT_INTERVAL),
            passive: false,
            route_server_client: false,
            route_reflector_client: false,
            cluster_id: router_id,
            advertise_ipv4_multiprotocol: false,
            graceful_restart: false,
            ttl: None,
            description: String::new(),
            families: vec![FamilyConfig::new(Family::IPV4)],
            vrf,
        }
    }

    pub fn from_config(
        global: &config::Global,
        n: &config::Neighbor,
        filters: &FnvHashMap<String, Arc<Filter>>,
        vrfs: &VrfRegistry,
    ) -> Result<PeerConfig, Error> {
        let parse_err = |what: &str, s: &str| {
            Error::InvalidConfiguration(format!("can't parse {} {}", what, s))
        };
        let peer_address: IpAddr = n
            .peer_address
            .parse()
            .map_err(|_| parse_err("neighbor address", &n.peer_address))?;
        let router_id: Ipv4Addr = global
            .router_id
            .parse()
            .map_err(|_| parse_err("router-id", &global.router_id))?;
        let vrf = match &n.vrf {
            Some(name) => vrfs
                .get_by_name(name)
                .ok_or_else(|| Error::InvalidConfiguration(format!("unknown vrf {}", name)))?,
            None => vrfs.create_vrf_if_not_exists(DEFAULT_VRF, Default::default()),
        };
        let local_as = n.local_as.unwrap_or(global.asn);
        let mut c = PeerConfig::new(peer_address, n.peer_as, local_as, router_id, vrf);
        c.local_address = match &n.local_address {
            Some(s) => Some(s.parse().map_err(|_| parse_err("local address", s))?),
            None => None,
        };
        if let Some(s) = n.cluster_id.as_ref().or_else(|| global.cluster_id.as_ref()) {
            c.cluster_id = s.parse().map_err(|_| parse_err("cluster-id", s))?;
        }
        c.hold_time = n.hold_time;
        c.reconnect_interval = Duration::from_secs(n.reconnect_interval);
        c.passive = n.passive;
        c.route_server_client = n.route_server_client;
        c.route_reflector_client = n.route_reflector_client;
        c.advertise_ipv4_multiprotocol = n.advertise_ipv4_multiprotocol;
        c.graceful_restart = n.graceful_restart;
        c.ttl = n.ttl;
        c.description = n.description.clone();

        let chain = |names: &[String]| -> Result<FilterChain, Error> {
            names
                .iter()
                .map(|name| {
                    filters.get(name).cloned().ok_or_else(|| {
                        Error::InvalidConfiguration(format!("unknown filter {}", name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FilterChain::new)
        };
        c.families = n
            .address_families()
            .into_iter()
            .map(|(family, af)| {
                Ok(FamilyConfig {
                    family,
                    add_path_recv: af.add_path_recv,
                    import_filter: chain(&af.import_filter)?,
                    export_filter: chain(&af.export_filter)?,
                    prefix_limit: af.prefix_limit,
                    add_path_send: af.add_path_send,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(c)
    }
}

/// Compiles the configured filters by name.
pub fn build_filters(
    configs: &[config::FilterConfig],
) -> Result<FnvHashMap<String, Arc<Filter>>, Error> {
    configs
        .iter()
        .map(|c| Ok((c.name.clone(), Arc::new(Filter::try_from(c)?))))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub address: IpAddr,
    pub peer_as: u32,
    pub local_as: u32,
    pub description: String,
    pub vrf: String,
    pub state: State,
    pub configured_time: u64,
    pub uptime: u64,
    pub remote_id: Ipv4Addr,
    pub hold_time: u16,
    pub connect_retry_counter: u64,
    pub last_down_reason: String,
    pub received: MessageStats,
    pub sent: MessageStats,
    /// (family, received, accepted, advertised)
    pub routes: Vec<(Family, u64, u64, u64)>,
}

/// A configured neighbor: a passive session that takes incoming
/// connections and, unless configured passive, an active one that
/// dials out. A session that ceases is replaced.
pub struct Peer {
    config: Arc<PeerConfig>,
    domain: Arc<CollisionDomain>,
    active: Mutex<Option<FsmHandle>>,
    passive: Mutex<Option<FsmHandle>>,
    enabled: AtomicBool,
    removed: AtomicBool,
    configured_time: u64,
}

impl Peer {
    fn new(config: PeerConfig, enabled: bool) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            config: Arc::new(config),
            domain: Arc::new(CollisionDomain::default()),
            active: Mutex::new(None),
            passive: Mutex::new(None),
            enabled: AtomicBool::new(enabled),
            removed: AtomicBool::new(false),
            configured_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        });
        peer.spawn(Role::Passive);
        if !peer.config.passive {
            peer.spawn(Role::Active);
        }
        peer
    }

    pub fn config(&self) -> &Arc<PeerConfig> {
        &self.config
    }

    fn slot(&self, role: Role) -> &Mutex<Option<FsmHandle>> {
        match role {
            Role::Active => &self.active,
            Role::Passive => &self.passive,
        }
    }

    fn spawn(self: &Arc<Self>, role: Role) {
        let (fsm, handle) = Fsm::new(self.config.clone(), role, self.domain.clone());
        if self.enabled.load(Ordering::Relaxed) {
            handle.send(Event::AutomaticStart);
        }
        *self.slot(role).lock().unwrap() = Some(handle);
        let peer = self.clone();
        tokio::spawn(async move {
            fsm.run().await;
            peer.respawn(role).await;
        });
    }

    async fn respawn(self: Arc<Self>, role: Role) {
        *self.slot(role).lock().unwrap() = None;
        if role == Role::Active {
            // dialing out again would only collide with the live session
            while let Some(mut rx) = self.established_session() {
                if rx.changed().await.is_err() {
                    break;
                }
                if self.removed.load(Ordering::Relaxed) {
                    return;
                }
            }
        }
        if self.removed.load(Ordering::Relaxed) {
            return;
        }
        info!("{}: restarting {:?} session", self.config.peer_address, role);
        self.spawn(role);
    }

    fn established_session(&self) -> Option<tokio::sync::watch::Receiver<State>> {
        self.handles()
            .into_iter()
            .find(|h| h.state() == State::Established)
            .map(|h| h.subscribe())
    }

    fn handles(&self) -> Vec<FsmHandle> {
        let mut v = Vec::new();
        if let Some(h) = self.active.lock().unwrap().as_ref() {
            v.push(h.clone());
        }
        if let Some(h) = self.passive.lock().unwrap().as_ref() {
            v.push(h.clone());
        }
        v
    }

    /// Hands an incoming connection to the passive session.
    pub fn accept(&self, conn: Connection) -> bool {
        match self.passive.lock().unwrap().as_ref() {
            Some(h) => h.send(Event::TcpConnectionConfirmed(conn)),
            None => false,
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        for h in self.handles() {
            h.send(Event::ManualStart);
        }
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        for h in self.handles() {
            h.send(Event::ManualStop);
        }
    }

    fn shutdown(&self) {
        self.removed.store(true, Ordering::Relaxed);
        for h in self.handles() {
            h.send(Event::Cease(notification::PEER_DECONFIGURED));
        }
    }

    pub fn state(&self) -> State {
        self.primary().map(|h| h.state()).unwrap_or(State::Idle)
    }

    /// The established session, or the one most likely to become so.
    fn primary(&self) -> Option<FsmHandle> {
        let handles = self.handles();
        handles
            .iter()
            .find(|h| h.state() == State::Established)
            .or_else(|| {
                handles
                    .iter()
                    .find(|h| matches!(h.state(), State::OpenSent | State::OpenConfirm))
            })
            .or_else(|| handles.first())
            .cloned()
    }

    pub fn status(&self) -> PeerStatus {
        let c = &self.config;
        let mut s = PeerStatus {
            address: c.peer_address,
            peer_as: c.peer_as,
            local_as: c.local_as,
            description: c.description.clone(),
            vrf: c.vrf.name().to_string(),
            state: State::Idle,
            configured_time: self.configured_time,
            uptime: 0,
            remote_id: Ipv4Addr::UNSPECIFIED,
            hold_time: 0,
            connect_retry_counter: 0,
            last_down_reason: String::new(),
            received: MessageStats::default(),
            sent: MessageStats::default(),
            routes: Vec::new(),
        };
        if let Some(h) = self.primary() {
            let info = h.info();
            s.state = info.state();
            s.uptime = info.uptime();
            s.remote_id = info.remote_id();
            s.hold_time = info.hold_time();
            s.connect_retry_counter = info.connect_retry_counter();
            s.last_down_reason = info.last_down_reason();
            s.received = MessageStats::from(&info.counter_rx);
            s.sent = MessageStats::from(info.counter_tx.as_ref());
            s.routes = info.route_stats();
        }
        s
    }

    pub fn subscribe(&self) -> Option<tokio::sync::watch::Receiver<State>> {
        self.primary().map(|h| h.subscribe())
    }
}

#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<FnvHashMap<IpAddr, Arc<Peer>>>,
}

impl PeerManager {
    pub fn new() -> Self {
        PeerManager::default()
    }

    pub fn add_peer(&self, config: PeerConfig, enabled: bool) -> Result<Arc<Peer>, Error> {
        let mut peers = self.peers.write().unwrap();
        if peers.contains_key(&config.peer_address) {
            return Err(Error::AlreadyExists(format!(
                "peer {} already exists",
                config.peer_address
            )));
        }
        info!(
            "{}: peer added (as {}, vrf {})",
            config.peer_address,
            config.peer_as,
            config.vrf.name()
        );
        let addr = config.peer_address;
        let peer = Peer::new(config, enabled);
        peers.insert(addr, peer.clone());
        Ok(peer)
    }

    pub fn remove_peer(&self, addr: &IpAddr) -> Result<(), Error> {
        match self.peers.write().unwrap().remove(addr) {
            Some(peer) => {
                info!("{}: peer removed", addr);
                peer.shutdown();
                Ok(())
            }
            None => Err(Error::NotFound(format!("peer {} not found", addr))),
        }
    }

    pub fn get(&self, addr: &IpAddr) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(addr).cloned()
    }

    pub fn list(&self) -> Vec<PeerStatus> {
        let mut v: Vec<PeerStatus> = self
            .peers
            .read()
            .unwrap()
            .values()
            .map(|p| p.status())
            .collect();
        v.sort_by_key(|s| s.address);
        v
    }

    /// Routes a connection to its peer. Connections from unknown
    /// addresses are closed.
    pub fn accept(&self, conn: Connection) -> bool {
        let addr = conn.remote().ip();
        match self.get(&addr) {
            Some(peer) => peer.accept(conn),
            None => {
                warn!("{}: closing connection from unconfigured peer", addr);
                false
            }
        }
    }

    pub async fn serve(self: Arc<Self>, listeners: Vec<TcpListener>) {
        let mut incomings =
            futures::stream::select_all(listeners.into_iter().map(TcpListenerStream::new));
        while let Some(stream) = incomings.next().await {
            match stream.and_then(Connection::from_tcp) {
                Ok(conn) => {
                    self.accept(conn);
                }
                Err(e) => warn!("failed to accept: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::vrf::RouteDistinguisher;

    fn vrfs() -> VrfRegistry {
        let r = VrfRegistry::new();
        r.create_vrf(DEFAULT_VRF, RouteDistinguisher::default())
            .unwrap();
        r.create_vrf("blue", RouteDistinguisher::new(65000, 1))
            .unwrap();
        r
    }

    #[test]
    fn from_config() {
        let conf = config::BgpConfig::from_toml(
            r#"
[global]
as = 65000
router-id = "10.0.0.1"
cluster-id = "10.0.0.9"

[[neighbors]]
peer-address = "192.0.2.1"
peer-as = 65000
route-reflector-client = true
vrf = "blue"

[neighbors.ipv6]
export-filter = ["deny"]
prefix-limit = 100

[[filters]]
name = "deny"
"#,
        )
        .unwrap();
        let vrfs = vrfs();
        let filters = build_filters(&conf.filters).unwrap();
        let c = PeerConfig::from_config(&conf.global, &conf.neighbors[0], &filters, &vrfs)
            .unwrap();
        assert_eq!(c.local_as, 65000);
        assert_eq!(c.cluster_id, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(c.vrf.name(), "blue");
        assert_eq!(c.hold_time, config::DEFAULT_HOLD_TIME);
        assert_eq!(c.families.len(), 1);
        assert_eq!(c.families[0].family, Family::IPV6);
        assert_eq!(c.families[0].export_filter.names(), vec!["deny"]);
        assert_eq!(c.families[0].prefix_limit, Some(100));

        let mut n = conf.neighbors[0].clone();
        n.vrf = Some("red".to_string());
        assert!(PeerConfig::from_config(&conf.global, &n, &filters, &vrfs).is_err());
    }

    #[tokio::test]
    async fn manager() {
        let vrfs = vrfs();
        let vrf = vrfs.get_by_name(DEFAULT_VRF).unwrap();
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let mut c = PeerConfig::new(addr, 65001, 65000, Ipv4Addr::new(1, 1, 1, 1), vrf);
        c.passive = true;
        let m = PeerManager::new();
        m.add_peer(c.clone(), false).unwrap();
        assert!(matches!(
            m.add_peer(c, false),
            Err(Error::AlreadyExists(_))
        ));
        let list = m.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, State::Idle);
        assert_eq!(list[0].vrf, DEFAULT_VRF);

        let (a, _b) = tokio::io::duplex(64);
        let stranger = Connection::new(
            a,
            "192.0.2.254:179".parse().unwrap(),
            "198.51.100.1:40000".parse().unwrap(),
        );
        assert!(!m.accept(stranger));

        m.remove_peer(&addr).unwrap();
        assert!(m.get(&addr).is_none());
        assert!(matches!(m.remove_peer(&addr), Err(Error::NotFound(_))));
    }
}
