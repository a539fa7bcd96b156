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

//! BGP finite state machine, one instance per TCP session.

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_util::codec::{Encoder, FramedRead};

use crate::error::Error;
use crate::net;
use crate::packet::bgp::{
    create_channel, notification, Attribute, Capability, Channel, Codec, CodecBuilder, Family,
    Framer, Message, Nlri, Open, Update,
};
use crate::peer::PeerConfig;
use crate::table::adj_rib_in::AdjRibInOptions;
use crate::table::client::RouteTableClient;
use crate::table::loc_rib::LocRib;
use crate::table::{AdjRibIn, AdjRibOut, BgpPath, NeighborInfo, Path, Route};
use crate::update_sender::{SenderOptions, UpdateSender};

/// Hold time used until the OPEN exchange is complete (RFC4271 8.2.2).
const LARGE_HOLD_TIME: Duration = Duration::from_secs(240);

#[derive(Default, Debug)]
pub struct MessageCounter {
    pub open: AtomicU64,
    pub update: AtomicU64,
    pub notification: AtomicU64,
    pub keepalive: AtomicU64,
    pub refresh: AtomicU64,
    pub total: AtomicU64,
    pub withdraw_update: AtomicU64,
    pub withdraw_prefix: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessageStats {
    pub open: u64,
    pub update: u64,
    pub notification: u64,
    pub keepalive: u64,
    pub refresh: u64,
    pub total: u64,
    pub withdraw_update: u64,
    pub withdraw_prefix: u64,
}

impl From<&MessageCounter> for MessageStats {
    fn from(m: &MessageCounter) -> Self {
        MessageStats {
            open: m.open.load(Ordering::Relaxed),
            update: m.update.load(Ordering::Relaxed),
            notification: m.notification.load(Ordering::Relaxed),
            keepalive: m.keepalive.load(Ordering::Relaxed),
            refresh: m.refresh.load(Ordering::Relaxed),
            total: m.total.load(Ordering::Relaxed),
            withdraw_update: m.withdraw_update.load(Ordering::Relaxed),
            withdraw_prefix: m.withdraw_prefix.load(Ordering::Relaxed),
        }
    }
}

impl MessageCounter {
    pub fn sync(&self, msg: &Message) {
        match msg {
            Message::Open(_) => {
                self.open.fetch_add(1, Ordering::Relaxed);
            }
            Message::Update(update) => {
                self.update.fetch_add(1, Ordering::Relaxed);
                let mut withdrawn = update.withdrawn.len();
                if let Some(mp) = update.mp_unreach() {
                    withdrawn += mp.nlri.len();
                }
                if withdrawn > 0 {
                    self.withdraw_update.fetch_add(1, Ordering::Relaxed);
                    self.withdraw_prefix
                        .fetch_add(withdrawn as u64, Ordering::Relaxed);
                }
            }
            Message::Notification { .. } => {
                self.notification.fetch_add(1, Ordering::Relaxed);
            }
            Message::Keepalive => {
                self.keepalive.fetch_add(1, Ordering::Relaxed);
            }
            Message::RouteRefresh { .. } => {
                self.refresh.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Cease,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::Idle => "idle",
            State::Connect => "connect",
            State::Active => "active",
            State::OpenSent => "opensent",
            State::OpenConfirm => "openconfirm",
            State::Established => "established",
            State::Cease => "cease",
        };
        write!(f, "{}", s)
    }
}

/// Which side opened the TCP connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    Active,
    Passive,
}

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// An established transport connection handed to an FSM.
pub struct Connection {
    stream: Box<dyn Io>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Connection {
    pub fn new<S: Io>(stream: S, local: SocketAddr, remote: SocketAddr) -> Self {
        Connection {
            stream: Box::new(stream),
            local,
            remote,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Connection::new(stream, local, remote))
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

pub enum Event {
    ManualStart,
    ManualStop,
    AutomaticStart,
    AutomaticStop,
    /// Administrative teardown with the given Cease subcode.
    Cease(u8),
    TcpConnectionConfirmed(Connection),
    PrefixLimitExceeded(u64),
}

/// State shared between a running FSM and whoever observes it.
pub struct SessionInfo {
    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,
    uptime: AtomicU64,
    connect_retry_counter: AtomicU64,
    remote_asn: AtomicU32,
    remote_id: AtomicU32,
    hold_time: AtomicU16,
    last_down_reason: Mutex<String>,
    pub counter_rx: MessageCounter,
    pub counter_tx: Arc<MessageCounter>,
    ribs: Mutex<FnvHashMap<Family, (Arc<AdjRibIn>, Arc<AdjRibOut>)>>,
}

impl SessionInfo {
    fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(State::Idle);
        SessionInfo {
            state_tx,
            state_rx,
            uptime: AtomicU64::new(0),
            connect_retry_counter: AtomicU64::new(0),
            remote_asn: AtomicU32::new(0),
            remote_id: AtomicU32::new(0),
            hold_time: AtomicU16::new(0),
            last_down_reason: Mutex::new(String::new()),
            counter_rx: MessageCounter::default(),
            counter_tx: Arc::new(MessageCounter::default()),
            ribs: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// Unix time of the last transition to Established.
    pub fn uptime(&self) -> u64 {
        self.uptime.load(Ordering::Relaxed)
    }

    pub fn connect_retry_counter(&self) -> u64 {
        self.connect_retry_counter.load(Ordering::Relaxed)
    }

    pub fn remote_asn(&self) -> u32 {
        self.remote_asn.load(Ordering::Relaxed)
    }

    pub fn remote_id(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.remote_id.load(Ordering::Relaxed))
    }

    pub fn hold_time(&self) -> u16 {
        self.hold_time.load(Ordering::Relaxed)
    }

    pub fn last_down_reason(&self) -> String {
        self.last_down_reason.lock().unwrap().clone()
    }

    /// (family, received, accepted, advertised) per negotiated family.
    pub fn route_stats(&self) -> Vec<(Family, u64, u64, u64)> {
        let mut v: Vec<_> = self
            .ribs
            .lock()
            .unwrap()
            .iter()
            .map(|(f, (rib_in, rib_out))| {
                (
                    *f,
                    rib_in.route_count(),
                    rib_in.accepted_count(),
                    rib_out.route_count(),
                )
            })
            .collect();
        v.sort_by_key(|(f, ..)| *f);
        v
    }

    pub fn adj_rib_in(&self, family: Family) -> Option<Arc<AdjRibIn>> {
        self.ribs.lock().unwrap().get(&family).map(|r| r.0.clone())
    }

    pub fn adj_rib_out(&self, family: Family) -> Option<Arc<AdjRibOut>> {
        self.ribs.lock().unwrap().get(&family).map(|r| r.1.clone())
    }
}

#[derive(Clone)]
pub struct FsmHandle {
    info: Arc<SessionInfo>,
    events: mpsc::UnboundedSender<Event>,
}

impl FsmHandle {
    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn state(&self) -> State {
        self.info.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.info.subscribe()
    }

    /// False once the FSM has terminated.
    pub fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }
}

/// The sessions of one peer. Collision resolution runs under its lock.
#[derive(Default)]
pub struct CollisionDomain {
    sessions: Mutex<Vec<FsmHandle>>,
}

impl CollisionDomain {
    fn register(&self, handle: FsmHandle) {
        self.sessions.lock().unwrap().push(handle);
    }

    fn unregister(&self, info: &Arc<SessionInfo>) {
        self.sessions
            .lock()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(&h.info, info));
    }

    pub fn established(&self) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .any(|h| h.state() == State::Established)
    }

    /// Whether the session `me` that just got an OPEN from `remote_id`
    /// survives. Losing siblings are sent a Cease event.
    ///
    /// RFC4271 6.8: the connection initiated by the speaker with the
    /// higher BGP identifier is kept, on both sides of the collision. A
    /// local id lower than the remote one therefore keeps the passive
    /// connection, not whichever session detected the collision first.
    /// An established sibling always wins.
    fn resolve(
        &self,
        me: &Arc<SessionInfo>,
        role: Role,
        local_id: Ipv4Addr,
        remote_id: Ipv4Addr,
    ) -> bool {
        let sessions = self.sessions.lock().unwrap();
        for other in sessions.iter().filter(|h| !Arc::ptr_eq(&h.info, me)) {
            match other.state() {
                State::Established => return false,
                State::OpenConfirm => {
                    let keep_passive = u32::from(local_id) < u32::from(remote_id);
                    if (role == Role::Passive) != keep_passive {
                        return false;
                    }
                    other.send(Event::Cease(notification::CONNECTION_COLLISION_RESOLUTION));
                }
                _ => {}
            }
        }
        true
    }
}

/// Adj-RIB-In wrapper that tears the session down once the prefix limit
/// is hit.
pub(crate) struct PrefixLimitGuard {
    inner: Arc<AdjRibIn>,
    events: mpsc::UnboundedSender<Event>,
    tripped: AtomicBool,
}

impl PrefixLimitGuard {
    pub(crate) fn new(inner: Arc<AdjRibIn>, events: mpsc::UnboundedSender<Event>) -> Self {
        PrefixLimitGuard {
            inner,
            events,
            tripped: AtomicBool::new(false),
        }
    }
}

impl RouteTableClient for PrefixLimitGuard {
    fn add_path(&self, net: &crate::packet::bgp::Net, path: Arc<Path>) -> Result<(), Error> {
        match self.inner.add_path(net, path) {
            Err(Error::PrefixLimitExceeded { limit }) => {
                if !self.tripped.swap(true, Ordering::SeqCst) {
                    let _ = self.events.send(Event::PrefixLimitExceeded(limit));
                }
                Err(Error::PrefixLimitExceeded { limit })
            }
            r => r,
        }
    }

    fn remove_path(&self, net: &crate::packet::bgp::Net, path: &Arc<Path>) -> bool {
        self.inner.remove_path(net, path)
    }

    fn route_count(&self) -> u64 {
        self.inner.route_count()
    }

    fn dump(&self) -> Vec<Route> {
        self.inner.dump()
    }
}

struct FamilyRibs {
    guard: PrefixLimitGuard,
    rib_in: Arc<AdjRibIn>,
    rib_out: Arc<AdjRibOut>,
    sender: Arc<UpdateSender>,
    loc_rib: Arc<LocRib>,
}

struct Session {
    reader: mpsc::Receiver<Result<BytesMut, Error>>,
    writer: mpsc::UnboundedSender<Bytes>,
    local: SocketAddr,
    codec: Codec,
    hold_time: Duration,
    last_activity: Instant,
    hold_check: Interval,
    keepalive: Option<Interval>,
    families: Vec<(Family, Channel)>,
    ribs: FnvHashMap<Family, FamilyRibs>,
}

enum Input {
    Event(Event),
    Message(Message),
    Error(Error),
    Closed,
    HoldTimerExpired,
    KeepaliveTimerExpired,
    Stopped,
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Fsm {
    config: Arc<PeerConfig>,
    role: Role,
    state: State,
    info: Arc<SessionInfo>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    domain: Arc<CollisionDomain>,
    session: Option<Session>,
    admin_stop: bool,
    restart_at: Option<Instant>,
}

impl Fsm {
    pub fn new(config: Arc<PeerConfig>, role: Role, domain: Arc<CollisionDomain>) -> (Fsm, FsmHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let info = Arc::new(SessionInfo::new());
        let handle = FsmHandle {
            info: info.clone(),
            events: events_tx.clone(),
        };
        domain.register(handle.clone());
        (
            Fsm {
                config,
                role,
                state: State::Idle,
                info,
                events,
                events_tx,
                domain,
                session: None,
                admin_stop: false,
                restart_at: None,
            },
            handle,
        )
    }

    pub async fn run(mut self) {
        loop {
            let (next, reason) = match self.state {
                State::Idle => self.idle().await,
                State::Connect => self.connect().await,
                State::Active => self.active().await,
                State::OpenSent => self.open_sent().await,
                State::OpenConfirm => self.open_confirm().await,
                State::Established => self.established().await,
                State::Cease => break,
            };
            self.transition(next, &reason);
        }
        debug!("{}: fsm terminated", self.config.peer_address);
    }

    fn transition(&mut self, next: State, reason: &str) {
        let old = self.state;
        if old == next {
            return;
        }
        info!(
            "{}: {} -> {}: {}",
            self.config.peer_address, old, next, reason
        );
        if old == State::Established {
            self.teardown();
        }
        match next {
            State::Established => {
                self.info.uptime.store(unix_time(), Ordering::Relaxed);
            }
            State::Idle | State::Cease => {
                self.session = None;
                *self.info.last_down_reason.lock().unwrap() = reason.to_string();
                self.restart_at = if next == State::Idle
                    && !self.admin_stop
                    && self.config.reconnect_interval > Duration::ZERO
                {
                    Some(Instant::now() + self.config.reconnect_interval)
                } else {
                    None
                };
                if next == State::Cease {
                    self.domain.unregister(&self.info);
                }
            }
            _ => {}
        }
        self.state = next;
        let _ = self.info.state_tx.send(next);
    }

    /// Failure transition back to Idle.
    fn fail(&mut self, reason: String) -> (State, String) {
        self.info
            .connect_retry_counter
            .fetch_add(1, Ordering::Relaxed);
        (State::Idle, reason)
    }

    fn stop(&mut self, reason: &str) -> (State, String) {
        self.admin_stop = true;
        self.info.connect_retry_counter.store(0, Ordering::Relaxed);
        (State::Idle, reason.to_string())
    }

    fn start(&mut self, reason: &str) -> (State, String) {
        self.admin_stop = false;
        self.info.connect_retry_counter.store(0, Ordering::Relaxed);
        match self.role {
            Role::Active => (State::Connect, reason.to_string()),
            Role::Passive => (State::Active, reason.to_string()),
        }
    }

    fn send(&mut self, msg: Message) -> bool {
        let s = match self.session.as_mut() {
            Some(s) => s,
            None => return false,
        };
        let mut buf = BytesMut::with_capacity(Message::MAX_LENGTH);
        if let Err(e) = s.codec.encode(&msg, &mut buf) {
            warn!("{}: failed to encode: {}", self.config.peer_address, e);
            return false;
        }
        if let Message::Notification { code, subcode, .. } = &msg {
            warn!(
                "{}: sending notification {}/{}",
                self.config.peer_address, code, subcode
            );
        }
        self.info.counter_tx.sync(&msg);
        s.writer.send(buf.freeze()).is_ok()
    }

    fn notify(&mut self, code: u8, subcode: u8) {
        self.send(Message::notification(code, subcode));
    }

    fn notify_error(&mut self, e: &Error) {
        if let Some((code, subcode, data)) = e.notification() {
            self.send(Message::Notification {
                code,
                subcode,
                data,
            });
        }
    }

    /// Starts the reader and writer tasks for `conn`. The reader only
    /// frames; messages are decoded here, with the negotiated options.
    fn attach(&mut self, conn: Connection) {
        let peer = self.config.peer_address;
        let (rd, mut wr) = tokio::io::split(conn.stream);
        let (msg_tx, msg_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut frames = FramedRead::new(rd, Framer::default());
            while let Some(frame) = frames.next().await {
                let failed = frame.is_err();
                if msg_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });
        let (writer, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = wr.write_all(&buf).await {
                    warn!("{}: write failed: {}", peer, e);
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });
        self.session = Some(Session {
            reader: msg_rx,
            writer,
            local: conn.local,
            codec: CodecBuilder::new().build(),
            hold_time: LARGE_HOLD_TIME,
            last_activity: Instant::now(),
            hold_check: tokio::time::interval(Duration::from_secs(1)),
            keepalive: None,
            families: Vec::new(),
            ribs: FnvHashMap::default(),
        });
    }

    fn local_capabilities(&self) -> Vec<Capability> {
        let mut v = Vec::new();
        for f in &self.config.families {
            if f.family != Family::IPV4 || self.config.advertise_ipv4_multiprotocol {
                v.push(Capability::MultiProtocol(f.family));
            }
        }
        v.push(Capability::RouteRefresh);
        v.push(Capability::FourOctetAsNumber(self.config.local_as));
        let addpath: Vec<(Family, u8)> = self
            .config
            .families
            .iter()
            .filter_map(|f| {
                let mut mode = 0;
                if f.add_path_recv {
                    mode |= Capability::ADD_PATH_RECEIVE;
                }
                if !f.add_path_send.best_only {
                    mode |= Capability::ADD_PATH_SEND;
                }
                if mode == 0 {
                    None
                } else {
                    Some((f.family, mode))
                }
            })
            .collect();
        if !addpath.is_empty() {
            v.push(Capability::AddPath(addpath));
        }
        if self.config.graceful_restart {
            v.push(Capability::GracefulRestart(
                0,
                120,
                self.config.families.iter().map(|f| (f.family, 0)).collect(),
            ));
        }
        v
    }

    fn send_open(&mut self) -> bool {
        let open = Message::Open(Open {
            version: 4,
            as_number: self.config.local_as,
            holdtime: self.config.hold_time,
            router_id: self.config.router_id,
            capability: self.local_capabilities(),
        });
        self.send(open)
    }

    fn accept_connection(&mut self, conn: Connection, reason: &str) -> (State, String) {
        self.attach(conn);
        if self.send_open() {
            (State::OpenSent, reason.to_string())
        } else {
            self.fail("failed to send open".to_string())
        }
    }

    /// IPv4 unicast is implied unless the peer lists its families.
    fn negotiate(&self, remote: &[Capability]) -> Vec<(Family, Channel)> {
        let mut local = self.local_capabilities();
        let ipv4 = Capability::MultiProtocol(Family::IPV4);
        if self.config.families.iter().any(|f| f.family == Family::IPV4) && !local.contains(&ipv4)
        {
            local.push(ipv4.clone());
        }
        let mut remote = remote.to_vec();
        if !remote
            .iter()
            .any(|c| matches!(c, Capability::MultiProtocol(_)))
        {
            remote.push(ipv4);
        }
        let mut v: Vec<(Family, Channel)> = create_channel(&local, &remote).collect();
        v.sort_by_key(|(f, _)| *f);
        v
    }

    async fn next_input(&mut self) -> Input {
        let events = &mut self.events;
        let info = &self.info;
        let s = match self.session.as_mut() {
            Some(s) => s,
            None => {
                return match events.recv().await {
                    Some(e) => Input::Event(e),
                    None => Input::Stopped,
                }
            }
        };
        loop {
            tokio::select! {
                ev = events.recv() => {
                    return match ev {
                        Some(e) => Input::Event(e),
                        None => Input::Stopped,
                    };
                }
                frame = s.reader.recv() => {
                    return match frame {
                        None => Input::Closed,
                        Some(Err(e)) => Input::Error(e),
                        Some(Ok(buf)) => match s.codec.parse(&buf) {
                            Ok(msg) => {
                                info.counter_rx.sync(&msg);
                                Input::Message(msg)
                            }
                            Err(e) => Input::Error(e),
                        },
                    };
                }
                _ = s.hold_check.tick() => {
                    if s.hold_time > Duration::ZERO && s.last_activity.elapsed() > s.hold_time {
                        return Input::HoldTimerExpired;
                    }
                }
                _ = tick(&mut s.keepalive) => return Input::KeepaliveTimerExpired,
            }
        }
    }

    /// Handling shared by the states that own a connection.
    fn on_session_input(&mut self, input: Input) -> Option<(State, String)> {
        match input {
            Input::Event(Event::ManualStop) => {
                self.notify(notification::CEASE, notification::ADMINISTRATIVE_SHUTDOWN);
                Some(self.stop("manual stop"))
            }
            Input::Event(Event::AutomaticStop) => {
                self.notify(notification::CEASE, notification::ADMINISTRATIVE_SHUTDOWN);
                Some(self.fail("automatic stop".to_string()))
            }
            Input::Event(Event::Cease(subcode)) => {
                self.notify(notification::CEASE, subcode);
                Some((State::Cease, format!("cease {}", subcode)))
            }
            Input::Event(Event::PrefixLimitExceeded(limit)) => {
                self.notify(notification::CEASE, notification::ADMINISTRATIVE_SHUTDOWN);
                Some(self.fail(format!("prefix limit {} exceeded", limit)))
            }
            Input::Event(Event::TcpConnectionConfirmed(conn)) => {
                debug!(
                    "{}: dropping extra connection from {}",
                    self.config.peer_address,
                    conn.remote()
                );
                None
            }
            Input::Event(Event::ManualStart) | Input::Event(Event::AutomaticStart) => None,
            Input::Stopped => {
                self.notify(notification::CEASE, notification::PEER_DECONFIGURED);
                Some((State::Cease, "peer removed".to_string()))
            }
            Input::Message(Message::Notification {
                code,
                subcode,
                data: _,
            }) => {
                warn!(
                    "{}: notification {}/{} received",
                    self.config.peer_address, code, subcode
                );
                Some(self.fail(format!("notification {}/{} received", code, subcode)))
            }
            Input::Error(e) => {
                self.notify_error(&e);
                Some(self.fail(format!("{}", e)))
            }
            Input::Closed => Some(self.fail("connection closed".to_string())),
            Input::HoldTimerExpired => {
                self.notify(notification::HOLD_TIMER_EXPIRED, 0);
                Some(self.fail("hold timer expired".to_string()))
            }
            Input::KeepaliveTimerExpired => {
                if self.send(Message::Keepalive) {
                    None
                } else {
                    Some(self.fail("failed to send keepalive".to_string()))
                }
            }
            Input::Message(_) => {
                self.notify(notification::FSM_ERROR, 0);
                Some(self.fail(format!("unexpected message in {}", self.state)))
            }
        }
    }

    async fn idle(&mut self) -> (State, String) {
        let far = Instant::now() + Duration::from_secs(86400 * 365);
        let restart = self.restart_at.unwrap_or(far);
        let sleep = tokio::time::sleep_until(restart);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                ev = self.events.recv() => match ev {
                    None => return (State::Cease, "peer removed".to_string()),
                    Some(Event::ManualStart) => return self.start("manual start"),
                    Some(Event::AutomaticStart) => {
                        if !self.admin_stop {
                            return self.start("automatic start");
                        }
                    }
                    Some(Event::Cease(_)) => return (State::Cease, "cease".to_string()),
                    Some(Event::TcpConnectionConfirmed(conn)) => {
                        if !self.admin_stop {
                            return self.accept_connection(conn, "connection accepted");
                        }
                    }
                    Some(_) => {}
                },
                _ = &mut sleep, if self.restart_at.is_some() => {
                    self.restart_at = None;
                    return self.start("automatic start");
                }
            }
        }
    }

    async fn connect(&mut self) -> (State, String) {
        let remote = SocketAddr::new(self.config.peer_address, self.config.peer_port);
        let connecting = net::connect(remote, self.config.local_address, self.config.ttl);
        tokio::pin!(connecting);
        let retry = tokio::time::sleep(self.connect_retry_time());
        tokio::pin!(retry);
        loop {
            tokio::select! {
                res = &mut connecting => {
                    return match res.and_then(Connection::from_tcp) {
                        Ok(conn) => self.accept_connection(conn, "tcp connection succeeded"),
                        Err(e) => (State::Active, format!("tcp connection failed: {}", e)),
                    };
                }
                _ = &mut retry => return (State::Connect, "connect retry timer expired".to_string()),
                ev = self.events.recv() => match ev {
                    None => return (State::Cease, "peer removed".to_string()),
                    Some(Event::ManualStop) => return self.stop("manual stop"),
                    Some(Event::Cease(_)) => return (State::Cease, "cease".to_string()),
                    Some(_) => {}
                },
            }
        }
    }

    fn connect_retry_time(&self) -> Duration {
        std::cmp::max(self.config.reconnect_interval, Duration::from_secs(1))
    }

    async fn active(&mut self) -> (State, String) {
        let retry = tokio::time::sleep(self.connect_retry_time());
        tokio::pin!(retry);
        let dial = self.role == Role::Active;
        loop {
            tokio::select! {
                _ = &mut retry, if dial => {
                    return (State::Connect, "connect retry timer expired".to_string());
                }
                ev = self.events.recv() => match ev {
                    None => return (State::Cease, "peer removed".to_string()),
                    Some(Event::ManualStop) => return self.stop("manual stop"),
                    Some(Event::Cease(_)) => return (State::Cease, "cease".to_string()),
                    Some(Event::TcpConnectionConfirmed(conn)) => {
                        return self.accept_connection(conn, "tcp connection confirmed");
                    }
                    Some(_) => {}
                },
            }
        }
    }

    async fn open_sent(&mut self) -> (State, String) {
        loop {
            match self.next_input().await {
                Input::Message(Message::Open(open)) => return self.handle_open(open),
                input => {
                    if let Some(next) = self.on_session_input(input) {
                        return next;
                    }
                }
            }
        }
    }

    fn handle_open(&mut self, open: Open) -> (State, String) {
        let asn = open.four_octet_as_number().unwrap_or(open.as_number);
        if asn != self.config.peer_as {
            self.notify(notification::OPEN_MESSAGE_ERROR, notification::BAD_PEER_AS);
            return self.fail(format!("bad peer as {}", asn));
        }
        if open.holdtime == 1 || open.holdtime == 2 {
            self.notify(
                notification::OPEN_MESSAGE_ERROR,
                notification::UNACCEPTABLE_HOLD_TIME,
            );
            return self.fail(format!("unacceptable hold time {}", open.holdtime));
        }
        if open.router_id == self.config.router_id {
            self.notify(
                notification::OPEN_MESSAGE_ERROR,
                notification::BAD_BGP_IDENTIFIER,
            );
            return self.fail(format!("same router id {}", open.router_id));
        }
        if !self
            .domain
            .resolve(&self.info, self.role, self.config.router_id, open.router_id)
        {
            self.notify(
                notification::CEASE,
                notification::CONNECTION_COLLISION_RESOLUTION,
            );
            return (State::Cease, "connection collision".to_string());
        }

        let families = self.negotiate(&open.capability);
        let four_octet = open.four_octet_as_number().is_some();
        let hold_time = std::cmp::min(self.config.hold_time, open.holdtime);
        self.info.remote_asn.store(asn, Ordering::Relaxed);
        self.info
            .remote_id
            .store(u32::from(open.router_id), Ordering::Relaxed);
        self.info.hold_time.store(hold_time, Ordering::Relaxed);

        if let Some(s) = self.session.as_mut() {
            let mut builder = CodecBuilder::new();
            builder
                .four_octet_asn(four_octet)
                .families(families.iter().map(|(f, _)| *f).collect());
            for (f, c) in &families {
                builder.addpath(*f, c.addpath_rx(), c.addpath_tx());
            }
            s.codec = builder.build();
            s.families = families;
            s.hold_time = Duration::from_secs(hold_time as u64);
            s.last_activity = Instant::now();
            if hold_time != 0 {
                let period = Duration::from_secs(hold_time as u64 / 3);
                s.keepalive = Some(tokio::time::interval_at(Instant::now() + period, period));
            }
        }
        if !self.send(Message::Keepalive) {
            return self.fail("failed to send keepalive".to_string());
        }
        (State::OpenConfirm, "open received".to_string())
    }

    async fn open_confirm(&mut self) -> (State, String) {
        loop {
            match self.next_input().await {
                Input::Message(Message::Keepalive) => {
                    self.establish();
                    return (State::Established, "keepalive received".to_string());
                }
                input => {
                    if let Some(next) = self.on_session_input(input) {
                        return next;
                    }
                }
            }
        }
    }

    /// Wires the session into the RIBs of its VRF.
    fn establish(&mut self) {
        let config = self.config.clone();
        let ibgp = config.local_as == config.peer_as;
        let events = self.events_tx.clone();
        let counter = self.info.counter_tx.clone();
        let s = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };
        s.last_activity = Instant::now();
        let mut stats = FnvHashMap::default();
        for (family, channel) in &s.families {
            let fc = match config.families.iter().find(|f| f.family == *family) {
                Some(fc) => fc,
                None => continue,
            };
            let loc_rib = match config.vrf.rib_by_family(*family) {
                Some(r) => r,
                None => {
                    warn!(
                        "{}: no rib for {} in vrf {}",
                        config.peer_address,
                        family,
                        config.vrf.name()
                    );
                    continue;
                }
            };
            let rib_in = Arc::new(AdjRibIn::new(
                fc.import_filter.clone(),
                AdjRibInOptions {
                    add_path: channel.addpath_rx(),
                    router_id: Some(config.router_id),
                    cluster_id: Some(u32::from(config.cluster_id)),
                    local_asns: vec![config.local_as],
                    max_prefixes: fc.prefix_limit,
                },
            ));
            rib_in.register(loc_rib.clone());

            let rib_out = Arc::new(AdjRibOut::new(
                NeighborInfo {
                    address: config.peer_address,
                    local_address: s.local.ip(),
                    local_as: config.local_as,
                    peer_as: config.peer_as,
                    router_id: config.router_id,
                    route_server_client: config.route_server_client,
                    route_reflector_client: config.route_reflector_client,
                    cluster_id: u32::from(config.cluster_id),
                },
                channel.addpath_tx(),
                fc.export_filter.clone(),
            ));
            let sender = Arc::new(UpdateSender::new(
                SenderOptions {
                    peer: config.peer_address,
                    family: *family,
                    ibgp,
                    route_reflector_client: config.route_reflector_client,
                },
                s.codec.clone(),
                s.writer.clone(),
                counter.clone(),
            ));
            rib_out.register(sender.clone());
            sender.start();
            loc_rib.register_with_options(
                rib_out.clone(),
                rib_out.client_options(fc.add_path_send.max_paths),
            );
            sender.end_of_rib();

            stats.insert(*family, (rib_in.clone(), rib_out.clone()));
            s.ribs.insert(
                *family,
                FamilyRibs {
                    guard: PrefixLimitGuard::new(rib_in.clone(), events.clone()),
                    rib_in,
                    rib_out,
                    sender,
                    loc_rib,
                },
            );
        }
        *self.info.ribs.lock().unwrap() = stats;
    }

    fn teardown(&mut self) {
        let s = match self.session.as_mut() {
            Some(s) => s,
            None => return,
        };
        for (_, r) in s.ribs.drain() {
            let rib_out: Arc<dyn RouteTableClient> = r.rib_out.clone();
            r.loc_rib.unregister(&rib_out);
            let sender: Arc<dyn RouteTableClient> = r.sender.clone();
            r.rib_out.unregister(&sender);
            r.sender.destroy();
            let loc_rib: Arc<dyn RouteTableClient> = r.loc_rib.clone();
            r.rib_in.unregister(&loc_rib);
        }
        self.info.ribs.lock().unwrap().clear();
    }

    async fn established(&mut self) -> (State, String) {
        loop {
            match self.next_input().await {
                Input::Message(Message::Update(update)) => {
                    if let Some(s) = self.session.as_mut() {
                        s.last_activity = Instant::now();
                    }
                    self.process_update(update);
                }
                Input::Message(Message::Keepalive) => {
                    if let Some(s) = self.session.as_mut() {
                        s.last_activity = Instant::now();
                    }
                }
                Input::Message(Message::RouteRefresh { family }) => {
                    if let Some(r) = self.session.as_ref().and_then(|s| s.ribs.get(&family)) {
                        if let Err(e) = r.rib_out.update_new_client(r.sender.clone()) {
                            warn!("{}: route refresh failed: {}", self.config.peer_address, e);
                        }
                    }
                }
                input => {
                    if let Some(next) = self.on_session_input(input) {
                        return next;
                    }
                }
            }
        }
    }

    fn process_update(&mut self, update: Update) {
        let peer = self.config.peer_address;
        if let Some(family) = update.end_of_rib() {
            debug!("{}: end-of-rib for {}", peer, family);
            return;
        }
        let ebgp = self.config.local_as != self.config.peer_as;
        let remote_id = self.info.remote_id();
        let ribs = match self.session.as_ref() {
            Some(s) => &s.ribs,
            None => return,
        };
        apply_update(
            peer,
            &update,
            |family| ribs.get(&family).map(|r| &r.guard as &dyn RouteTableClient),
            |p| {
                p.ebgp = ebgp;
                p.bgp_identifier = remote_id;
            },
        );
    }
}

/// Feeds one UPDATE into per-family tables, withdrawals before
/// announcements. IPv4 NLRI take NEXT_HOP, MP_REACH NLRI the next hop
/// carried in the attribute.
pub(crate) fn apply_update<'a, R, C>(source: IpAddr, update: &Update, rib: R, customize: C)
where
    R: Fn(Family) -> Option<&'a dyn RouteTableClient>,
    C: Fn(&mut BgpPath),
{
    let withdraw = |family: Family, nlri: &[Nlri]| match rib(family) {
        Some(r) => {
            for n in nlri {
                let mut p = BgpPath::new(source, source);
                p.path_id = n.path_id;
                r.remove_path(&n.net, &Arc::new(Path::Bgp(p)));
            }
        }
        None => debug!("{}: ignoring withdrawal for {}", source, family),
    };
    withdraw(Family::IPV4, &update.withdrawn);
    if let Some(mp) = update.mp_unreach() {
        withdraw(mp.family, &mp.nlri);
    }
    if update.nlri.is_empty() && update.mp_reach().is_none() {
        return;
    }

    let mut path = BgpPath::from_attrs(&update.attrs, source);
    customize(&mut path);
    let v4_next_hop = update.attrs.iter().find_map(|a| match a {
        Attribute::NextHop(addr) => Some(IpAddr::V4(*addr)),
        _ => None,
    });
    let announce = |family: Family, nlri: &[Nlri], next_hop: Option<IpAddr>| match rib(family) {
        Some(r) => {
            for n in nlri {
                let mut p = path.clone();
                p.path_id = n.path_id;
                if let Some(nh) = next_hop {
                    p.next_hop = nh;
                }
                if let Err(e) = r.add_path(&n.net, Arc::new(Path::Bgp(p))) {
                    warn!("{}: dropping {}: {}", source, n.net, e);
                }
            }
        }
        None => debug!("{}: ignoring announcement for {}", source, family),
    };
    announce(Family::IPV4, &update.nlri, v4_next_hop);
    if let Some(mp) = update.mp_reach() {
        announce(mp.family, &mp.nlri, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConfig;
    use crate::table::vrf::{RouteDistinguisher, VrfRegistry};
    use futures::SinkExt;
    use tokio_util::codec::Framed;

    fn config(reconnect: u64) -> PeerConfig {
        let vrf = VrfRegistry::new()
            .create_vrf("master", RouteDistinguisher::default())
            .unwrap();
        let mut c = PeerConfig::new(
            "192.0.2.2".parse().unwrap(),
            65001,
            65000,
            Ipv4Addr::new(1, 1, 1, 1),
            vrf,
        );
        c.reconnect_interval = Duration::from_secs(reconnect);
        c
    }

    fn connection() -> (Connection, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (
            Connection::new(
                a,
                "192.0.2.1:179".parse().unwrap(),
                "192.0.2.2:40000".parse().unwrap(),
            ),
            b,
        )
    }

    fn remote_open(asn: u32) -> Message {
        Message::Open(Open {
            version: 4,
            as_number: asn,
            holdtime: 90,
            router_id: Ipv4Addr::new(2, 2, 2, 2),
            capability: vec![Capability::FourOctetAsNumber(asn)],
        })
    }

    async fn wait_state(rx: &mut watch::Receiver<State>, state: State) {
        while *rx.borrow() != state {
            rx.changed().await.unwrap();
        }
    }

    #[test]
    fn collision_keeps_connection_from_higher_id() {
        let low = Ipv4Addr::new(1, 1, 1, 1);
        let high = Ipv4Addr::new(2, 2, 2, 2);
        let config = Arc::new(config(0));

        // lower local id: the connection the neighbor opened wins
        let domain = Arc::new(CollisionDomain::default());
        let (mut active, _) = Fsm::new(config.clone(), Role::Active, domain.clone());
        let (passive, _) = Fsm::new(config.clone(), Role::Passive, domain.clone());
        let _ = active.info.state_tx.send(State::OpenConfirm);
        assert!(domain.resolve(&passive.info, Role::Passive, low, high));
        assert!(matches!(
            active.events.try_recv(),
            Ok(Event::Cease(notification::CONNECTION_COLLISION_RESOLUTION))
        ));

        let domain = Arc::new(CollisionDomain::default());
        let (active, _) = Fsm::new(config.clone(), Role::Active, domain.clone());
        let (mut passive, _) = Fsm::new(config.clone(), Role::Passive, domain.clone());
        let _ = passive.info.state_tx.send(State::OpenConfirm);
        assert!(!domain.resolve(&active.info, Role::Active, low, high));
        assert!(passive.events.try_recv().is_err());
        // higher local id: our own connection wins
        assert!(domain.resolve(&active.info, Role::Active, high, low));

        let _ = passive.info.state_tx.send(State::Established);
        assert!(!domain.resolve(&active.info, Role::Active, high, low));
    }

    #[test]
    fn counter() {
        let c = MessageCounter::default();
        c.sync(&Message::Keepalive);
        c.sync(&Message::Update(Update {
            withdrawn: vec![
                Nlri::new("10.0.0.0/8".parse().unwrap()),
                Nlri::new("11.0.0.0/8".parse().unwrap()),
            ],
            ..Default::default()
        }));
        let s = MessageStats::from(&c);
        assert_eq!(s.keepalive, 1);
        assert_eq!(s.update, 1);
        assert_eq!(s.withdraw_update, 1);
        assert_eq!(s.withdraw_prefix, 2);
        assert_eq!(s.total, 2);
    }

    #[tokio::test]
    async fn bad_peer_as() {
        let (fsm, handle) = Fsm::new(
            Arc::new(config(0)),
            Role::Passive,
            Arc::new(CollisionDomain::default()),
        );
        tokio::spawn(fsm.run());
        let (conn, remote) = connection();
        let mut st = handle.subscribe();
        assert!(handle.send(Event::TcpConnectionConfirmed(conn)));

        let mut framed = Framed::new(remote, CodecBuilder::new().build());
        match framed.next().await.unwrap().unwrap() {
            Message::Open(open) => assert_eq!(open.as_number, 65000),
            m => panic!("unexpected {:?}", m),
        }
        framed.send(&remote_open(65099)).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            Message::Notification { code, subcode, .. } => {
                assert_eq!((code, subcode), (2, 2));
            }
            m => panic!("unexpected {:?}", m),
        }
        wait_state(&mut st, State::Idle).await;
        assert_eq!(handle.info().connect_retry_counter(), 1);
    }

    #[tokio::test]
    async fn establish_and_receive_routes() {
        let config = Arc::new(config(0));
        let loc_rib = config.vrf.ipv4_unicast_rib();
        let (fsm, handle) = Fsm::new(
            config.clone(),
            Role::Passive,
            Arc::new(CollisionDomain::default()),
        );
        tokio::spawn(fsm.run());
        let (conn, remote) = connection();
        let mut st = handle.subscribe();
        handle.send(Event::ManualStart);
        wait_state(&mut st, State::Active).await;
        handle.send(Event::TcpConnectionConfirmed(conn));

        let mut framed = Framed::new(remote, CodecBuilder::new().build());
        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Message::Open(_)
        ));
        framed.send(&remote_open(65001)).await.unwrap();
        framed.send(&Message::Keepalive).await.unwrap();
        wait_state(&mut st, State::Established).await;
        assert_eq!(handle.info().remote_asn(), 65001);
        assert_eq!(handle.info().hold_time(), 90);

        let update = Update {
            attrs: vec![
                Attribute::Origin(Attribute::ORIGIN_IGP),
                Attribute::AsPath("65001".parse().unwrap()),
                Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 2)),
            ],
            nlri: vec![Nlri::new("10.0.0.0/8".parse().unwrap())],
            ..Default::default()
        };
        framed.send(&Message::Update(update)).await.unwrap();
        while loc_rib.route_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let route = loc_rib.get(&"10.0.0.0/8".parse().unwrap()).unwrap();
        let best = route.best_path().unwrap().bgp().unwrap();
        assert!(best.ebgp);
        assert_eq!(best.bgp_identifier, Ipv4Addr::new(2, 2, 2, 2));

        framed
            .send(&Message::Update(Update {
                withdrawn: vec![Nlri::new("10.0.0.0/8".parse().unwrap())],
                ..Default::default()
            }))
            .await
            .unwrap();
        while loc_rib.route_count() != 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(handle.info().route_stats()[0].1, 0);

        handle.send(Event::ManualStop);
        wait_state(&mut st, State::Idle).await;
        assert_eq!(handle.info().last_down_reason(), "manual stop");
    }
}
