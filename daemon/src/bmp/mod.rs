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

//! BMP receiver: collects the RIBs of monitored routers.

pub mod router;

pub use router::{Router, RouterConfig, RouterStats};

use fnv::FnvHashMap;
use futures::StreamExt;
use log::{info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;

use crate::config;
use crate::error::Error;
use crate::net;
use crate::table::VrfRegistry;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect delay for routers we dial, doubling on every failure
/// (RFC7854 section 3.2).
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    current: u64,
}

impl Backoff {
    const MIN: u64 = 30;
    const MAX: u64 = 720;

    pub(crate) fn failed(&mut self) -> Duration {
        self.current = if self.current == 0 {
            Backoff::MIN
        } else {
            std::cmp::min(self.current * 2, Backoff::MAX)
        };
        Duration::from_secs(self.current)
    }

    pub(crate) fn reset(&mut self) -> Duration {
        self.current = Backoff::MIN;
        Duration::from_secs(self.current)
    }
}

pub struct BmpReceiver {
    routers: RwLock<FnvHashMap<IpAddr, Arc<Router>>>,
    accept_any: bool,
    keepalive: Option<Duration>,
    /// Applied to routers admitted through `accept_any`.
    dynamic_config: RouterConfig,
}

impl BmpReceiver {
    pub fn new(accept_any: bool, keepalive: Option<Duration>) -> Self {
        BmpReceiver {
            routers: RwLock::new(FnvHashMap::default()),
            accept_any,
            keepalive,
            dynamic_config: RouterConfig {
                passive: true,
                ..Default::default()
            },
        }
    }

    /// Builds the receiver and its configured routers. Must be called
    /// within a runtime when any router is active.
    pub fn from_config(
        c: &config::BmpReceiver,
        vrfs: &VrfRegistry,
    ) -> Result<Arc<BmpReceiver>, Error> {
        let b = Arc::new(BmpReceiver::new(
            c.accept_any,
            c.keepalive_period.map(Duration::from_secs),
        ));
        for r in &c.routers {
            let address: IpAddr = r.address.parse().map_err(|_| {
                Error::InvalidConfiguration(format!("can't parse bmp router {}", r.address))
            })?;
            let vrf = match &r.vrf {
                Some(name) => Some(vrfs.get_by_name(name).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("unknown vrf {}", name))
                })?),
                None => None,
            };
            let router = b.add_router(
                address,
                r.port,
                RouterConfig {
                    passive: r.passive,
                    ignore_peer_asns: r.ignore_peer_asns.clone(),
                    ignore_pre_policy: r.ignore_pre_policy,
                    ignore_post_policy: r.ignore_post_policy,
                },
                vrf,
            )?;
            if let Some(name) = &r.name {
                info!("bmp router {} configured as {}", router.address(), name);
            }
        }
        Ok(b)
    }

    pub fn add_router(
        self: &Arc<Self>,
        address: IpAddr,
        port: u16,
        config: RouterConfig,
        vrf: Option<Arc<crate::table::Vrf>>,
    ) -> Result<Arc<Router>, Error> {
        let mut routers = self.routers.write().unwrap();
        if routers.contains_key(&address) {
            return Err(Error::AlreadyExists(format!(
                "bmp router {} already exists",
                address
            )));
        }
        let router = Arc::new(Router::new(address, port, config, vrf));
        routers.insert(address, router.clone());
        if !router.config().passive {
            tokio::spawn(self.clone().dial(router.clone()));
        }
        Ok(router)
    }

    pub fn remove_router(&self, address: &IpAddr) -> Option<Arc<Router>> {
        let r = self.routers.write().unwrap().remove(address);
        if let Some(r) = &r {
            r.stop();
        }
        r
    }

    pub fn get_router(&self, address: &IpAddr) -> Option<Arc<Router>> {
        self.routers.read().unwrap().get(address).cloned()
    }

    pub fn routers(&self) -> Vec<Arc<Router>> {
        let mut v: Vec<Arc<Router>> = self.routers.read().unwrap().values().cloned().collect();
        v.sort_by_key(|r| r.address());
        v
    }

    /// Takes an incoming connection from `remote`. Unknown routers are
    /// admitted only with `accept_any`; a router that is already
    /// connected, or that we dial ourselves, is refused.
    pub fn accept<S>(self: &Arc<Self>, stream: S, remote: SocketAddr) -> bool
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let address = remote.ip();
        let (router, dynamic) = match self.get_router(&address) {
            Some(r) => (r, false),
            None => {
                if !self.accept_any {
                    warn!("{}: dropping connection from unconfigured bmp router", remote);
                    return false;
                }
                match self.add_router(address, remote.port(), self.dynamic_config.clone(), None) {
                    Ok(r) => (r, true),
                    Err(e) => {
                        warn!("{}: failed to add bmp router: {}", remote, e);
                        return false;
                    }
                }
            }
        };
        if !router.config().passive {
            warn!("{}: dropping connection from active bmp router", remote);
            return false;
        }
        if router
            .established
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("{}: bmp router already connected", remote);
            return false;
        }
        let b = self.clone();
        tokio::spawn(async move { b.handle_connection(router, stream, dynamic).await });
        true
    }

    async fn handle_connection<S: AsyncRead + Unpin>(
        &self,
        router: Arc<Router>,
        stream: S,
        dynamic: bool,
    ) {
        info!("{}: bmp router connected", router.address());
        router
            .established
            .store(true, std::sync::atomic::Ordering::SeqCst);
        match router.serve(stream).await {
            Ok(()) => info!("{}: bmp session closed", router.address()),
            Err(e) => {
                if dynamic && router.initiation_count() == 0 {
                    info!(
                        "{}: dynamic bmp router failed before initiation: {}",
                        router.address(),
                        e
                    );
                    self.remove_router(&router.address());
                } else {
                    warn!("{}: bmp session failed: {}", router.address(), e);
                }
            }
        }
    }

    fn prepare(&self, stream: &TcpStream) {
        if let Some(period) = self.keepalive {
            if let Err(e) = net::set_keepalive(stream, period) {
                warn!("failed to set tcp keepalive: {}", e);
            }
        }
    }

    async fn dial(self: Arc<Self>, router: Arc<Router>) {
        let mut backoff = Backoff::default();
        let mut wait = Duration::from_secs(0);
        let mut stop = router.stop_signal();
        let remote = SocketAddr::new(router.address(), router.port());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => {}
            }
            if router.is_stopped() {
                info!("{}: stop dialing bmp router", remote);
                return;
            }
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(remote)).await {
                Ok(Ok(stream)) => {
                    wait = backoff.reset();
                    self.prepare(&stream);
                    self.handle_connection(router.clone(), stream, false).await;
                }
                Ok(Err(e)) => {
                    wait = backoff.failed();
                    info!("{}: failed to connect to bmp router: {}", remote, e);
                }
                Err(_) => {
                    wait = backoff.failed();
                    info!("{}: timed out connecting to bmp router", remote);
                }
            }
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(stream) => {
                    let remote = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!("failed to get bmp peer address: {}", e);
                            continue;
                        }
                    };
                    self.prepare(&stream);
                    self.accept(stream, remote);
                }
                Err(e) => warn!("failed to accept bmp connection: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::router::tests::{peer_up, route_monitoring};
    use super::*;
    use crate::packet::bmp::{BmpCodec, Message};
    use crate::table::vrf::RouteDistinguisher;
    use crate::table::RouteTableClient;
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    fn encode(msgs: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut codec = BmpCodec::new();
        for m in msgs {
            codec.encode(m, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn backoff() {
        let mut b = Backoff::default();
        let v: Vec<u64> = (0..7).map(|_| b.failed().as_secs()).collect();
        assert_eq!(v, vec![30, 60, 120, 240, 480, 720, 720]);
        assert_eq!(b.reset().as_secs(), 30);
        assert_eq!(b.failed().as_secs(), 60);
    }

    #[tokio::test]
    async fn passive_router() {
        let b = Arc::new(BmpReceiver::new(false, None));
        let remote: SocketAddr = "198.51.100.1:50000".parse().unwrap();
        let (_a, stranger) = tokio::io::duplex(64);
        assert!(!b.accept(stranger, remote));

        let router = b
            .add_router(
                remote.ip(),
                0,
                RouterConfig {
                    passive: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert!(matches!(
            b.add_router(remote.ip(), 0, RouterConfig::default(), None),
            Err(Error::AlreadyExists(_))
        ));

        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        assert!(b.accept(rx, remote));
        let (_c, second) = tokio::io::duplex(64);
        assert!(!b.accept(second, remote));

        tx.write_all(&encode(&[
            Message::Initiation(Vec::new()),
            peer_up("192.0.2.1", 65001),
            route_monitoring("192.0.2.1", 65001, "10.0.0.0/8", false),
        ]))
        .await
        .unwrap();
        let vrfs = router.vrfs().clone();
        while vrfs
            .get_by_rd(RouteDistinguisher::default())
            .map(|v| v.ipv4_unicast_rib().route_count())
            .unwrap_or(0)
            == 0
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(router.is_connected());

        drop(tx);
        while router.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(router.neighbors().is_empty());
        let loc_rib = vrfs
            .get_by_rd(RouteDistinguisher::default())
            .unwrap()
            .ipv4_unicast_rib();
        assert_eq!(loc_rib.route_count(), 0);
        // configured routers survive a failed session
        assert!(b.get_router(&remote.ip()).is_some());
    }

    #[tokio::test]
    async fn dynamic_router_removed_without_initiation() {
        let b = Arc::new(BmpReceiver::new(true, None));
        let remote: SocketAddr = "198.51.100.2:50000".parse().unwrap();
        let (tx, rx) = tokio::io::duplex(64);
        assert!(b.accept(rx, remote));
        assert_eq!(b.routers().len(), 1);
        drop(tx);
        while b.get_router(&remote.ip()).is_some() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
