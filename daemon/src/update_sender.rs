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

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use log::{debug, error};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Encoder;

use crate::error::Error;
use crate::fsm::MessageCounter;
use crate::packet::bgp::{Attribute, Codec, Family, Message, MpUnreach, Net, Nlri, Update};
use crate::table::client::RouteTableClient;
use crate::table::Path;

/// Announcements waiting for the next tick, grouped by attributes.
#[derive(Default)]
struct PendingTx {
    reach: FnvHashMap<(Net, u32), u64>,
    bucket: FnvHashMap<u64, (Arc<Path>, Vec<Net>)>,
}

impl PendingTx {
    fn is_empty(&self) -> bool {
        self.reach.is_empty()
    }

    fn insert(&mut self, net: Net, path: Arc<Path>, key: u64) {
        if let Some(old) = self.reach.insert((net, path.path_id()), key) {
            if old == key {
                return;
            }
            self.detach(old, &net);
        }
        self.bucket
            .entry(key)
            .or_insert_with(|| (path, Vec::new()))
            .1
            .push(net);
    }

    fn remove(&mut self, net: &Net, path_id: u32) {
        if let Some(old) = self.reach.remove(&(*net, path_id)) {
            self.detach(old, net);
        }
    }

    fn detach(&mut self, key: u64, net: &Net) {
        if let Some((_, nets)) = self.bucket.get_mut(&key) {
            nets.retain(|n| n != net);
            if nets.is_empty() {
                self.bucket.remove(&key);
            }
        }
    }

    fn drain(&mut self) -> Vec<(Arc<Path>, Vec<Net>)> {
        self.reach.clear();
        self.bucket.drain().map(|(_, v)| v).collect()
    }
}

/// Session parameters the UPDATE encoding depends on.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub peer: IpAddr,
    pub family: Family,
    pub ibgp: bool,
    pub route_reflector_client: bool,
}

/// Turns Adj-RIB-Out changes into UPDATE messages for one session and
/// family. Announcements are batched per attribute set and drained by a
/// ticker; withdrawals go out immediately.
pub struct UpdateSender {
    opts: SenderOptions,
    codec: Mutex<Codec>,
    tx: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<PendingTx>,
    counter: Arc<MessageCounter>,
    destroy: Mutex<Option<oneshot::Sender<()>>>,
}

impl UpdateSender {
    pub const INTERVAL: Duration = Duration::from_millis(5);

    pub fn new(
        opts: SenderOptions,
        codec: Codec,
        tx: mpsc::UnboundedSender<Bytes>,
        counter: Arc<MessageCounter>,
    ) -> Self {
        UpdateSender {
            opts,
            codec: Mutex::new(codec),
            tx,
            pending: Mutex::new(PendingTx::default()),
            counter,
            destroy: Mutex::new(None),
        }
    }

    pub fn family(&self) -> Family {
        self.opts.family
    }

    /// Spawns the batching ticker. It runs until `destroy`.
    pub fn start(self: &Arc<Self>) {
        let (destroy_tx, mut destroy_rx) = oneshot::channel();
        *self.destroy.lock().unwrap() = Some(destroy_tx);
        let sender = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UpdateSender::INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut destroy_rx => break,
                    _ = ticker.tick() => {
                        sender.flush();
                    }
                }
            }
            debug!("{}: update sender for {} stopped", sender.opts.peer, sender.opts.family);
        });
    }

    pub fn destroy(&self) {
        if let Some(tx) = self.destroy.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Sends every pending announcement now. Returns the number of
    /// UPDATE messages written.
    pub fn flush(&self) -> usize {
        let buckets = self.pending.lock().unwrap().drain();
        if buckets.is_empty() {
            return 0;
        }
        let mut codec = self.codec.lock().unwrap();
        buckets
            .into_iter()
            .map(|(path, nets)| self.send_bucket(&mut codec, &path, nets))
            .sum()
    }

    /// Flushes and then announces End-of-RIB for the family.
    pub fn end_of_rib(&self) {
        self.flush();
        let mut codec = self.codec.lock().unwrap();
        self.write(&mut codec, &Message::Update(Update::eor(self.opts.family)));
    }

    fn attributes(&self, path: &Path, nlri: Vec<Nlri>) -> Option<Vec<Attribute>> {
        let p = path.bgp()?;
        let mut attrs = p.attributes(
            self.opts.family,
            self.opts.ibgp,
            self.opts.route_reflector_client,
        );
        if self.opts.family != Family::IPV4 {
            attrs.push(p.mp_reach(self.opts.family, nlri));
        }
        Some(attrs)
    }

    fn update(&self, attrs: Vec<Attribute>, nlri: Vec<Nlri>) -> Message {
        if self.opts.family == Family::IPV4 {
            Message::Update(Update {
                attrs,
                nlri,
                ..Default::default()
            })
        } else {
            Message::Update(Update {
                attrs,
                ..Default::default()
            })
        }
    }

    /// Packs `nets` into as few UPDATEs as fit in the maximum message size.
    fn send_bucket(&self, codec: &mut Codec, path: &Arc<Path>, nets: Vec<Net>) -> usize {
        let base = match self.attributes(path, Vec::new()) {
            Some(attrs) => attrs,
            None => return 0,
        };
        // length of the message without any NLRI
        let mut scratch = BytesMut::new();
        let empty = Message::Update(Update {
            attrs: base,
            ..Default::default()
        });
        if let Err(e) = codec.encode(&empty, &mut scratch) {
            error!("{}: can't encode attributes: {}", self.opts.peer, e);
            return 0;
        }
        if scratch.len() >= Message::MAX_LENGTH {
            error!("{}: attributes don't fit in an update", self.opts.peer);
            return 0;
        }
        let budget = Message::MAX_LENGTH - scratch.len();
        let addpath = codec.addpath_tx(self.opts.family);
        let path_id = path.path_id();

        let mut sent = 0;
        let mut batch: Vec<Nlri> = Vec::new();
        let mut left = budget;
        for net in nets {
            let cost = net.bytes_in_addr() + 1 + if addpath { 4 } else { 0 };
            if cost > left && !batch.is_empty() {
                sent += self.send_batch(codec, path, std::mem::take(&mut batch));
                left = budget;
            }
            batch.push(Nlri::with_path_id(net, path_id));
            left = left.saturating_sub(cost);
        }
        if !batch.is_empty() {
            sent += self.send_batch(codec, path, batch);
        }
        sent
    }

    fn send_batch(&self, codec: &mut Codec, path: &Path, nlri: Vec<Nlri>) -> usize {
        let msg = if self.opts.family == Family::IPV4 {
            match self.attributes(path, Vec::new()) {
                Some(attrs) => self.update(attrs, nlri),
                None => return 0,
            }
        } else {
            match self.attributes(path, nlri) {
                Some(attrs) => self.update(attrs, Vec::new()),
                None => return 0,
            }
        };
        if self.write(codec, &msg) {
            1
        } else {
            0
        }
    }

    fn write(&self, codec: &mut Codec, msg: &Message) -> bool {
        let mut buf = BytesMut::with_capacity(Message::MAX_LENGTH);
        if let Err(e) = codec.encode(msg, &mut buf) {
            error!("{}: failed to encode update: {}", self.opts.peer, e);
            return false;
        }
        self.counter.sync(msg);
        if self.tx.send(buf.freeze()).is_err() {
            error!("{}: failed to write update: connection closed", self.opts.peer);
            return false;
        }
        true
    }

    fn withdraw(&self, net: &Net, path: &Path) {
        self.pending.lock().unwrap().remove(net, path.path_id());
        let nlri = vec![Nlri::with_path_id(*net, path.path_id())];
        let update = if self.opts.family == Family::IPV4 {
            Update {
                withdrawn: nlri,
                ..Default::default()
            }
        } else {
            Update {
                attrs: vec![Attribute::MpUnreach(MpUnreach {
                    family: self.opts.family,
                    nlri,
                })],
                ..Default::default()
            }
        };
        let mut codec = self.codec.lock().unwrap();
        self.write(&mut codec, &Message::Update(update));
    }
}

impl RouteTableClient for UpdateSender {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        let key = match path.bgp() {
            Some(p) => p.hash_with_path_id(),
            None => {
                return Err(Error::InvalidArgument(format!(
                    "{} path can't be advertised",
                    path.path_type()
                )))
            }
        };
        self.pending.lock().unwrap().insert(*net, path, key);
        Ok(())
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        self.withdraw(net, path);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::bgp::CodecBuilder;
    use crate::table::{bgp_path, BgpPath};
    use std::sync::atomic::Ordering;
    use tokio_util::codec::Decoder;

    fn n(s: &str) -> Net {
        s.parse().unwrap()
    }

    fn sender(family: Family, addpath: bool) -> (UpdateSender, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let codec = CodecBuilder::new()
            .families(vec![family])
            .addpath(family, addpath, addpath)
            .build();
        let s = UpdateSender::new(
            SenderOptions {
                peer: "192.0.2.1".parse().unwrap(),
                family,
                ibgp: false,
                route_reflector_client: false,
            },
            codec,
            tx,
            Arc::new(MessageCounter::default()),
        );
        (s, rx)
    }

    fn updates(rx: &mut mpsc::UnboundedReceiver<Bytes>, family: Family) -> Vec<Update> {
        let mut codec = CodecBuilder::new().families(vec![family]).build();
        let mut v = Vec::new();
        while let Ok(b) = rx.try_recv() {
            assert!(b.len() <= Message::MAX_LENGTH);
            match codec.decode(&mut BytesMut::from(&b[..])).unwrap() {
                Some(Message::Update(u)) => v.push(u),
                other => panic!("unexpected {:?}", other),
            }
        }
        v
    }

    #[test]
    fn same_attributes_share_update() {
        let (s, mut rx) = sender(Family::IPV4, false);
        let a = bgp_path("10.0.0.1", 100, "65001");
        let b = bgp_path("10.0.0.1", 100, "65002");
        s.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        s.add_path(&n("11.0.0.0/8"), a.clone()).unwrap();
        s.add_path(&n("12.0.0.0/8"), b.clone()).unwrap();
        // moved to another attribute set
        s.add_path(&n("11.0.0.0/8"), b).unwrap();
        assert_eq!(s.flush(), 2);
        let mut v = updates(&mut rx, Family::IPV4);
        v.sort_by_key(|u| u.nlri.len());
        assert_eq!(v[0].nlri, vec![Nlri::new(n("10.0.0.0/8"))]);
        assert_eq!(
            v[1].nlri,
            vec![Nlri::new(n("12.0.0.0/8")), Nlri::new(n("11.0.0.0/8"))]
        );
        assert_eq!(s.counter.update.load(Ordering::Relaxed), 2);
        assert!(!s.has_pending());
    }

    #[test]
    fn large_batch_is_split() {
        let (s, mut rx) = sender(Family::IPV4, false);
        let a = bgp_path("10.0.0.1", 100, "65001");
        for i in 0..2000u32 {
            let net = Net::new(
                IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000 + (i << 8))),
                24,
            )
            .unwrap();
            s.add_path(&net, a.clone()).unwrap();
        }
        let sent = s.flush();
        assert!(sent >= 2);
        let v = updates(&mut rx, Family::IPV4);
        assert_eq!(v.len(), sent);
        assert_eq!(v.iter().map(|u| u.nlri.len()).sum::<usize>(), 2000);
    }

    #[test]
    fn withdraw_is_immediate() {
        let (s, mut rx) = sender(Family::IPV4, false);
        let a = bgp_path("10.0.0.1", 100, "65001");
        s.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        assert!(s.remove_path(&n("10.0.0.0/8"), &a));
        let v = updates(&mut rx, Family::IPV4);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].withdrawn, vec![Nlri::new(n("10.0.0.0/8"))]);
        // the pending announcement is gone
        assert_eq!(s.flush(), 0);
    }

    #[test]
    fn ipv6_uses_mp_attributes() {
        let (s, mut rx) = sender(Family::IPV6, false);
        let mut p = BgpPath::new(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        );
        p.origin = Attribute::ORIGIN_IGP;
        let p = Arc::new(Path::Bgp(p));
        s.add_path(&n("2001:db8:1::/48"), p.clone()).unwrap();
        s.flush();
        s.remove_path(&n("2001:db8:1::/48"), &p);
        s.end_of_rib();
        let v = updates(&mut rx, Family::IPV6);
        assert_eq!(v.len(), 3);
        assert_eq!(
            v[0].mp_reach().unwrap().nlri,
            vec![Nlri::new(n("2001:db8:1::/48"))]
        );
        assert_eq!(
            v[1].mp_unreach().unwrap().nlri,
            vec![Nlri::new(n("2001:db8:1::/48"))]
        );
        assert_eq!(v[2].end_of_rib(), Some(Family::IPV6));
    }

    #[tokio::test]
    async fn ticker_drains_until_destroyed() {
        let (s, mut rx) = sender(Family::IPV4, false);
        let s = Arc::new(s);
        s.start();
        s.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "65001"))
            .unwrap();
        let b = rx.recv().await.unwrap();
        assert!(b.len() > Message::HEADER_LENGTH as usize);
        s.destroy();
    }
}
