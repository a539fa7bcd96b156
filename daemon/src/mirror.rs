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

//! Deduplicates a route table learned over several redundant feeds.
//!
//! A route stays installed in the target Loc-RIB as long as at least one
//! source still announces it.

use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::bgp::Net;
use crate::table::client::RouteTableClient;
use crate::table::{LocRib, Path};

type RouteKey = [u8; 20];

struct Sha1Hasher(Sha1);

impl Hasher for Sha1Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        BigEndian::read_u64(&self.0.clone().finalize()[..8])
    }
}

fn route_key(net: &Net, path: &Path) -> RouteKey {
    let mut h = Sha1Hasher(Sha1::new());
    net.hash(&mut h);
    path.hash(&mut h);
    let mut key = [0; 20];
    key.copy_from_slice(&h.0.finalize());
    key
}

struct Container<S> {
    net: Net,
    path: Arc<Path>,
    sources: HashSet<S>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMetrics {
    pub rib_name: String,
    pub unique_route_count: u64,
    pub routes_with_single_source_count: u64,
}

pub struct RouteMirror<S> {
    routes: Mutex<HashMap<RouteKey, Container<S>>>,
    rib: Arc<LocRib>,
}

impl<S: Eq + Hash + Clone> RouteMirror<S> {
    pub fn new(rib: Arc<LocRib>) -> Self {
        RouteMirror {
            routes: Mutex::new(HashMap::new()),
            rib,
        }
    }

    pub fn rib(&self) -> &Arc<LocRib> {
        &self.rib
    }

    /// Records that `src` announces the route. Only the first announcement
    /// reaches the Loc-RIB.
    pub fn add_route(&self, src: S, net: Net, path: Arc<Path>) -> Result<(), Error> {
        let key = route_key(&net, &path);
        let mut routes = self.routes.lock().unwrap();
        if let Some(c) = routes.get_mut(&key) {
            c.sources.insert(src);
            return Ok(());
        }
        self.rib.add_path(&net, path.clone())?;
        let mut sources = HashSet::new();
        sources.insert(src);
        routes.insert(key, Container { net, path, sources });
        Ok(())
    }

    /// Returns true when the route was withdrawn from the Loc-RIB, i.e.
    /// `src` was its last source.
    pub fn remove_route(&self, src: &S, net: &Net, path: &Path) -> bool {
        let key = route_key(net, path);
        let mut routes = self.routes.lock().unwrap();
        let last = match routes.get_mut(&key) {
            Some(c) => c.sources.remove(src) && c.sources.is_empty(),
            None => false,
        };
        if !last {
            return false;
        }
        if let Some(c) = routes.remove(&key) {
            self.rib.remove_path(&c.net, &c.path);
        }
        true
    }

    /// Forgets `src` everywhere, withdrawing what nobody else announces.
    pub fn drop_all_by_src(&self, src: &S) {
        let mut routes = self.routes.lock().unwrap();
        let orphans: Vec<RouteKey> = routes
            .iter_mut()
            .filter_map(|(k, c)| {
                if c.sources.remove(src) && c.sources.is_empty() {
                    Some(*k)
                } else {
                    None
                }
            })
            .collect();
        for k in orphans {
            if let Some(c) = routes.remove(&k) {
                self.rib.remove_path(&c.net, &c.path);
            }
        }
    }

    pub fn metrics(&self) -> MirrorMetrics {
        let routes = self.routes.lock().unwrap();
        MirrorMetrics {
            rib_name: self.rib.name().to_string(),
            unique_route_count: routes.len() as u64,
            routes_with_single_source_count: routes
                .values()
                .filter(|c| c.sources.len() == 1)
                .count() as u64,
        }
    }
}

/// Feeds one source into a mirror. Registered on the table that learns
/// the routes of that source, e.g. a BMP router.
pub struct MirrorClient<S> {
    mirror: Arc<RouteMirror<S>>,
    source: S,
}

impl<S: Eq + Hash + Clone> MirrorClient<S> {
    pub fn new(mirror: Arc<RouteMirror<S>>, source: S) -> Self {
        MirrorClient { mirror, source }
    }
}

impl<S> RouteTableClient for MirrorClient<S>
where
    S: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        self.mirror.add_route(self.source.clone(), *net, path)
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        self.mirror.remove_route(&self.source, net, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::bgp_path;

    fn net(s: &str) -> Net {
        s.parse().unwrap()
    }

    #[test]
    fn last_source_withdraws() {
        let rib = Arc::new(LocRib::new("inet.0"));
        let m = RouteMirror::new(rib.clone());
        let p = bgp_path("192.0.2.1", 100, "65001");
        for src in 0..3 {
            m.add_route(src, net("10.0.0.0/8"), p.clone()).unwrap();
        }
        assert_eq!(rib.route_count(), 1);
        assert_eq!(rib.get(&net("10.0.0.0/8")).unwrap().paths().len(), 1);

        assert!(!m.remove_route(&0, &net("10.0.0.0/8"), &p));
        assert!(!m.remove_route(&0, &net("10.0.0.0/8"), &p));
        assert!(!m.remove_route(&1, &net("10.0.0.0/8"), &p));
        assert_eq!(rib.route_count(), 1);
        assert!(m.remove_route(&2, &net("10.0.0.0/8"), &p));
        assert_eq!(rib.route_count(), 0);
        assert!(!m.remove_route(&2, &net("10.0.0.0/8"), &p));
    }

    #[test]
    fn different_paths_are_different_routes() {
        let rib = Arc::new(LocRib::new("inet.0"));
        let m = RouteMirror::new(rib.clone());
        m.add_route("a", net("10.0.0.0/8"), bgp_path("192.0.2.1", 100, "65001"))
            .unwrap();
        m.add_route("b", net("10.0.0.0/8"), bgp_path("192.0.2.1", 200, "65001"))
            .unwrap();
        m.add_route("b", net("10.1.0.0/16"), bgp_path("192.0.2.1", 100, "65001"))
            .unwrap();
        assert_eq!(
            m.metrics(),
            MirrorMetrics {
                rib_name: "inet.0".to_string(),
                unique_route_count: 3,
                routes_with_single_source_count: 3,
            }
        );
        assert_eq!(rib.get(&net("10.0.0.0/8")).unwrap().paths().len(), 2);
    }

    #[test]
    fn drop_source() {
        let rib = Arc::new(LocRib::new("inet.0"));
        let m = RouteMirror::new(rib.clone());
        let shared = bgp_path("192.0.2.1", 100, "65001");
        let only_a = bgp_path("192.0.2.2", 100, "65002");
        m.add_route("a", net("10.0.0.0/8"), shared.clone()).unwrap();
        m.add_route("b", net("10.0.0.0/8"), shared).unwrap();
        m.add_route("a", net("172.16.0.0/12"), only_a).unwrap();
        assert_eq!(m.metrics().routes_with_single_source_count, 1);

        m.drop_all_by_src(&"a");
        assert_eq!(rib.route_count(), 1);
        assert!(rib.get(&net("172.16.0.0/12")).is_none());
        let metrics = m.metrics();
        assert_eq!(metrics.unique_route_count, 1);
        assert_eq!(metrics.routes_with_single_source_count, 1);
    }

    #[test]
    fn client() {
        let rib = Arc::new(LocRib::new("inet.0"));
        let m = Arc::new(RouteMirror::new(rib.clone()));
        let a = MirrorClient::new(m.clone(), 1u8);
        let b = MirrorClient::new(m.clone(), 2u8);
        let p = bgp_path("192.0.2.1", 100, "65001");
        a.add_path(&net("10.0.0.0/8"), p.clone()).unwrap();
        b.add_path(&net("10.0.0.0/8"), p.clone()).unwrap();
        assert!(!a.remove_path(&net("10.0.0.0/8"), &p));
        assert!(b.remove_path(&net("10.0.0.0/8"), &p));
        assert_eq!(rib.route_count(), 0);
    }
}
