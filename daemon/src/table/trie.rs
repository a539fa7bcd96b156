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

//! Prefix indexed storage holding one `Route` per prefix, on top of
//! `prefix_trie` with one trie per address family.

use prefix_trie::{Prefix, PrefixMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::packet::bgp::Net;
use crate::table::{Path, Route};

enum Key {
    V4(ipnet::Ipv4Net),
    V6(ipnet::Ipv6Net),
}

impl Key {
    fn new(net: &Net) -> Option<Key> {
        match net {
            Net::V4(n) => ipnet::Ipv4Net::new(n.addr, n.mask)
                .ok()
                .map(|k| Key::V4(k.trunc())),
            Net::V6(n) => ipnet::Ipv6Net::new(n.addr, n.mask)
                .ok()
                .map(|k| Key::V6(k.trunc())),
        }
    }
}

/// Runs `f` on the route stored at `key`, creating it first when
/// `create` is set. A route left without paths is removed. Also reports
/// whether the route existed before and after.
fn modify<P, R, F>(
    trie: &mut PrefixMap<P, Route>,
    key: P,
    net: &Net,
    create: bool,
    f: F,
) -> Option<(R, bool, bool)>
where
    P: Prefix,
    F: FnOnce(&mut Route) -> R,
{
    if let Some(route) = trie.get_mut(&key) {
        let r = f(route);
        if route.is_empty() {
            trie.remove(&key);
            return Some((r, true, false));
        }
        return Some((r, true, true));
    }
    if !create {
        return None;
    }
    let mut route = Route::new(*net);
    let r = f(&mut route);
    let exists = !route.is_empty();
    if exists {
        trie.insert(key, route);
    }
    Some((r, false, exists))
}

struct Tries {
    v4: PrefixMap<ipnet::Ipv4Net, Route>,
    v6: PrefixMap<ipnet::Ipv6Net, Route>,
}

impl Default for Tries {
    fn default() -> Self {
        Tries {
            v4: PrefixMap::new(),
            v6: PrefixMap::new(),
        }
    }
}

impl Tries {
    fn longest_match(&self, net: &Net) -> Option<&Route> {
        match Key::new(net)? {
            Key::V4(k) => self.v4.get_lpm(&k).map(|(_, r)| r),
            Key::V6(k) => self.v6.get_lpm(&k).map(|(_, r)| r),
        }
    }
}

/// Prefix indexed table. Readers run concurrently, writers exclusively.
#[derive(Default)]
pub struct RoutingTable {
    tries: RwLock<Tries>,
    route_count: AtomicU64,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    /// Runs `f` on the route for `net` under the write lock.
    pub(crate) fn modify<R, F>(&self, net: &Net, create: bool, f: F) -> Option<R>
    where
        F: FnOnce(&mut Route) -> R,
    {
        let mut tries = self.tries.write().unwrap();
        let (r, existed, exists) = match Key::new(net)? {
            Key::V4(k) => modify(&mut tries.v4, k, net, create, f)?,
            Key::V6(k) => modify(&mut tries.v6, k, net, create, f)?,
        };
        match (existed, exists) {
            (false, true) => {
                self.route_count.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.route_count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Some(r)
    }

    pub fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        self.modify(net, true, |route| route.add_path(path))
            .ok_or_else(|| Error::InvalidArgument(format!("invalid prefix {}", net)))
    }

    /// Installs `path` as the only path of `net`, returning the paths it
    /// replaced.
    pub fn replace_path(&self, net: &Net, path: Arc<Path>) -> Vec<Arc<Path>> {
        self.modify(net, true, |route| route.replace_paths(vec![path]))
            .unwrap_or_default()
    }

    pub fn remove_path(&self, net: &Net, path: &Path) -> bool {
        self.modify(net, false, |route| route.remove_path(path))
            .unwrap_or(false)
    }

    pub fn remove_pfx(&self, net: &Net) -> Vec<Arc<Path>> {
        self.modify(net, false, |route| route.replace_paths(Vec::new()))
            .unwrap_or_default()
    }

    pub fn get(&self, net: &Net) -> Option<Route> {
        let tries = self.tries.read().unwrap();
        match Key::new(net)? {
            Key::V4(k) => tries.v4.get(&k).cloned(),
            Key::V6(k) => tries.v6.get(&k).cloned(),
        }
    }

    /// Every route covering `net`, least specific first.
    pub fn lpm(&self, net: &Net) -> Vec<Route> {
        let tries = self.tries.read().unwrap();
        let mut v = Vec::new();
        let mut cur = Some(*net);
        while let Some(n) = cur {
            let route = match tries.longest_match(&n) {
                Some(route) => route,
                None => break,
            };
            let mask = route.net().mask();
            v.push(route.clone());
            cur = if mask == 0 {
                None
            } else {
                Some(n.truncate(mask - 1))
            };
        }
        v.reverse();
        v
    }

    /// `net` itself and every more specific route.
    pub fn get_longer(&self, net: &Net) -> Vec<Route> {
        let tries = self.tries.read().unwrap();
        match Key::new(net) {
            Some(Key::V4(k)) => tries.v4.children(&k).map(|(_, r)| r.clone()).collect(),
            Some(Key::V6(k)) => tries.v6.children(&k).map(|(_, r)| r.clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn dump(&self) -> Vec<Route> {
        let tries = self.tries.read().unwrap();
        tries
            .v4
            .iter()
            .map(|(_, r)| r.clone())
            .chain(tries.v6.iter().map(|(_, r)| r.clone()))
            .collect()
    }

    pub fn route_count(&self) -> u64 {
        self.route_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
fn n(s: &str) -> Net {
    s.parse().unwrap()
}

#[test]
fn insert_and_lookup() {
    let t = RoutingTable::new();
    let p = crate::table::bgp_path("10.0.0.1", 100, "1");
    for s in &["10.0.0.0/8", "10.1.0.0/16", "10.128.0.0/9", "11.0.0.0/8", "0.0.0.0/0"] {
        t.add_path(&n(s), p.clone()).unwrap();
    }
    t.add_path(&n("2001:db8::/32"), p.clone()).unwrap();
    assert_eq!(t.route_count(), 6);

    assert!(t.get(&n("10.1.0.0/16")).is_some());
    assert!(t.get(&n("10.2.0.0/16")).is_none());
    assert!(t.get(&n("2001:db8::/48")).is_none());

    let covering: Vec<String> = t
        .lpm(&n("10.1.2.0/24"))
        .iter()
        .map(|r| r.net().to_string())
        .collect();
    assert_eq!(covering, vec!["0.0.0.0/0", "10.0.0.0/8", "10.1.0.0/16"]);

    let mut longer: Vec<String> = t
        .get_longer(&n("10.0.0.0/8"))
        .iter()
        .map(|r| r.net().to_string())
        .collect();
    longer.sort();
    assert_eq!(longer, vec!["10.0.0.0/8", "10.1.0.0/16", "10.128.0.0/9"]);
    assert_eq!(t.dump().len(), 6);
}

#[test]
fn remove_drops_empty_routes() {
    let t = RoutingTable::new();
    let p = crate::table::bgp_path("10.0.0.1", 100, "1");
    t.add_path(&n("10.0.0.0/24"), p.clone()).unwrap();
    t.add_path(&n("10.0.1.0/24"), p.clone()).unwrap();
    assert!(t.get(&n("10.0.0.0/23")).is_none());

    assert!(t.remove_path(&n("10.0.0.0/24"), &p));
    assert!(!t.remove_path(&n("10.0.0.0/24"), &p));
    assert!(t.get(&n("10.0.0.0/24")).is_none());
    assert!(t.lpm(&n("10.0.0.0/24")).is_empty());
    assert_eq!(t.route_count(), 1);

    assert_eq!(t.remove_pfx(&n("10.0.1.0/24")).len(), 1);
    assert!(t.remove_pfx(&n("10.0.1.0/24")).is_empty());
    assert!(t.dump().is_empty());
    assert!(t.get_longer(&n("0.0.0.0/0")).is_empty());
    assert_eq!(t.route_count(), 0);
}

#[test]
fn replace_returns_old_paths() {
    let t = RoutingTable::new();
    let a = crate::table::bgp_path("10.0.0.1", 100, "1");
    let b = crate::table::bgp_path("10.0.0.2", 100, "2");
    assert!(t.replace_path(&n("192.168.0.0/16"), a.clone()).is_empty());
    let old = t.replace_path(&n("192.168.0.0/16"), b.clone());
    assert_eq!(old, vec![a]);
    assert_eq!(t.get(&n("192.168.0.0/16")).unwrap().paths(), &[b]);
    assert_eq!(t.route_count(), 1);
}
