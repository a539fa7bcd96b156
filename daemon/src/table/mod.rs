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

//! Route and path model shared by every table of the pipeline.

pub mod adj_rib_in;
pub mod adj_rib_out;
pub mod client;
pub mod filter;
pub mod loc_rib;
pub mod trie;
pub mod vrf;

pub use adj_rib_in::AdjRibIn;
pub use adj_rib_out::{AdjRibOut, NeighborInfo};
pub use client::{ClientManager, ClientOptions, RouteTableClient};
pub use filter::FilterChain;
pub use loc_rib::LocRib;
pub use trie::RoutingTable;
pub use vrf::{Vrf, VrfRegistry};

use fnv::FnvHasher;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::packet::bgp::{
    Aggregator, AsPath, Attribute, Family, LargeCommunity, MpReach, Net, Nlri,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathType {
    Static,
    Bgp,
    Fib,
    Netlink,
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathType::Static => write!(f, "static"),
            PathType::Bgp => write!(f, "bgp"),
            PathType::Fib => write!(f, "fib"),
            PathType::Netlink => write!(f, "netlink"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticPath {
    pub next_hop: IpAddr,
}

/// A path as the kernel sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FibPath {
    pub next_hop: IpAddr,
    pub priority: u32,
    pub protocol: u8,
    pub kernel: bool,
}

/// Attributes of a BGP learned path, independent of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BgpPath {
    pub path_id: u32,
    pub next_hop: IpAddr,
    pub local_pref: u32,
    pub as_path: AsPath,
    pub origin: u8,
    pub med: u32,
    pub ebgp: bool,
    pub bgp_identifier: Ipv4Addr,
    pub source: IpAddr,
    pub communities: Vec<u32>,
    pub large_communities: Vec<LargeCommunity>,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<Aggregator>,
    pub unknown_attributes: Vec<Attribute>,
    pub only_to_client: bool,
    pub bmp_post_policy: bool,
    // rejected by import policy, kept in the Adj-RIB-In only
    pub filtered: bool,
}

impl BgpPath {
    pub fn new(source: IpAddr, next_hop: IpAddr) -> Self {
        BgpPath {
            path_id: 0,
            next_hop,
            local_pref: Attribute::DEFAULT_LOCAL_PREF,
            as_path: AsPath::default(),
            origin: Attribute::ORIGIN_INCOMPLETE,
            med: 0,
            ebgp: false,
            bgp_identifier: Ipv4Addr::UNSPECIFIED,
            source,
            communities: Vec::new(),
            large_communities: Vec::new(),
            originator_id: None,
            cluster_list: Vec::new(),
            atomic_aggregate: false,
            aggregator: None,
            unknown_attributes: Vec::new(),
            only_to_client: false,
            bmp_post_policy: false,
            filtered: false,
        }
    }

    /// Builds a path from decoded UPDATE attributes. The next hop comes
    /// from MP_REACH when present.
    pub fn from_attrs(attrs: &[Attribute], source: IpAddr) -> Self {
        let unspecified = match source {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        let mut path = BgpPath::new(source, unspecified);
        let mut mp_next_hop = None;
        for a in attrs {
            match a {
                Attribute::Origin(v) => path.origin = *v,
                Attribute::AsPath(v) => path.as_path = v.clone(),
                Attribute::NextHop(v) => path.next_hop = IpAddr::V4(*v),
                Attribute::MultiExitDisc(v) => path.med = *v,
                Attribute::LocalPref(v) => path.local_pref = *v,
                Attribute::AtomicAggregate => path.atomic_aggregate = true,
                Attribute::Aggregator(v) => path.aggregator = Some(*v),
                Attribute::Communities(v) => path.communities = v.clone(),
                Attribute::OriginatorId(v) => path.originator_id = Some(*v),
                Attribute::ClusterList(v) => path.cluster_list = v.clone(),
                Attribute::LargeCommunities(v) => path.large_communities = v.clone(),
                Attribute::MpReach(mp) => mp_next_hop = Some(mp.next_hop),
                Attribute::Unknown { .. } => path.unknown_attributes.push(a.clone()),
                Attribute::MpUnreach(_) | Attribute::As4Path(_) | Attribute::As4Aggregator(_) => {}
            }
        }
        if let Some(nh) = mp_next_hop {
            path.next_hop = nh;
        }
        path
    }

    /// Path attributes for an UPDATE towards a peer. NLRI for families
    /// other than IPv4 unicast travel in MP_REACH, added by the caller.
    pub fn attributes(&self, family: Family, ibgp: bool, rr_client: bool) -> Vec<Attribute> {
        let mut v = vec![
            Attribute::Origin(self.origin),
            Attribute::AsPath(self.as_path.clone()),
        ];
        if family == Family::IPV4 {
            if let IpAddr::V4(addr) = self.next_hop {
                v.push(Attribute::NextHop(addr));
            }
        }
        if self.med != 0 {
            v.push(Attribute::MultiExitDisc(self.med));
        }
        if ibgp {
            v.push(Attribute::LocalPref(self.local_pref));
        }
        if self.atomic_aggregate {
            v.push(Attribute::AtomicAggregate);
        }
        if let Some(aggr) = self.aggregator {
            v.push(Attribute::Aggregator(aggr));
        }
        if !self.communities.is_empty() {
            v.push(Attribute::Communities(self.communities.clone()));
        }
        if ibgp && rr_client {
            if let Some(id) = self.originator_id {
                v.push(Attribute::OriginatorId(id));
            }
            if !self.cluster_list.is_empty() {
                v.push(Attribute::ClusterList(self.cluster_list.clone()));
            }
        }
        if !self.large_communities.is_empty() {
            v.push(Attribute::LargeCommunities(self.large_communities.clone()));
        }
        v.extend(self.unknown_attributes.iter().cloned());
        v
    }

    pub(crate) fn mp_reach(&self, family: Family, nlri: Vec<Nlri>) -> Attribute {
        Attribute::MpReach(MpReach {
            family,
            next_hop: self.next_hop,
            link_local: None,
            nlri,
        })
    }

    /// Sequence hops count one each, a set counts one.
    pub fn as_path_len(&self) -> usize {
        self.as_path.len()
    }

    pub fn prepend(&mut self, asn: u32, times: usize) {
        self.as_path.prepend(asn, times);
    }

    /// Stable hash over every attribute including the path identifier.
    pub fn hash_with_path_id(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn ecmp(&self, other: &BgpPath) -> bool {
        self.local_pref == other.local_pref
            && self.as_path_len() == other.as_path_len()
            && self.med == other.med
            && self.origin == other.origin
    }

    /// `Less` when `self` is preferred.
    pub fn compare(&self, other: &BgpPath) -> Ordering {
        other
            .local_pref
            .cmp(&self.local_pref)
            .then_with(|| self.as_path_len().cmp(&other.as_path_len()))
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.med.cmp(&other.med))
            .then_with(|| other.ebgp.cmp(&self.ebgp))
            .then_with(|| self.bgp_identifier.cmp(&other.bgp_identifier))
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.next_hop.cmp(&other.next_hop))
    }
}

/// One path for a prefix. Never mutated once published to a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Path {
    Static(StaticPath),
    Bgp(BgpPath),
    Fib(FibPath),
    Netlink(FibPath),
}

impl Path {
    pub fn path_type(&self) -> PathType {
        match self {
            Path::Static(_) => PathType::Static,
            Path::Bgp(_) => PathType::Bgp,
            Path::Fib(_) => PathType::Fib,
            Path::Netlink(_) => PathType::Netlink,
        }
    }

    pub fn bgp(&self) -> Option<&BgpPath> {
        match self {
            Path::Bgp(p) => Some(p),
            _ => None,
        }
    }

    pub fn next_hop(&self) -> IpAddr {
        match self {
            Path::Static(p) => p.next_hop,
            Path::Bgp(p) => p.next_hop,
            Path::Fib(p) | Path::Netlink(p) => p.next_hop,
        }
    }

    pub fn path_id(&self) -> u32 {
        self.bgp().map_or(0, |p| p.path_id)
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.bgp().map(|p| p.source)
    }

    pub fn is_filtered(&self) -> bool {
        self.bgp().map_or(false, |p| p.filtered)
    }

    pub(crate) fn with_filtered(&self, filtered: bool) -> Path {
        match self {
            Path::Bgp(p) => {
                let mut p = p.clone();
                p.filtered = filtered;
                Path::Bgp(p)
            }
            _ => self.clone(),
        }
    }

    pub(crate) fn with_path_id(&self, path_id: u32) -> Path {
        match self {
            Path::Bgp(p) => {
                let mut p = p.clone();
                p.path_id = path_id;
                Path::Bgp(p)
            }
            _ => self.clone(),
        }
    }

    /// `Less` when `self` is preferred. Paths of different kinds order
    /// by kind.
    pub fn compare(&self, other: &Path) -> Ordering {
        match (self, other) {
            (Path::Bgp(a), Path::Bgp(b)) => a.compare(b),
            (Path::Static(a), Path::Static(b)) => a.next_hop.cmp(&b.next_hop),
            (Path::Fib(a), Path::Fib(b)) | (Path::Netlink(a), Path::Netlink(b)) => a
                .priority
                .cmp(&b.priority)
                .then_with(|| a.next_hop.cmp(&b.next_hop)),
            _ => self.path_type().cmp(&other.path_type()),
        }
    }

    pub fn ecmp(&self, other: &Path) -> bool {
        match (self, other) {
            (Path::Bgp(a), Path::Bgp(b)) => a.ecmp(b),
            (Path::Fib(a), Path::Fib(b)) | (Path::Netlink(a), Path::Netlink(b)) => {
                a.priority == b.priority
            }
            (a, b) => a.path_type() == b.path_type(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Bgp(p) => write!(
                f,
                "bgp nh {} lp {} path [{}] src {} id {}",
                p.next_hop, p.local_pref, p.as_path, p.source, p.path_id
            ),
            p => write!(f, "{} nh {}", p.path_type(), p.next_hop()),
        }
    }
}

/// A prefix with its paths, best first once selection ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    net: Net,
    paths: Vec<Arc<Path>>,
    ecmp_paths: usize,
}

impl Route {
    pub fn new(net: Net) -> Self {
        Route {
            net,
            paths: Vec::new(),
            ecmp_paths: 0,
        }
    }

    pub fn with_path(net: Net, path: Arc<Path>) -> Self {
        Route {
            net,
            paths: vec![path],
            ecmp_paths: 1,
        }
    }

    pub fn net(&self) -> Net {
        self.net
    }

    pub fn paths(&self) -> &[Arc<Path>] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn best_path(&self) -> Option<&Arc<Path>> {
        self.paths.first()
    }

    pub fn ecmp_count(&self) -> usize {
        self.ecmp_paths
    }

    pub fn ecmp_paths(&self) -> &[Arc<Path>] {
        &self.paths[..std::cmp::min(self.ecmp_paths, self.paths.len())]
    }

    pub(crate) fn add_path(&mut self, path: Arc<Path>) {
        self.paths.push(path);
    }

    /// Drops every path equal to `path`.
    pub(crate) fn remove_path(&mut self, path: &Path) -> bool {
        let before = self.paths.len();
        self.paths.retain(|p| p.as_ref() != path);
        self.ecmp_paths = std::cmp::min(self.ecmp_paths, self.paths.len());
        before != self.paths.len()
    }

    pub(crate) fn replace_paths(&mut self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        self.ecmp_paths = std::cmp::min(self.ecmp_paths, paths.len());
        std::mem::replace(&mut self.paths, paths)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p.as_ref() == path)
    }

    /// Sorts the paths best first with `cmp` and counts the leading run
    /// of equal cost paths.
    pub(crate) fn select_with<F>(&mut self, cmp: F)
    where
        F: Fn(&Path, &Path) -> Ordering,
    {
        self.paths.sort_by(|a, b| cmp(a, b));
        self.ecmp_paths = match self.paths.first() {
            None => 0,
            Some(best) => self.paths.iter().take_while(|p| best.ecmp(p)).count(),
        };
    }
}

/// Paths of `a` that are not in `b`.
pub fn paths_diff(a: &[Arc<Path>], b: &[Arc<Path>]) -> Vec<Arc<Path>> {
    a.iter()
        .filter(|p| !b.iter().any(|q| q == *p))
        .cloned()
        .collect()
}

/// Reference counted origin ASNs of the paths held by a Loc-RIB.
#[derive(Default, Debug)]
pub struct ContributingAsns {
    asns: Vec<(u32, usize)>,
}

impl ContributingAsns {
    pub fn add(&mut self, asn: u32) {
        match self.asns.iter_mut().find(|(a, _)| *a == asn) {
            Some((_, count)) => *count += 1,
            None => self.asns.push((asn, 1)),
        }
    }

    pub fn remove(&mut self, asn: u32) {
        if let Some(i) = self.asns.iter().position(|(a, _)| *a == asn) {
            self.asns[i].1 -= 1;
            if self.asns[i].1 == 0 {
                self.asns.swap_remove(i);
            }
        }
    }

    pub fn is_contributing(&self, asn: u32) -> bool {
        self.asns.iter().any(|(a, _)| *a == asn)
    }
}

#[cfg(test)]
pub(crate) fn bgp_path(source: &str, local_pref: u32, as_path: &str) -> Arc<Path> {
    use std::str::FromStr;
    let source = IpAddr::from_str(source).unwrap();
    let mut p = BgpPath::new(source, source);
    p.local_pref = local_pref;
    p.as_path = AsPath::from_str(as_path).unwrap();
    p.origin = Attribute::ORIGIN_IGP;
    Arc::new(Path::Bgp(p))
}

#[test]
fn compare_bgp_paths() {
    let a = bgp_path("10.0.0.1", 200, "65001 65002");
    let b = bgp_path("10.0.0.2", 100, "65001");
    assert_eq!(a.compare(&b), Ordering::Less);

    let c = bgp_path("10.0.0.3", 100, "65001 65002");
    assert_eq!(b.compare(&c), Ordering::Less);

    let d = bgp_path("10.0.0.4", 100, "65003");
    assert!(b.ecmp(&d));
    // same cost, lower source wins
    assert_eq!(b.compare(&d), Ordering::Less);

    let mut e = b.bgp().unwrap().clone();
    e.ebgp = true;
    assert_eq!(Path::Bgp(e).compare(&d), Ordering::Less);
}

#[test]
fn route_selection_counts_ecmp() {
    let net = "10.0.0.0/8".parse().unwrap();
    let mut r = Route::new(net);
    r.add_path(bgp_path("10.0.0.3", 100, "1 2"));
    r.add_path(bgp_path("10.0.0.1", 100, "3 4"));
    r.add_path(bgp_path("10.0.0.2", 50, "1"));
    r.select_with(|a, b| a.compare(b));
    assert_eq!(r.ecmp_count(), 2);
    assert_eq!(r.best_path().unwrap().source().unwrap().to_string(), "10.0.0.1");
    assert_eq!(r.ecmp_paths().len(), 2);
}

#[test]
fn contributing_asns() {
    let mut c = ContributingAsns::default();
    c.add(65001);
    c.add(65001);
    c.remove(65001);
    assert!(c.is_contributing(65001));
    c.remove(65001);
    assert!(!c.is_contributing(65001));
}

#[test]
fn path_hash_tracks_path_id() {
    let p = bgp_path("10.0.0.1", 100, "1");
    let q = p.with_path_id(7);
    assert_ne!(
        p.bgp().unwrap().hash_with_path_id(),
        q.bgp().unwrap().hash_with_path_id()
    );
    assert_eq!(
        p.bgp().unwrap().hash_with_path_id(),
        p.with_path_id(0).bgp().unwrap().hash_with_path_id()
    );
}

#[test]
fn prepend_creates_sequence() {
    use std::str::FromStr;
    let mut p = BgpPath::new(
        IpAddr::from_str("10.0.0.1").unwrap(),
        IpAddr::from_str("10.0.0.1").unwrap(),
    );
    p.as_path = AsPath::from_str("(1 2) 3").unwrap();
    p.prepend(65000, 2);
    assert_eq!(p.as_path.to_string(), "65000 65000 (1 2) 3");
    assert_eq!(p.as_path_len(), 4);
}
