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

//! Import and export policy: chains of filters made of terms, each term
//! a list of match conditions and the actions run on a match.

use regex::Regex;
use std::convert::TryFrom;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{ActionConfig, ConditionConfig, FilterConfig, RouteFilterConfig};
use crate::error::Error;
use crate::packet::bgp::{format_community, AsPath, LargeCommunity, Net};
use crate::table::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFilterMatcher {
    Exact,
    OrLonger,
    Longer,
    InRange(u8, u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFilter {
    pattern: Net,
    matcher: RouteFilterMatcher,
}

impl RouteFilter {
    pub fn new(pattern: Net, matcher: RouteFilterMatcher) -> Self {
        RouteFilter { pattern, matcher }
    }

    pub fn matches(&self, net: &Net) -> bool {
        if !self.pattern.contains(net) {
            return false;
        }
        match self.matcher {
            RouteFilterMatcher::Exact => net.mask() == self.pattern.mask(),
            RouteFilterMatcher::OrLonger => true,
            RouteFilterMatcher::Longer => net.mask() > self.pattern.mask(),
            RouteFilterMatcher::InRange(begin, end) => net.mask() >= begin && net.mask() <= end,
        }
    }
}

impl TryFrom<&RouteFilterConfig> for RouteFilter {
    type Error = Error;

    fn try_from(c: &RouteFilterConfig) -> Result<Self, Error> {
        let pattern = Net::from_str(&c.prefix)?;
        let matcher = match c.matcher.as_str() {
            "exact" => RouteFilterMatcher::Exact,
            "orlonger" => RouteFilterMatcher::OrLonger,
            "longer" => RouteFilterMatcher::Longer,
            "inrange" => RouteFilterMatcher::InRange(
                c.begin.unwrap_or_else(|| pattern.mask()),
                c.end.unwrap_or(match pattern {
                    Net::V4(_) => 32,
                    Net::V6(_) => 128,
                }),
            ),
            m => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown route filter matcher {}",
                    m
                )))
            }
        };
        Ok(RouteFilter::new(pattern, matcher))
    }
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) enum SingleAsPathMatch {
    Include(u32),
    LeftMost(u32),
    Origin(u32),
    Only(u32),
}

impl SingleAsPathMatch {
    fn new(s: &str) -> Option<Self> {
        let left_most = Regex::new(r"^\^([0-9]+)_$").ok()?;
        let origin = Regex::new(r"^_([0-9]+)\$$").ok()?;
        let include = Regex::new(r"^_([0-9]+)_$").ok()?;
        let only = Regex::new(r"^\^([0-9]+)\$$").ok()?;

        let f = |r: &Regex| -> Option<u32> {
            r.captures(s)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        };

        if let Some(n) = f(&left_most) {
            Some(SingleAsPathMatch::LeftMost(n))
        } else if let Some(n) = f(&origin) {
            Some(SingleAsPathMatch::Origin(n))
        } else if let Some(n) = f(&include) {
            Some(SingleAsPathMatch::Include(n))
        } else {
            f(&only).map(SingleAsPathMatch::Only)
        }
    }

    fn is_match(&self, path: &AsPath) -> bool {
        match self {
            SingleAsPathMatch::Include(n) => path.contains(*n),
            SingleAsPathMatch::LeftMost(n) => path.first_asn() == Some(*n),
            SingleAsPathMatch::Origin(n) => path.origin_asn() == Some(*n),
            SingleAsPathMatch::Only(n) => path.len() == 1 && path.first_asn() == Some(*n),
        }
    }
}

impl fmt::Display for SingleAsPathMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleAsPathMatch::Include(v) => write!(f, "_{}_", v),
            SingleAsPathMatch::LeftMost(v) => write!(f, "^{}_", v),
            SingleAsPathMatch::Origin(v) => write!(f, "_{}$", v),
            SingleAsPathMatch::Only(v) => write!(f, "^{}$", v),
        }
    }
}

/// AS path patterns: the `^N_`, `_N$`, `_N_`, `^N$` shortcuts or a
/// regular expression over the space separated path.
#[derive(Clone, Debug)]
pub struct AsPathFilter {
    single_sets: Vec<SingleAsPathMatch>,
    sets: Vec<Regex>,
}

impl AsPathFilter {
    pub fn new(patterns: &[String]) -> Result<Self, Error> {
        let mut single_sets = Vec::new();
        let mut sets = Vec::new();
        for p in patterns {
            match SingleAsPathMatch::new(p) {
                Some(m) => single_sets.push(m),
                None => sets.push(
                    Regex::new(&p.replace('_', " "))
                        .map_err(|_| Error::InvalidArgument(format!("invalid regex {}", p)))?,
                ),
            }
        }
        Ok(AsPathFilter { single_sets, sets })
    }

    pub fn matches(&self, path: &AsPath) -> bool {
        if self.single_sets.iter().any(|m| m.is_match(path)) {
            return true;
        }
        if self.sets.is_empty() {
            return false;
        }
        let s = path.to_string();
        self.sets.iter().any(|r| r.is_match(&s))
    }
}

enum WellKnownCommunity {
    GracefulShutdown,
    AcceptOwn,
    Blackhole,
    NoExport,
    NoAdvertise,
    NoExportSubconfed,
    NoPeer,
}

impl FromStr for WellKnownCommunity {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "graceful-shutdown" => Ok(WellKnownCommunity::GracefulShutdown),
            "accept-own" => Ok(WellKnownCommunity::AcceptOwn),
            "blackhole" => Ok(WellKnownCommunity::Blackhole),
            "no-export" => Ok(WellKnownCommunity::NoExport),
            "no-advertise" => Ok(WellKnownCommunity::NoAdvertise),
            "no-export-subconfed" => Ok(WellKnownCommunity::NoExportSubconfed),
            "no-peer" => Ok(WellKnownCommunity::NoPeer),
            _ => Err(Error::InvalidArgument(format!("unknown community {}", s))),
        }
    }
}

impl From<WellKnownCommunity> for u32 {
    fn from(c: WellKnownCommunity) -> Self {
        match c {
            WellKnownCommunity::GracefulShutdown => 0xffff_0000,
            WellKnownCommunity::AcceptOwn => 0xffff_0001,
            WellKnownCommunity::Blackhole => 0xffff_029a,
            WellKnownCommunity::NoExport => 0xffff_ff01,
            WellKnownCommunity::NoAdvertise => 0xffff_ff02,
            WellKnownCommunity::NoExportSubconfed => 0xffff_ff03,
            WellKnownCommunity::NoPeer => 0xffff_ff04,
        }
    }
}

fn community_regex(s: &str) -> Result<Regex, Error> {
    let invalid = |_| Error::InvalidArgument(format!("invalid regex {}", s));
    if let Ok(v) = s.parse::<u32>() {
        return Regex::new(&format!("^{}:{}$", v >> 16, v & 0xffff)).map_err(invalid);
    }
    if let Ok(c) = WellKnownCommunity::from_str(&s.to_lowercase()) {
        let v = u32::from(c);
        return Regex::new(&format!("^{}:{}$", v >> 16, v & 0xffff)).map_err(invalid);
    }
    let plain = Regex::new(r"^\d+:\d+$").map_err(invalid)?;
    if plain.is_match(s) {
        return Regex::new(&format!("^{}$", s)).map_err(invalid);
    }
    Regex::new(s).map_err(invalid)
}

/// Standard communities written as `a:b`, a well-known name or a regular
/// expression over `a:b`.
#[derive(Clone, Debug)]
pub struct CommunityFilter {
    sets: Vec<Regex>,
}

impl CommunityFilter {
    pub fn new(patterns: &[String]) -> Result<Self, Error> {
        let sets = patterns
            .iter()
            .map(|p| community_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CommunityFilter { sets })
    }

    pub fn matches(&self, communities: &[u32]) -> bool {
        communities.iter().any(|c| {
            let s = format_community(*c);
            self.sets.iter().any(|r| r.is_match(&s))
        })
    }
}

/// Conditions of one `from` block. Any single match is enough.
#[derive(Clone, Debug, Default)]
pub struct TermCondition {
    route_filters: Vec<RouteFilter>,
    communities: Option<CommunityFilter>,
    large_communities: Vec<LargeCommunity>,
    as_path: Option<AsPathFilter>,
    neighbors: Vec<Net>,
}

impl TermCondition {
    pub fn new(route_filters: Vec<RouteFilter>) -> Self {
        TermCondition {
            route_filters,
            ..Default::default()
        }
    }

    pub fn matches(&self, net: &Net, path: &Path) -> bool {
        if self.route_filters.iter().any(|f| f.matches(net)) {
            return true;
        }
        let bgp = match path.bgp() {
            Some(p) => p,
            None => return false,
        };
        if let Some(c) = &self.communities {
            if c.matches(&bgp.communities) {
                return true;
            }
        }
        if self
            .large_communities
            .iter()
            .any(|c| bgp.large_communities.contains(c))
        {
            return true;
        }
        if let Some(a) = &self.as_path {
            if a.matches(&bgp.as_path) {
                return true;
            }
        }
        self.neighbors.iter().any(|n| {
            Net::new(bgp.source, if bgp.source.is_ipv4() { 32 } else { 128 })
                .map_or(false, |src| n.contains(&src))
        })
    }
}

impl TryFrom<&ConditionConfig> for TermCondition {
    type Error = Error;

    fn try_from(c: &ConditionConfig) -> Result<Self, Error> {
        let mut route_filters = c
            .route_filters
            .iter()
            .map(RouteFilter::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for p in &c.prefix_list {
            route_filters.push(RouteFilter::new(
                Net::from_str(p)?,
                RouteFilterMatcher::Exact,
            ));
        }
        let communities = if c.communities.is_empty() {
            None
        } else {
            Some(CommunityFilter::new(&c.communities)?)
        };
        let as_path = if c.as_path.is_empty() {
            None
        } else {
            Some(AsPathFilter::new(&c.as_path)?)
        };
        Ok(TermCondition {
            route_filters,
            communities,
            large_communities: c
                .large_communities
                .iter()
                .map(|s| LargeCommunity::from_str(s))
                .collect::<Result<Vec<_>, _>>()?,
            as_path,
            neighbors: c
                .neighbors
                .iter()
                .map(|s| {
                    Net::from_str(s).or_else(|_| {
                        let addr = IpAddr::from_str(s)
                            .map_err(|_| Error::InvalidArgument(s.to_string()))?;
                        Net::new(addr, if addr.is_ipv4() { 32 } else { 128 })
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    AddCommunity(Vec<u32>),
    AddLargeCommunity(Vec<LargeCommunity>),
    AsPathPrepend { asn: u32, times: usize },
    SetLocalPref(u32),
    SetMed(u32),
    SetNextHop(IpAddr),
}

impl Action {
    /// Applies the action. `Some(reject)` ends policy evaluation.
    fn apply(&self, path: &mut Path) -> Option<bool> {
        match self {
            Action::Accept => return Some(false),
            Action::Reject => return Some(true),
            _ => {}
        }
        if let Path::Bgp(p) = path {
            match self {
                Action::AddCommunity(v) => {
                    for c in v {
                        if !p.communities.contains(c) {
                            p.communities.push(*c);
                        }
                    }
                }
                Action::AddLargeCommunity(v) => {
                    for c in v {
                        if !p.large_communities.contains(c) {
                            p.large_communities.push(*c);
                        }
                    }
                }
                Action::AsPathPrepend { asn, times } => p.prepend(*asn, *times),
                Action::SetLocalPref(v) => p.local_pref = *v,
                Action::SetMed(v) => p.med = *v,
                Action::SetNextHop(v) => p.next_hop = *v,
                Action::Accept | Action::Reject => {}
            }
        }
        None
    }
}

fn actions_from_config(c: &ActionConfig) -> Result<Vec<Action>, Error> {
    let mut v = Vec::new();
    if !c.add_communities.is_empty() {
        v.push(Action::AddCommunity(
            c.add_communities
                .iter()
                .map(|s| crate::packet::bgp::parse_community(s))
                .collect::<Result<Vec<_>, _>>()?,
        ));
    }
    if !c.add_large_communities.is_empty() {
        v.push(Action::AddLargeCommunity(
            c.add_large_communities
                .iter()
                .map(|s| LargeCommunity::from_str(s))
                .collect::<Result<Vec<_>, _>>()?,
        ));
    }
    if let Some(p) = &c.as_path_prepend {
        v.push(Action::AsPathPrepend {
            asn: p.asn,
            times: p.times,
        });
    }
    if let Some(lp) = c.local_pref {
        v.push(Action::SetLocalPref(lp));
    }
    if let Some(med) = c.med {
        v.push(Action::SetMed(med));
    }
    if let Some(nh) = &c.next_hop {
        v.push(Action::SetNextHop(
            IpAddr::from_str(nh).map_err(|_| Error::InvalidArgument(nh.to_string()))?,
        ));
    }
    match c.disposition.as_deref() {
        None => {}
        Some("accept") => v.push(Action::Accept),
        Some("reject") => v.push(Action::Reject),
        Some(d) => {
            return Err(Error::InvalidConfiguration(format!(
                "unknown disposition {}",
                d
            )))
        }
    }
    Ok(v)
}

pub struct TermResult {
    pub path: Path,
    pub terminate: bool,
    pub reject: bool,
}

#[derive(Clone, Debug)]
pub struct Term {
    name: String,
    from: Vec<TermCondition>,
    then: Vec<Action>,
}

impl Term {
    pub fn new(name: &str, from: Vec<TermCondition>, then: Vec<Action>) -> Self {
        Term {
            name: name.to_string(),
            from,
            then,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A term without conditions matches everything.
    pub fn process(&self, net: &Net, path: Path) -> TermResult {
        if !self.from.is_empty() && !self.from.iter().any(|c| c.matches(net, &path)) {
            return TermResult {
                path,
                terminate: false,
                reject: false,
            };
        }
        let mut path = path;
        for action in &self.then {
            if let Some(reject) = action.apply(&mut path) {
                return TermResult {
                    path,
                    terminate: true,
                    reject,
                };
            }
        }
        TermResult {
            path,
            terminate: false,
            reject: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Filter {
    name: String,
    terms: Vec<Term>,
}

impl Filter {
    pub fn new(name: &str, terms: Vec<Term>) -> Self {
        Filter {
            name: name.to_string(),
            terms,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self, net: &Net, path: Path) -> TermResult {
        let mut path = path;
        for t in &self.terms {
            let res = t.process(net, path);
            if res.terminate {
                return res;
            }
            path = res.path;
        }
        TermResult {
            path,
            terminate: false,
            reject: false,
        }
    }
}

impl TryFrom<&FilterConfig> for Filter {
    type Error = Error;

    fn try_from(c: &FilterConfig) -> Result<Self, Error> {
        let mut terms = Vec::with_capacity(c.terms.len());
        for t in &c.terms {
            let from = t
                .from
                .iter()
                .map(TermCondition::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            terms.push(Term::new(&t.name, from, actions_from_config(&t.then)?));
        }
        Ok(Filter::new(&c.name, terms))
    }
}

/// Filters run in order until one of them accepts or rejects. A path no
/// filter decides on is accepted.
#[derive(Clone, Default, Debug)]
pub struct FilterChain(Vec<Arc<Filter>>);

impl FilterChain {
    pub fn new(filters: Vec<Arc<Filter>>) -> Self {
        FilterChain(filters)
    }

    pub fn accept_all() -> Self {
        FilterChain::default()
    }

    pub fn drain() -> Self {
        FilterChain(vec![Arc::new(Filter::new(
            "drain",
            vec![Term::new("drain", Vec::new(), vec![Action::Reject])],
        ))])
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.name()).collect()
    }

    /// The path to propagate, or None when rejected. Unmodified paths
    /// come back as the same allocation.
    pub fn process(&self, net: &Net, path: &Arc<Path>) -> Option<Arc<Path>> {
        if self.0.is_empty() {
            return Some(path.clone());
        }
        let mut p = path.as_ref().clone();
        for f in &self.0 {
            let res = f.process(net, p);
            if res.terminate {
                if res.reject {
                    return None;
                }
                p = res.path;
                break;
            }
            p = res.path;
        }
        if p == **path {
            Some(path.clone())
        } else {
            Some(Arc::new(p))
        }
    }
}

#[cfg(test)]
fn n(s: &str) -> Net {
    s.parse().unwrap()
}

#[test]
fn single_aspath_match() {
    assert_eq!(
        SingleAsPathMatch::LeftMost(65100),
        SingleAsPathMatch::new("^65100_").unwrap()
    );
    assert_eq!(
        SingleAsPathMatch::Origin(65100),
        SingleAsPathMatch::new("_65100$").unwrap()
    );
    assert_eq!(
        SingleAsPathMatch::Include(65100),
        SingleAsPathMatch::new("_65100_").unwrap()
    );
    assert_eq!(
        SingleAsPathMatch::Only(65100),
        SingleAsPathMatch::new("^65100$").unwrap(),
    );
    assert!(SingleAsPathMatch::new("65100").is_none());
}

#[test]
fn route_filter_matchers() {
    let in_range = RouteFilter::new(n("1.2.0.0/22"), RouteFilterMatcher::InRange(22, 24));
    assert!(in_range.matches(&n("1.2.1.0/23")));
    assert!(in_range.matches(&n("1.2.0.0/22")));
    assert!(in_range.matches(&n("1.2.3.0/24")));
    assert!(!in_range.matches(&n("1.2.0.0/16")));
    assert!(!in_range.matches(&n("1.2.0.128/25")));
    assert!(!in_range.matches(&n("2.0.0.0/23")));

    let exact = RouteFilter::new(n("0.0.0.0/0"), RouteFilterMatcher::Exact);
    assert!(exact.matches(&n("0.0.0.0/0")));
    assert!(!exact.matches(&n("1.0.0.0/8")));

    let longer = RouteFilter::new(n("10.0.0.0/8"), RouteFilterMatcher::Longer);
    assert!(!longer.matches(&n("10.0.0.0/8")));
    assert!(longer.matches(&n("10.1.0.0/16")));
}

#[test]
fn as_path_filter() {
    let f = AsPathFilter::new(&["_65001$".to_string(), "^1_2_".to_string()]).unwrap();
    assert!(f.matches(&AsPath::from_str("3 65001").unwrap()));
    assert!(f.matches(&AsPath::from_str("1 2 3").unwrap()));
    assert!(!f.matches(&AsPath::from_str("2 1 3").unwrap()));
}

#[test]
fn community_filter() {
    let f = CommunityFilter::new(&["no-export".to_string(), "65000:1.*".to_string()]).unwrap();
    assert!(f.matches(&[0xffff_ff01]));
    assert!(f.matches(&[65000 << 16 | 12]));
    assert!(!f.matches(&[65001 << 16 | 1]));
}

#[test]
fn chain_terminates_and_modifies() {
    let path = crate::table::bgp_path("10.0.0.1", 100, "65001");
    let set_lp = Filter::new(
        "lp",
        vec![Term::new(
            "bump",
            vec![TermCondition::new(vec![RouteFilter::new(
                n("10.0.0.0/8"),
                RouteFilterMatcher::OrLonger,
            )])],
            vec![Action::SetLocalPref(300)],
        )],
    );
    let reject_default = Filter::new(
        "no-default",
        vec![Term::new(
            "default",
            vec![TermCondition::new(vec![RouteFilter::new(
                n("0.0.0.0/0"),
                RouteFilterMatcher::Exact,
            )])],
            vec![Action::Reject],
        )],
    );
    let chain = FilterChain::new(vec![Arc::new(set_lp), Arc::new(reject_default)]);

    let out = chain.process(&n("10.1.0.0/16"), &path).unwrap();
    assert_eq!(out.bgp().unwrap().local_pref, 300);
    assert!(chain.process(&n("0.0.0.0/0"), &path).is_none());
    let same = chain.process(&n("192.168.0.0/16"), &path).unwrap();
    assert!(Arc::ptr_eq(&same, &path));
    assert!(FilterChain::drain().process(&n("10.0.0.0/8"), &path).is_none());
}
