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

//! Per neighbor import table.
//!
//! Every received path is stored, accepted or not, so that a new import
//! policy can be applied without a route refresh. Paths rejected by the
//! policy (or looping back to us) are kept with the `filtered` marker and
//! never reach the clients.

use log::warn;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::bgp::Net;
use crate::table::client::{ClientManager, ClientOptions, RouteTableClient};
use crate::table::filter::FilterChain;
use crate::table::{Path, Route, RoutingTable};

#[derive(Debug, Clone, Default)]
pub struct AdjRibInOptions {
    /// Paths are keyed by add-path identifier instead of replacing each
    /// other.
    pub add_path: bool,
    pub router_id: Option<Ipv4Addr>,
    pub cluster_id: Option<u32>,
    /// Paths whose AS path holds one of these are dropped.
    pub local_asns: Vec<u32>,
    pub max_prefixes: Option<u64>,
}

struct State {
    filter: FilterChain,
}

pub struct AdjRibIn {
    table: RoutingTable,
    clients: ClientManager,
    options: AdjRibInOptions,
    state: Mutex<State>,
}

impl AdjRibIn {
    pub fn new(filter: FilterChain, options: AdjRibInOptions) -> Self {
        AdjRibIn {
            table: RoutingTable::new(),
            clients: ClientManager::new(),
            options,
            state: Mutex::new(State { filter }),
        }
    }

    fn is_loop(&self, path: &Path) -> bool {
        let p = match path.bgp() {
            Some(p) => p,
            None => return false,
        };
        // RFC4456 section 8
        if let (Some(id), Some(orig)) = (self.options.router_id, p.originator_id) {
            if id == orig {
                return true;
            }
        }
        if let Some(cluster_id) = self.options.cluster_id {
            if p.cluster_list.contains(&cluster_id) {
                return true;
            }
        }
        self.options.local_asns.iter().any(|a| p.as_path.contains(*a))
    }

    /// What clients see for a stored path, None when it is hidden.
    fn verdict(&self, filter: &FilterChain, net: &Net, path: &Arc<Path>) -> Option<Arc<Path>> {
        if self.is_loop(path) {
            return None;
        }
        if path.is_filtered() {
            filter.process(net, &Arc::new(path.with_filtered(false)))
        } else {
            filter.process(net, path)
        }
    }

    fn remove_from_clients(&self, filter: &FilterChain, net: &Net, old: &[Arc<Path>]) {
        for p in old {
            if p.is_filtered() {
                continue;
            }
            if let Some(p) = self.verdict(filter, net, p) {
                for c in self.clients.clients() {
                    c.remove_path(net, &p);
                }
            }
        }
    }

    fn add_to_clients(&self, net: &Net, path: &Arc<Path>) {
        for c in self.clients.clients() {
            if let Err(e) = c.add_path(net, path.clone()) {
                warn!("failed to propagate {}: {}", net, e);
            }
        }
    }

    /// Stores a received path, replacing the previous one from this
    /// neighbor (or the one with the same path identifier in add-path
    /// mode), and propagates the change.
    pub fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        if let Some(limit) = self.options.max_prefixes {
            if self.table.route_count() >= limit && self.table.get(net).is_none() {
                return Err(Error::PrefixLimitExceeded { limit });
            }
        }

        let accepted = self.verdict(&state.filter, net, &path);
        let stored = if accepted.is_some() {
            path.clone()
        } else {
            Arc::new(path.with_filtered(true))
        };
        let old = if self.options.add_path {
            let path_id = path.path_id();
            self.table
                .modify(net, true, |route| {
                    let (old, mut keep): (Vec<_>, Vec<_>) = route
                        .paths()
                        .iter()
                        .cloned()
                        .partition(|p| p.path_id() == path_id);
                    keep.push(stored);
                    route.replace_paths(keep);
                    old
                })
                .unwrap_or_default()
        } else {
            self.table.replace_path(net, stored)
        };
        self.remove_from_clients(&state.filter, net, &old);

        if let Some(p) = accepted {
            self.add_to_clients(net, &p);
        }
        Ok(())
    }

    /// Withdraws the neighbor's path for `net`. Without add-path every
    /// path of the prefix goes, with add-path only the one carrying the
    /// same identifier.
    pub fn remove_path(&self, net: &Net, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        let old = if self.options.add_path {
            let path_id = path.path_id();
            self.table
                .modify(net, false, |route| {
                    let (old, keep): (Vec<_>, Vec<_>) = route
                        .paths()
                        .iter()
                        .cloned()
                        .partition(|p| p.path_id() == path_id);
                    route.replace_paths(keep);
                    old
                })
                .unwrap_or_default()
        } else {
            self.table.remove_pfx(net)
        };
        self.remove_from_clients(&state.filter, net, &old);
        !old.is_empty()
    }

    /// Swaps the import policy and tells the clients what changed.
    pub fn replace_filter_chain(&self, filter: FilterChain) {
        let mut state = self.state.lock().unwrap();
        for route in self.table.dump() {
            let net = route.net();
            let mut paths = Vec::with_capacity(route.paths().len());
            for p in route.paths() {
                let before = if p.is_filtered() {
                    None
                } else {
                    self.verdict(&state.filter, &net, p)
                };
                let after = self.verdict(&filter, &net, p);
                match (&before, &after) {
                    (Some(b), None) => {
                        for c in self.clients.clients() {
                            c.remove_path(&net, b);
                        }
                    }
                    (None, Some(a)) => self.add_to_clients(&net, a),
                    (Some(b), Some(a)) => {
                        for c in self.clients.clients() {
                            c.remove_path(&net, b);
                        }
                        self.add_to_clients(&net, a);
                    }
                    (None, None) => {}
                }
                paths.push(Arc::new(p.with_filtered(after.is_none())));
            }
            self.table.modify(&net, false, |r| r.replace_paths(paths));
        }
        state.filter = filter;
    }

    /// Drops every stored path.
    pub fn flush(&self) {
        let state = self.state.lock().unwrap();
        for route in self.table.dump() {
            let net = route.net();
            let old = self.table.remove_pfx(&net);
            self.remove_from_clients(&state.filter, &net, &old);
        }
    }

    pub fn get(&self, net: &Net) -> Option<Route> {
        self.table.get(net)
    }

    /// Prefixes with at least one path that passed the import policy.
    pub fn accepted_count(&self) -> u64 {
        self.table
            .dump()
            .iter()
            .filter(|r| r.paths().iter().any(|p| !p.is_filtered()))
            .count() as u64
    }
}

impl RouteTableClient for AdjRibIn {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        AdjRibIn::add_path(self, net, path)
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        AdjRibIn::remove_path(self, net, path)
    }

    /// Re-announces the accepted paths of `net`.
    fn refresh_route(&self, net: &Net, _paths: &[Arc<Path>]) {
        let state = self.state.lock().unwrap();
        if let Some(route) = self.table.get(net) {
            for p in route.paths() {
                if p.is_filtered() {
                    continue;
                }
                if let Some(p) = self.verdict(&state.filter, net, p) {
                    self.add_to_clients(net, &p);
                }
            }
        }
    }

    fn update_new_client(&self, client: Arc<dyn RouteTableClient>) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        for route in self.table.dump() {
            let net = route.net();
            for p in route.paths() {
                if p.is_filtered() {
                    continue;
                }
                if let Some(p) = self.verdict(&state.filter, &net, p) {
                    client.add_path(&net, p)?;
                }
            }
        }
        Ok(())
    }

    fn register_with_options(&self, client: Arc<dyn RouteTableClient>, opts: ClientOptions) {
        if self.clients.register_with_options(client.clone(), opts) {
            if let Err(e) = self.update_new_client(client) {
                warn!("failed to replay adj-rib-in: {}", e);
            }
        }
    }

    /// The client sees every accepted path withdrawn before it goes.
    fn unregister(&self, client: &Arc<dyn RouteTableClient>) {
        let state = self.state.lock().unwrap();
        for route in self.table.dump() {
            let net = route.net();
            for p in route.paths() {
                if p.is_filtered() {
                    continue;
                }
                if let Some(p) = self.verdict(&state.filter, &net, p) {
                    client.remove_path(&net, &p);
                }
            }
        }
        self.clients.unregister(client);
    }

    fn route_count(&self) -> u64 {
        self.table.route_count()
    }

    fn client_count(&self) -> u64 {
        self.clients.client_count()
    }

    fn dump(&self) -> Vec<Route> {
        self.table.dump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::bgp_path;
    use crate::table::client::RecordingClient;
    use crate::table::filter::{Action, Filter, RouteFilter, RouteFilterMatcher, Term, TermCondition};

    fn n(s: &str) -> Net {
        s.parse().unwrap()
    }

    fn reject(prefix: &str) -> FilterChain {
        FilterChain::new(vec![Arc::new(Filter::new(
            "reject",
            vec![Term::new(
                "t",
                vec![TermCondition::new(vec![RouteFilter::new(
                    n(prefix),
                    RouteFilterMatcher::Exact,
                )])],
                vec![Action::Reject],
            )],
        ))])
    }

    fn setup(filter: FilterChain, options: AdjRibInOptions) -> (Arc<AdjRibIn>, Arc<RecordingClient>) {
        let rib = Arc::new(AdjRibIn::new(filter, options));
        let client = Arc::new(RecordingClient::default());
        rib.register(client.clone());
        (rib, client)
    }

    #[test]
    fn replace_propagates_removal_then_add() {
        let (rib, client) = setup(FilterChain::accept_all(), AdjRibInOptions::default());
        let a = bgp_path("10.0.0.1", 100, "1");
        let b = bgp_path("10.0.0.1", 200, "1");
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        rib.add_path(&n("10.0.0.0/8"), b.clone()).unwrap();
        assert_eq!(client.added().len(), 2);
        assert_eq!(client.removed(), vec![(n("10.0.0.0/8"), a)]);
        assert_eq!(rib.get(&n("10.0.0.0/8")).unwrap().paths(), &[b]);
    }

    #[test]
    fn same_path_is_propagated_again() {
        let (rib, client) = setup(FilterChain::accept_all(), AdjRibInOptions::default());
        let a = bgp_path("10.0.0.1", 100, "1");
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        assert_eq!(client.added().len(), 2);
        assert_eq!(client.removed().len(), 1);
    }

    #[test]
    fn rejected_path_still_withdraws_old() {
        let (rib, client) = setup(reject("10.0.0.0/8"), AdjRibInOptions::default());
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        assert!(client.added().is_empty());
        assert_eq!(rib.route_count(), 1);
        assert_eq!(rib.accepted_count(), 0);
        assert!(rib.get(&n("10.0.0.0/8")).unwrap().paths()[0].is_filtered());
    }

    #[test]
    fn filter_chain_swap() {
        let (rib, client) = setup(reject("10.0.0.0/8"), AdjRibInOptions::default());
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        rib.add_path(&n("11.0.0.0/8"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        assert_eq!(client.added().len(), 1);

        rib.replace_filter_chain(reject("11.0.0.0/8"));
        let added = client.added();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1].0, n("10.0.0.0/8"));
        assert!(!added[1].1.is_filtered());
        assert_eq!(client.removed(), vec![(n("11.0.0.0/8"), added[0].1.clone())]);
        assert_eq!(rib.accepted_count(), 1);
    }

    #[test]
    fn add_path_mode_keys_by_id() {
        let options = AdjRibInOptions {
            add_path: true,
            ..Default::default()
        };
        let (rib, client) = setup(FilterChain::accept_all(), options);
        let a = Arc::new(bgp_path("10.0.0.1", 100, "1").with_path_id(1));
        let b = Arc::new(bgp_path("10.0.0.1", 100, "2").with_path_id(2));
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        rib.add_path(&n("10.0.0.0/8"), b.clone()).unwrap();
        assert_eq!(rib.get(&n("10.0.0.0/8")).unwrap().paths().len(), 2);

        assert!(rib.remove_path(&n("10.0.0.0/8"), &a));
        assert_eq!(client.removed(), vec![(n("10.0.0.0/8"), a)]);
        assert_eq!(rib.get(&n("10.0.0.0/8")).unwrap().paths(), &[b]);
    }

    #[test]
    fn prefix_limit() {
        let options = AdjRibInOptions {
            max_prefixes: Some(1),
            ..Default::default()
        };
        let (rib, _) = setup(FilterChain::accept_all(), options);
        let a = bgp_path("10.0.0.1", 100, "1");
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        // replacing an existing prefix is fine
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        match rib.add_path(&n("11.0.0.0/8"), a) {
            Err(Error::PrefixLimitExceeded { limit }) => assert_eq!(limit, 1),
            _ => panic!("limit must trigger"),
        }
    }

    #[test]
    fn loops_are_hidden() {
        let options = AdjRibInOptions {
            local_asns: vec![65000],
            ..Default::default()
        };
        let (rib, client) = setup(FilterChain::accept_all(), options);
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "1 65000 2"))
            .unwrap();
        assert!(client.added().is_empty());
    }

    #[test]
    fn new_client_and_unregister() {
        let (rib, _) = setup(FilterChain::accept_all(), AdjRibInOptions::default());
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        let late = Arc::new(RecordingClient::default());
        let c: Arc<dyn RouteTableClient> = late.clone();
        rib.register(c.clone());
        assert_eq!(late.added().len(), 1);
        rib.unregister(&c);
        assert_eq!(late.removed().len(), 1);
        assert_eq!(rib.client_count(), 1);

        rib.flush();
        assert_eq!(rib.route_count(), 0);
    }
}
