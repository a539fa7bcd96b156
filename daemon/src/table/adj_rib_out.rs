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

//! Per neighbor export table.

use fnv::FnvHashMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::bgp::{Attribute, Net};
use crate::table::client::{ClientManager, ClientOptions, RouteTableClient};
use crate::table::filter::FilterChain;
use crate::table::{Path, Route, RoutingTable};

/// What the export side needs to know about the neighbor.
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    pub address: IpAddr,
    pub local_address: IpAddr,
    pub local_as: u32,
    pub peer_as: u32,
    pub router_id: Ipv4Addr,
    pub route_server_client: bool,
    pub route_reflector_client: bool,
    pub cluster_id: u32,
}

impl NeighborInfo {
    pub fn is_ibgp(&self) -> bool {
        self.local_as == self.peer_as
    }
}

/// Hands out add-path identifiers. Identical paths share an identifier
/// and keep it until the last of them is released.
#[derive(Default)]
struct PathIdManager {
    ids: FnvHashMap<u32, u64>,
    id_by_path: HashMap<Path, u32>,
    last: u32,
    used: u64,
}

impl PathIdManager {
    fn add_path(&mut self, path: &Path) -> Result<u32, Error> {
        if let Some(id) = self.id_by_path.get(path) {
            *self.ids.entry(*id).or_insert(0) += 1;
            return Ok(*id);
        }
        if self.used >= u32::MAX as u64 {
            return Err(Error::OutOfPathIds);
        }
        loop {
            self.last = self.last.wrapping_add(1);
            if self.last != 0 && !self.ids.contains_key(&self.last) {
                break;
            }
        }
        self.ids.insert(self.last, 1);
        self.id_by_path.insert(path.clone(), self.last);
        self.used += 1;
        Ok(self.last)
    }

    fn release_path(&mut self, path: &Path) -> Result<u32, Error> {
        let id = match self.id_by_path.get(path) {
            Some(id) => *id,
            None => return Err(Error::NotFound("path id".to_string())),
        };
        if let Some(count) = self.ids.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.ids.remove(&id);
                self.id_by_path.remove(path);
                self.used -= 1;
            }
        }
        Ok(id)
    }
}

struct State {
    filter: FilterChain,
    path_ids: PathIdManager,
    // every path handed to us and what it was advertised as, if anything
    sources: FnvHashMap<Net, HashMap<Path, Option<Arc<Path>>>>,
}

pub struct AdjRibOut {
    table: RoutingTable,
    clients: ClientManager,
    neighbor: NeighborInfo,
    add_path: bool,
    state: Mutex<State>,
}

impl AdjRibOut {
    pub fn new(neighbor: NeighborInfo, add_path: bool, filter: FilterChain) -> Self {
        AdjRibOut {
            table: RoutingTable::new(),
            clients: ClientManager::new(),
            neighbor,
            add_path,
            state: Mutex::new(State {
                filter,
                path_ids: PathIdManager::default(),
                sources: FnvHashMap::default(),
            }),
        }
    }

    pub fn neighbor(&self) -> &NeighborInfo {
        &self.neighbor
    }

    pub fn is_add_path(&self) -> bool {
        self.add_path
    }

    /// Loop prevention and well-known community handling.
    fn should_propagate_update(&self, path: &Path) -> bool {
        let p = match path.bgp() {
            Some(p) => p,
            None => return false,
        };
        if p.source == self.neighbor.address {
            return false;
        }
        for c in &p.communities {
            if *c == Attribute::COMMUNITY_NO_ADVERTISE {
                return false;
            }
            if *c == Attribute::COMMUNITY_NO_EXPORT && !self.neighbor.is_ibgp() {
                return false;
            }
        }
        if self.neighbor.is_ibgp() && !p.ebgp && !self.neighbor.route_reflector_client {
            return false;
        }
        if p.only_to_client && !self.neighbor.route_reflector_client {
            return false;
        }
        true
    }

    /// The path as advertised to the neighbor, before identifiers are
    /// assigned.
    fn export(&self, filter: &FilterChain, net: &Net, path: &Path) -> Option<Arc<Path>> {
        if !self.should_propagate_update(path) {
            return None;
        }
        let mut p = path.bgp()?.clone();
        p.path_id = 0;
        if !self.neighbor.is_ibgp() && !self.neighbor.route_server_client {
            p.prepend(self.neighbor.local_as, 1);
            p.next_hop = self.neighbor.local_address;
        }
        if self.neighbor.is_ibgp() && self.neighbor.route_reflector_client {
            if p.originator_id.is_none() {
                p.originator_id = Some(p.bgp_identifier);
            }
            p.cluster_list.insert(0, self.neighbor.cluster_id);
        }
        // passed on without being understood
        for a in p.unknown_attributes.iter_mut() {
            if let Attribute::Unknown { flags, .. } = a {
                if *flags & Attribute::FLAG_TRANSITIVE != 0 {
                    *flags |= Attribute::FLAG_PARTIAL;
                }
            }
        }
        filter.process(net, &Arc::new(Path::Bgp(p)))
    }

    /// Stores an exported path and advertises it, returning the stored
    /// variant.
    fn install(&self, state: &mut State, net: &Net, p: Arc<Path>) -> Result<Arc<Path>, Error> {
        let p = if self.add_path {
            let id = state.path_ids.add_path(&p)?;
            let p = Arc::new(p.with_path_id(id));
            self.table.add_path(net, p.clone())?;
            p
        } else {
            for o in self.table.replace_path(net, p.clone()) {
                for c in self.clients.clients() {
                    c.remove_path(net, &o);
                }
            }
            p
        };
        for c in self.clients.clients() {
            if let Err(e) = c.add_path(net, p.clone()) {
                log::warn!("{}: failed to send {}: {}", self.neighbor.address, net, e);
            }
        }
        Ok(p)
    }

    fn withdraw(&self, state: &mut State, net: &Net, stored: &Arc<Path>) -> bool {
        if self.add_path {
            if let Err(e) = state.path_ids.release_path(&stored.with_path_id(0)) {
                log::warn!("{}: {} has no path id: {}", self.neighbor.address, net, e);
            }
        }
        if !self.table.remove_path(net, stored) {
            return false;
        }
        for c in self.clients.clients() {
            c.remove_path(net, stored);
        }
        true
    }

    pub fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if self.add_path {
            if state
                .sources
                .get(net)
                .map_or(false, |m| m.contains_key(&*path))
            {
                return Ok(());
            }
        } else if let Some(old) = state.sources.remove(net) {
            // the new path supersedes whatever was advertised
            for stored in old.into_iter().filter_map(|(_, s)| s) {
                self.withdraw(&mut state, net, &stored);
            }
        }
        let stored = match self.export(&state.filter, net, &path) {
            Some(p) => Some(self.install(&mut state, net, p)?),
            None => None,
        };
        state
            .sources
            .entry(*net)
            .or_default()
            .insert((*path).clone(), stored);
        Ok(())
    }

    pub fn remove_path(&self, net: &Net, path: &Path) -> bool {
        let mut state = self.state.lock().unwrap();
        let recorded = state.sources.get_mut(net).and_then(|m| m.remove(path));
        if state.sources.get(net).map_or(false, |m| m.is_empty()) {
            state.sources.remove(net);
        }
        match recorded {
            Some(Some(stored)) => self.withdraw(&mut state, net, &stored),
            _ => false,
        }
    }

    /// Swaps the export policy and re-exports every path whose
    /// advertisement changes under it.
    pub fn replace_filter_chain(&self, filter: FilterChain) {
        let mut state = self.state.lock().unwrap();
        state.filter = filter;
        let sources = std::mem::take(&mut state.sources);
        for (net, paths) in sources {
            let mut m = HashMap::with_capacity(paths.len());
            for (path, stored) in paths {
                let exported = self.export(&state.filter, &net, &path);
                let unchanged = match (&stored, &exported) {
                    (Some(s), Some(e)) => s.with_path_id(0) == **e,
                    (None, None) => true,
                    _ => false,
                };
                if unchanged {
                    m.insert(path, stored);
                    continue;
                }
                if let Some(s) = &stored {
                    self.withdraw(&mut state, &net, s);
                }
                let stored = match exported {
                    Some(e) => match self.install(&mut state, &net, e) {
                        Ok(p) => Some(p),
                        Err(e) => {
                            log::warn!("{}: failed to export {}: {}", self.neighbor.address, net, e);
                            None
                        }
                    },
                    None => None,
                };
                m.insert(path, stored);
            }
            state.sources.insert(net, m);
        }
    }

    /// Options to register with on a Loc-RIB.
    pub fn client_options(&self, max_paths: usize) -> ClientOptions {
        if self.add_path {
            ClientOptions {
                best_only: false,
                ecmp_only: false,
                max_paths,
            }
        } else {
            ClientOptions::default()
        }
    }
}

impl RouteTableClient for AdjRibOut {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        AdjRibOut::add_path(self, net, path)
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        AdjRibOut::remove_path(self, net, path)
    }

    fn update_new_client(&self, client: Arc<dyn RouteTableClient>) -> Result<(), Error> {
        for route in self.table.dump() {
            for p in route.paths() {
                client.add_path(&route.net(), p.clone())?;
            }
        }
        Ok(())
    }

    fn register_with_options(&self, client: Arc<dyn RouteTableClient>, opts: ClientOptions) {
        if self.clients.register_with_options(client.clone(), opts) {
            if let Err(e) = self.update_new_client(client) {
                log::warn!("{}: failed to replay routes: {}", self.neighbor.address, e);
            }
        }
    }

    fn unregister(&self, client: &Arc<dyn RouteTableClient>) {
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
    use crate::table::client::RecordingClient;
    use crate::table::filter::{Action, Filter, Term};
    use crate::table::{bgp_path, BgpPath};
    use std::str::FromStr;

    fn policy(then: Vec<Action>) -> FilterChain {
        FilterChain::new(vec![Arc::new(Filter::new(
            "export",
            vec![Term::new("t", Vec::new(), then)],
        ))])
    }

    fn n(s: &str) -> Net {
        s.parse().unwrap()
    }

    fn neighbor(peer_as: u32) -> NeighborInfo {
        NeighborInfo {
            address: IpAddr::from_str("192.0.2.1").unwrap(),
            local_address: IpAddr::from_str("192.0.2.254").unwrap(),
            local_as: 65000,
            peer_as,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            route_server_client: false,
            route_reflector_client: false,
            cluster_id: 0,
        }
    }

    fn ebgp_path(source: &str, as_path: &str) -> Arc<Path> {
        let p = bgp_path(source, 100, as_path);
        let mut b: BgpPath = p.bgp().unwrap().clone();
        b.ebgp = true;
        Arc::new(Path::Bgp(b))
    }

    #[test]
    fn path_id_manager() {
        let mut m = PathIdManager::default();
        let paths: Vec<Arc<Path>> = (1..=5)
            .map(|i| bgp_path(&format!("10.0.0.{}", i), 100, "1"))
            .collect();
        let mut ids: Vec<u32> = paths.iter().map(|p| m.add_path(p).unwrap()).collect();
        assert!(ids.iter().all(|id| *id != 0));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);

        // same path, same id
        let again = m.add_path(&paths[0]).unwrap();
        assert_eq!(m.release_path(&paths[0]).unwrap(), again);
        assert_eq!(m.release_path(&paths[0]).unwrap(), again);
        assert!(m.release_path(&paths[0]).is_err());

        let fresh = m.add_path(&bgp_path("10.0.0.9", 100, "1")).unwrap();
        assert!(!ids[1..].contains(&fresh));

        m.used = u32::MAX as u64;
        assert!(matches!(
            m.add_path(&bgp_path("10.0.0.10", 100, "1")),
            Err(Error::OutOfPathIds)
        ));
    }

    #[test]
    fn path_id_skips_live_ids_on_wrap() {
        let mut m = PathIdManager::default();
        let first = m.add_path(&bgp_path("10.0.0.1", 100, "1")).unwrap();
        m.last = u32::MAX;
        let next = m.add_path(&bgp_path("10.0.0.2", 100, "1")).unwrap();
        assert_eq!(first, 1);
        assert_eq!(next, 2);
    }

    #[test]
    fn ebgp_rewrite() {
        let out = Arc::new(AdjRibOut::new(neighbor(65001), false, FilterChain::accept_all()));
        let client = Arc::new(RecordingClient::default());
        out.register(client.clone());

        out.add_path(&n("10.0.0.0/8"), ebgp_path("10.0.0.1", "65002"))
            .unwrap();
        let added = client.added();
        assert_eq!(added.len(), 1);
        let b = added[0].1.bgp().unwrap();
        assert_eq!(b.as_path.to_string(), "65000 65002");
        assert_eq!(b.next_hop, IpAddr::from_str("192.0.2.254").unwrap());

        assert!(out.remove_path(&n("10.0.0.0/8"), &ebgp_path("10.0.0.1", "65002")));
        assert_eq!(client.removed().len(), 1);
        assert_eq!(out.route_count(), 0);
    }

    #[test]
    fn suppressed_paths() {
        let out = AdjRibOut::new(neighbor(65001), false, FilterChain::accept_all());
        // learned from the neighbor itself
        out.add_path(&n("10.0.0.0/8"), ebgp_path("192.0.2.1", "65001"))
            .unwrap();
        let mut p = ebgp_path("10.0.0.1", "65002").bgp().unwrap().clone();
        p.communities = vec![Attribute::COMMUNITY_NO_EXPORT];
        out.add_path(&n("11.0.0.0/8"), Arc::new(Path::Bgp(p))).unwrap();
        assert_eq!(out.route_count(), 0);

        let ibgp = AdjRibOut::new(neighbor(65000), false, FilterChain::accept_all());
        ibgp.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "65002"))
            .unwrap();
        assert_eq!(ibgp.route_count(), 0);
        ibgp.add_path(&n("10.0.0.0/8"), ebgp_path("10.0.0.1", "65002"))
            .unwrap();
        assert_eq!(ibgp.route_count(), 1);
    }

    #[test]
    fn route_reflector_client() {
        let mut info = neighbor(65000);
        info.route_reflector_client = true;
        info.cluster_id = 42;
        let out = AdjRibOut::new(info, false, FilterChain::accept_all());
        out.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "65002"))
            .unwrap();
        let r = out.dump();
        let b = r[0].paths()[0].bgp().unwrap();
        assert_eq!(b.cluster_list, vec![42]);
        assert_eq!(b.originator_id, Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(b.as_path.to_string(), "65002");
    }

    #[test]
    fn add_path_assigns_ids() {
        let out = AdjRibOut::new(neighbor(65001), true, FilterChain::accept_all());
        let a = ebgp_path("10.0.0.1", "65002");
        let b = ebgp_path("10.0.0.2", "65003");
        out.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        out.add_path(&n("10.0.0.0/8"), b.clone()).unwrap();
        let route = out.dump().remove(0);
        let ids: Vec<u32> = route.paths().iter().map(|p| p.path_id()).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(out.remove_path(&n("10.0.0.0/8"), &a));
        let route = out.dump().remove(0);
        assert_eq!(route.paths().len(), 1);
        assert_eq!(route.paths()[0].path_id(), 2);
    }

    #[test]
    fn remove_after_filter_swap() {
        let out = Arc::new(AdjRibOut::new(neighbor(65001), false, FilterChain::accept_all()));
        let client = Arc::new(RecordingClient::default());
        out.register(client.clone());
        let p = ebgp_path("10.0.0.1", "65002");
        out.add_path(&n("10.0.0.0/8"), p.clone()).unwrap();

        out.replace_filter_chain(policy(vec![Action::SetMed(10), Action::Accept]));
        // re-exported with the new attributes
        let added = client.added();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1].1.bgp().unwrap().med, 10);
        assert_eq!(client.removed(), vec![added[0].clone()]);

        assert!(out.remove_path(&n("10.0.0.0/8"), &p));
        assert_eq!(client.removed().last(), Some(&added[1]));
        assert_eq!(out.route_count(), 0);
        assert!(!out.remove_path(&n("10.0.0.0/8"), &p));
    }

    #[test]
    fn filter_swap_withdraws_and_restores() {
        let out = Arc::new(AdjRibOut::new(neighbor(65001), true, FilterChain::accept_all()));
        let client = Arc::new(RecordingClient::default());
        out.register(client.clone());
        let a = ebgp_path("10.0.0.1", "65002");
        let b = ebgp_path("10.0.0.2", "65003");
        out.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        out.add_path(&n("10.0.0.0/8"), b.clone()).unwrap();

        out.replace_filter_chain(policy(vec![Action::Reject]));
        assert_eq!(client.removed().len(), 2);
        assert_eq!(out.route_count(), 0);

        out.replace_filter_chain(FilterChain::accept_all());
        assert_eq!(client.added().len(), 4);
        assert_eq!(out.dump()[0].paths().len(), 2);

        assert!(out.remove_path(&n("10.0.0.0/8"), &a));
        assert!(out.remove_path(&n("10.0.0.0/8"), &b));
        assert_eq!(client.removed().len(), 4);
        assert_eq!(out.route_count(), 0);
    }

    #[test]
    fn unknown_transitive_marked_partial() {
        let out = AdjRibOut::new(neighbor(65001), false, FilterChain::accept_all());
        let mut p = ebgp_path("10.0.0.1", "65002").bgp().unwrap().clone();
        p.unknown_attributes.push(Attribute::Unknown {
            flags: Attribute::FLAG_OPTIONAL | Attribute::FLAG_TRANSITIVE,
            code: 99,
            bin: vec![1, 2, 3],
        });
        let p = Arc::new(Path::Bgp(p));
        out.add_path(&n("10.0.0.0/8"), p.clone()).unwrap();

        let exported = out.dump()[0].paths()[0].clone();
        assert_eq!(
            exported.bgp().unwrap().unknown_attributes,
            vec![Attribute::Unknown {
                flags: Attribute::FLAG_OPTIONAL
                    | Attribute::FLAG_TRANSITIVE
                    | Attribute::FLAG_PARTIAL,
                code: 99,
                bin: vec![1, 2, 3],
            }]
        );
        // the received copy is left alone
        assert!(matches!(
            p.bgp().unwrap().unknown_attributes[0],
            Attribute::Unknown { flags, .. } if flags & Attribute::FLAG_PARTIAL == 0
        ));
        assert!(out.remove_path(&n("10.0.0.0/8"), &p));
    }
}
