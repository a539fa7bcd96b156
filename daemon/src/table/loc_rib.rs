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

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::bgp::Net;
use crate::table::client::{ClientManager, ClientOptions, RouteTableClient};
use crate::table::{paths_diff, ContributingAsns, Path, Route, RoutingTable};

/// Orders the paths of a prefix, most preferred first.
pub trait BestPathSelector: Send + Sync {
    fn compare(&self, a: &Path, b: &Path) -> Ordering;
}

pub struct DefaultSelector;

impl BestPathSelector for DefaultSelector {
    fn compare(&self, a: &Path, b: &Path) -> Ordering {
        a.compare(b)
    }
}

/// Aggregates the paths of every neighbor of a VRF and address family.
pub struct LocRib {
    name: String,
    table: RoutingTable,
    clients: ClientManager,
    selector: Box<dyn BestPathSelector>,
    // held from a table change until its propagation is done so that
    // clients see the changes of a prefix in table order
    contributing: Mutex<ContributingAsns>,
}

impl LocRib {
    pub fn new(name: &str) -> Self {
        LocRib::with_selector(name, Box::new(DefaultSelector))
    }

    pub fn with_selector(name: &str, selector: Box<dyn BestPathSelector>) -> Self {
        LocRib {
            name: name.to_string(),
            table: RoutingTable::new(),
            clients: ClientManager::new(),
            selector,
            contributing: Mutex::new(ContributingAsns::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` on the route for `net`, reselects, and hands both
    /// versions to `propagate_changes`.
    fn update<F>(&self, net: &Net, create: bool, f: F) -> bool
    where
        F: FnOnce(&mut Route) -> bool,
    {
        let selector = &self.selector;
        let r = self.table.modify(net, create, |route| {
            let old = route.clone();
            let changed = f(route);
            if changed {
                route.select_with(|a, b| selector.compare(a, b));
            }
            (changed, old, route.clone())
        });
        match r {
            Some((true, old, new)) => {
                self.propagate_changes(&old, &new);
                true
            }
            _ => false,
        }
    }

    /// Removals go out before additions. Each client only sees as many
    /// leading paths as its options allow.
    fn propagate_changes(&self, old: &Route, new: &Route) {
        for (c, opts) in self.clients.clients_with_options() {
            let (old_paths, new_paths) = visible(old, new, &opts);
            for p in paths_diff(old_paths, new_paths) {
                c.remove_path(&old.net(), &p);
            }
        }
        for (c, opts) in self.clients.clients_with_options() {
            let (old_paths, new_paths) = visible(old, new, &opts);
            for p in paths_diff(new_paths, old_paths) {
                if let Err(e) = c.add_path(&new.net(), p) {
                    log::warn!("{}: failed to propagate {}: {}", self.name, new.net(), e);
                }
            }
        }
    }

    pub fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        let origin = path.bgp().and_then(|p| p.as_path.origin_asn());
        let mut contributing = self.contributing.lock().unwrap();
        self.update(net, true, |route| {
            route.add_path(path);
            true
        });
        if let Some(asn) = origin {
            contributing.add(asn);
        }
        Ok(())
    }

    pub fn remove_path(&self, net: &Net, path: &Path) -> bool {
        let mut contributing = self.contributing.lock().unwrap();
        let removed = self.update(net, false, |route| route.remove_path(path));
        if removed {
            if let Some(asn) = path.bgp().and_then(|p| p.as_path.origin_asn()) {
                contributing.remove(asn);
            }
        }
        removed
    }

    pub fn contains_pfx_path(&self, net: &Net, path: &Path) -> bool {
        self.table
            .get(net)
            .map_or(false, |r| r.contains_path(path))
    }

    pub fn is_contributing(&self, asn: u32) -> bool {
        self.contributing.lock().unwrap().is_contributing(asn)
    }

    pub fn get(&self, net: &Net) -> Option<Route> {
        self.table.get(net)
    }

    pub fn lpm(&self, net: &Net) -> Vec<Route> {
        self.table.lpm(net)
    }

    pub fn get_longer(&self, net: &Net) -> Vec<Route> {
        self.table.get_longer(net)
    }
}

fn visible<'a>(
    old: &'a Route,
    new: &'a Route,
    opts: &ClientOptions,
) -> (&'a [Arc<Path>], &'a [Arc<Path>]) {
    let old_limit = std::cmp::min(opts.get_max_paths(old.ecmp_count()), old.paths().len());
    let new_limit = std::cmp::min(opts.get_max_paths(new.ecmp_count()), new.paths().len());
    (&old.paths()[..old_limit], &new.paths()[..new_limit])
}

impl RouteTableClient for LocRib {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        LocRib::add_path(self, net, path)
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        LocRib::remove_path(self, net, path)
    }

    fn update_new_client(&self, client: Arc<dyn RouteTableClient>) -> Result<(), Error> {
        let opts = self.clients.options(&client).unwrap_or_default();
        for route in self.table.dump() {
            let limit = std::cmp::min(opts.get_max_paths(route.ecmp_count()), route.paths().len());
            for p in &route.paths()[..limit] {
                client.add_path(&route.net(), p.clone())?;
            }
        }
        Ok(())
    }

    fn register_with_options(&self, client: Arc<dyn RouteTableClient>, opts: ClientOptions) {
        let _guard = self.contributing.lock().unwrap();
        if self.clients.register_with_options(client.clone(), opts) {
            if let Err(e) = self.update_new_client(client) {
                log::warn!("{}: failed to replay routes: {}", self.name, e);
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
    use crate::table::bgp_path;
    use crate::table::client::RecordingClient;

    fn n(s: &str) -> Net {
        s.parse().unwrap()
    }

    #[test]
    fn best_path_change() {
        let rib = LocRib::new("inet.0");
        let client = Arc::new(RecordingClient::default());
        rib.register(client.clone());

        let a = bgp_path("10.0.0.1", 100, "65001");
        let b = bgp_path("10.0.0.2", 200, "65002");
        rib.add_path(&n("10.0.0.0/8"), a.clone()).unwrap();
        rib.add_path(&n("10.0.0.0/8"), b.clone()).unwrap();
        // b replaced a as the best path
        assert_eq!(client.removed(), vec![(n("10.0.0.0/8"), a.clone())]);
        assert_eq!(
            client.added(),
            vec![(n("10.0.0.0/8"), a.clone()), (n("10.0.0.0/8"), b.clone())]
        );
        assert!(rib.is_contributing(65002));

        assert!(rib.remove_path(&n("10.0.0.0/8"), &b));
        assert_eq!(client.added().last().unwrap().1, a);
        assert!(!rib.is_contributing(65002));
        assert!(rib.contains_pfx_path(&n("10.0.0.0/8"), &a));
        assert!(!rib.remove_path(&n("10.0.0.0/8"), &b));
    }

    #[test]
    fn ecmp_client_sees_equal_paths() {
        let rib = LocRib::new("inet.0");
        let client = Arc::new(RecordingClient::default());
        rib.register_with_options(
            client.clone(),
            ClientOptions {
                best_only: false,
                ecmp_only: true,
                max_paths: 0,
            },
        );
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.2", 100, "2"))
            .unwrap();
        rib.add_path(&n("10.0.0.0/8"), bgp_path("10.0.0.3", 50, "3"))
            .unwrap();
        assert_eq!(client.added().len(), 2);
        assert!(client.removed().is_empty());
        assert_eq!(rib.get(&n("10.0.0.0/8")).unwrap().ecmp_count(), 2);
    }

    #[test]
    fn replay_on_register() {
        let rib = LocRib::new("inet6.0");
        rib.add_path(&n("2001:db8::/32"), bgp_path("10.0.0.1", 100, "1"))
            .unwrap();
        rib.add_path(&n("2001:db8::/32"), bgp_path("10.0.0.2", 100, "1"))
            .unwrap();
        let client = Arc::new(RecordingClient::default());
        rib.register(client.clone());
        assert_eq!(client.added().len(), 1);
        assert_eq!(rib.route_count(), 1);
        assert_eq!(rib.lpm(&n("2001:db8:1::/48")).len(), 1);
    }

    #[derive(Default)]
    struct SetClient(Mutex<Vec<Arc<Path>>>);

    impl RouteTableClient for SetClient {
        fn add_path(&self, _net: &Net, path: Arc<Path>) -> Result<(), Error> {
            let mut paths = self.0.lock().unwrap();
            if !paths.contains(&path) {
                paths.push(path);
            }
            Ok(())
        }

        fn remove_path(&self, _net: &Net, path: &Arc<Path>) -> bool {
            let mut paths = self.0.lock().unwrap();
            let before = paths.len();
            paths.retain(|p| p != path);
            before != paths.len()
        }
    }

    #[test]
    fn concurrent_changes_keep_clients_in_sync() {
        for _ in 0..20 {
            let rib = Arc::new(LocRib::new("inet.0"));
            let client = Arc::new(SetClient::default());
            rib.register(client.clone());

            let threads: Vec<_> = (1..=4u32)
                .map(|i| {
                    let rib = rib.clone();
                    std::thread::spawn(move || {
                        let p = bgp_path(&format!("10.0.0.{}", i), 100 * i, "65001");
                        for _ in 0..200 {
                            rib.add_path(&n("10.0.0.0/8"), p.clone()).unwrap();
                            rib.remove_path(&n("10.0.0.0/8"), &p);
                        }
                        rib.add_path(&n("10.0.0.0/8"), p).unwrap();
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            let route = rib.get(&n("10.0.0.0/8")).unwrap();
            assert_eq!(route.paths().len(), 4);
            let best = route.best_path().unwrap().clone();
            assert_eq!(*client.0.lock().unwrap(), vec![best]);
        }
    }
}
