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

use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::packet::bgp::Net;
use crate::table::{Path, Route};

/// Propagation contract between the tables of the pipeline and anything
/// observing them.
///
/// A client registered on a table first receives the table's full state
/// through `update_new_client`, then incremental `add_path`/`remove_path`
/// calls until it unregisters.
pub trait RouteTableClient: Send + Sync {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error>;

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool;

    fn replace_path(&self, net: &Net, old: &Arc<Path>, new: Arc<Path>) -> Result<(), Error> {
        self.remove_path(net, old);
        self.add_path(net, new)
    }

    fn refresh_route(&self, _net: &Net, _paths: &[Arc<Path>]) {}

    fn update_new_client(&self, _client: Arc<dyn RouteTableClient>) -> Result<(), Error> {
        Ok(())
    }

    fn register(&self, client: Arc<dyn RouteTableClient>) {
        self.register_with_options(client, ClientOptions::default());
    }

    fn register_with_options(&self, _client: Arc<dyn RouteTableClient>, _opts: ClientOptions) {}

    fn unregister(&self, _client: &Arc<dyn RouteTableClient>) {}

    fn route_count(&self) -> u64 {
        0
    }

    fn client_count(&self) -> u64 {
        0
    }

    fn dump(&self) -> Vec<Route> {
        Vec::new()
    }
}

/// Identity of a client, ignoring the vtable half of the fat pointer.
pub(crate) fn same_client(a: &Arc<dyn RouteTableClient>, b: &Arc<dyn RouteTableClient>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// How many paths per prefix a client wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub best_only: bool,
    pub ecmp_only: bool,
    pub max_paths: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            best_only: true,
            ecmp_only: false,
            max_paths: 1,
        }
    }
}

impl ClientOptions {
    pub fn get_max_paths(&self, ecmp_count: usize) -> usize {
        if self.best_only {
            1
        } else if self.ecmp_only {
            ecmp_count
        } else {
            self.max_paths
        }
    }
}

/// Registry of the clients of one table.
#[derive(Default)]
pub struct ClientManager {
    clients: RwLock<Vec<(Arc<dyn RouteTableClient>, ClientOptions)>>,
}

impl ClientManager {
    pub fn new() -> Self {
        ClientManager::default()
    }

    /// Returns false when the client is already registered.
    pub fn register_with_options(&self, client: Arc<dyn RouteTableClient>, opts: ClientOptions) -> bool {
        let mut clients = self.clients.write().unwrap();
        if clients.iter().any(|(c, _)| same_client(c, &client)) {
            return false;
        }
        clients.push((client, opts));
        true
    }

    pub fn unregister(&self, client: &Arc<dyn RouteTableClient>) -> bool {
        let mut clients = self.clients.write().unwrap();
        let before = clients.len();
        clients.retain(|(c, _)| !same_client(c, client));
        before != clients.len()
    }

    pub fn clients(&self) -> Vec<Arc<dyn RouteTableClient>> {
        self.clients
            .read()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn clients_with_options(&self) -> Vec<(Arc<dyn RouteTableClient>, ClientOptions)> {
        self.clients.read().unwrap().clone()
    }

    pub fn options(&self, client: &Arc<dyn RouteTableClient>) -> Option<ClientOptions> {
        self.clients
            .read()
            .unwrap()
            .iter()
            .find(|(c, _)| same_client(c, client))
            .map(|(_, o)| *o)
    }

    pub fn client_count(&self) -> u64 {
        self.clients.read().unwrap().len() as u64
    }
}

/// Client remembering every call, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingClient {
    pub(crate) added: std::sync::Mutex<Vec<(Net, Arc<Path>)>>,
    pub(crate) removed: std::sync::Mutex<Vec<(Net, Arc<Path>)>>,
}

#[cfg(test)]
impl RecordingClient {
    pub(crate) fn added(&self) -> Vec<(Net, Arc<Path>)> {
        self.added.lock().unwrap().clone()
    }

    pub(crate) fn removed(&self) -> Vec<(Net, Arc<Path>)> {
        self.removed.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl RouteTableClient for RecordingClient {
    fn add_path(&self, net: &Net, path: Arc<Path>) -> Result<(), Error> {
        self.added.lock().unwrap().push((*net, path));
        Ok(())
    }

    fn remove_path(&self, net: &Net, path: &Arc<Path>) -> bool {
        self.removed.lock().unwrap().push((*net, path.clone()));
        true
    }
}

#[test]
fn max_paths() {
    let best = ClientOptions::default();
    assert_eq!(best.get_max_paths(4), 1);
    let ecmp = ClientOptions {
        best_only: false,
        ecmp_only: true,
        max_paths: 0,
    };
    assert_eq!(ecmp.get_max_paths(4), 4);
    let multi = ClientOptions {
        best_only: false,
        ecmp_only: false,
        max_paths: 8,
    };
    assert_eq!(multi.get_max_paths(4), 8);
}

#[test]
fn register_once() {
    let m = ClientManager::new();
    let c: Arc<dyn RouteTableClient> = Arc::new(RecordingClient::default());
    assert!(m.register_with_options(c.clone(), ClientOptions::default()));
    assert!(!m.register_with_options(c.clone(), ClientOptions::default()));
    assert_eq!(m.client_count(), 1);
    assert!(m.unregister(&c));
    assert_eq!(m.client_count(), 0);
}
