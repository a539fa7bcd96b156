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

pub(crate) mod validate;

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

pub const DEFAULT_LISTEN_PORT: u16 = 179;
pub const DEFAULT_HOLD_TIME: u16 = 90;
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 30;
pub const DEFAULT_BMP_PORT: u16 = 11019;

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct BgpConfig {
    pub global: Global,
    pub neighbors: Vec<Neighbor>,
    pub bmp_receiver: Option<BmpReceiver>,
    pub vrfs: Vec<Vrf>,
    pub filters: Vec<FilterConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Global {
    #[serde(rename = "as")]
    pub asn: u32,
    pub router_id: String,
    pub listen_port: u16,
    pub listen_addresses: Vec<String>,
    pub cluster_id: Option<String>,
}

impl Default for Global {
    fn default() -> Self {
        Global {
            asn: 0,
            router_id: String::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            listen_addresses: Vec::new(),
            cluster_id: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Neighbor {
    pub peer_address: String,
    pub local_address: Option<String>,
    pub peer_as: u32,
    pub local_as: Option<u32>,
    pub hold_time: u16,
    pub reconnect_interval: u64,
    pub passive: bool,
    pub disabled: bool,
    pub route_server_client: bool,
    pub route_reflector_client: bool,
    pub cluster_id: Option<String>,
    pub advertise_ipv4_multiprotocol: bool,
    pub graceful_restart: bool,
    pub ttl: Option<u8>,
    pub description: String,
    pub vrf: Option<String>,
    pub ipv4: Option<AddressFamily>,
    pub ipv6: Option<AddressFamily>,
}

impl Default for Neighbor {
    fn default() -> Self {
        Neighbor {
            peer_address: String::new(),
            local_address: None,
            peer_as: 0,
            local_as: None,
            hold_time: DEFAULT_HOLD_TIME,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            passive: false,
            disabled: false,
            route_server_client: false,
            route_reflector_client: false,
            cluster_id: None,
            advertise_ipv4_multiprotocol: false,
            graceful_restart: false,
            ttl: None,
            description: String::new(),
            vrf: None,
            ipv4: None,
            ipv6: None,
        }
    }
}

impl Neighbor {
    /// Configured families. IPv4 unicast when none is given.
    pub fn address_families(&self) -> Vec<(crate::packet::bgp::Family, AddressFamily)> {
        use crate::packet::bgp::Family;
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return vec![(Family::IPV4, AddressFamily::default())];
        }
        let mut v = Vec::new();
        if let Some(af) = &self.ipv4 {
            v.push((Family::IPV4, af.clone()));
        }
        if let Some(af) = &self.ipv6 {
            v.push((Family::IPV6, af.clone()));
        }
        v
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AddressFamily {
    pub add_path_recv: bool,
    pub add_path_send: AddPathSend,
    pub import_filter: Vec<String>,
    pub export_filter: Vec<String>,
    pub prefix_limit: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AddPathSend {
    pub best_only: bool,
    pub multiple: bool,
    pub max_paths: usize,
}

impl Default for AddPathSend {
    fn default() -> Self {
        AddPathSend {
            best_only: true,
            multiple: false,
            max_paths: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct BmpReceiver {
    pub listen_address: Option<String>,
    pub accept_any: bool,
    pub keepalive_period: Option<u64>,
    pub routers: Vec<BmpRouter>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct BmpRouter {
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub passive: bool,
    pub vrf: Option<String>,
    pub ignore_peer_asns: Vec<u32>,
    pub ignore_pre_policy: bool,
    pub ignore_post_policy: bool,
}

impl Default for BmpRouter {
    fn default() -> Self {
        BmpRouter {
            name: None,
            address: String::new(),
            port: DEFAULT_BMP_PORT,
            passive: true,
            vrf: None,
            ignore_peer_asns: Vec::new(),
            ignore_pre_policy: false,
            ignore_post_policy: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Vrf {
    pub name: String,
    pub rd: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FilterConfig {
    pub name: String,
    pub terms: Vec<TermConfig>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct TermConfig {
    pub name: String,
    pub from: Vec<ConditionConfig>,
    pub then: ActionConfig,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConditionConfig {
    pub prefix_list: Vec<String>,
    pub route_filters: Vec<RouteFilterConfig>,
    pub communities: Vec<String>,
    pub large_communities: Vec<String>,
    pub as_path: Vec<String>,
    pub neighbors: Vec<String>,
}

/// `matcher` is one of exact, orlonger, longer or inrange.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RouteFilterConfig {
    pub prefix: String,
    pub matcher: String,
    pub begin: Option<u8>,
    pub end: Option<u8>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ActionConfig {
    pub add_communities: Vec<String>,
    pub add_large_communities: Vec<String>,
    pub as_path_prepend: Option<PrependConfig>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    pub next_hop: Option<String>,
    pub disposition: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PrependConfig {
    pub asn: u32,
    pub times: usize,
}

impl BgpConfig {
    pub fn from_toml(s: &str) -> Result<BgpConfig, Error> {
        toml::from_str(s).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }
}

pub fn read_from_file<P: AsRef<Path>>(fname: P) -> Result<BgpConfig, Error> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let conf = BgpConfig::from_toml(&contents)?;
    conf.validate()?;
    Ok(conf)
}

#[test]
fn parse() {
    let conf = BgpConfig::from_toml(
        r#"
[global]
as = 65000
router-id = "10.0.0.1"

[[neighbors]]
peer-address = "192.0.2.1"
peer-as = 65001
hold-time = 30

[neighbors.ipv6]
add-path-recv = true
import-filter = ["no-default"]

[neighbors.ipv6.add-path-send]
best-only = false
max-paths = 4

[bmp-receiver]
accept-any = true

[[bmp-receiver.routers]]
address = "198.51.100.1"
ignore-peer-asns = [65100]

[[vrfs]]
name = "blue"
rd = "65000:1"

[[filters]]
name = "no-default"

[[filters.terms]]
name = "default"
then = { disposition = "reject" }

[[filters.terms.from]]
prefix-list = ["0.0.0.0/0"]
"#,
    )
    .unwrap();
    assert_eq!(conf.global.asn, 65000);
    assert_eq!(conf.global.listen_port, DEFAULT_LISTEN_PORT);
    let n = &conf.neighbors[0];
    assert_eq!(n.hold_time, 30);
    assert_eq!(n.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
    assert!(n.ipv4.is_none());
    let af = n.ipv6.as_ref().unwrap();
    assert!(af.add_path_recv);
    assert!(!af.add_path_send.best_only);
    assert_eq!(af.add_path_send.max_paths, 4);
    assert_eq!(n.address_families().len(), 1);
    let bmp = conf.bmp_receiver.as_ref().unwrap();
    assert!(bmp.accept_any);
    assert_eq!(bmp.routers[0].port, DEFAULT_BMP_PORT);
    assert_eq!(bmp.routers[0].ignore_peer_asns, vec![65100]);
    assert_eq!(conf.vrfs[0].rd, "65000:1");
    let t = &conf.filters[0].terms[0];
    assert_eq!(t.then.disposition.as_deref(), Some("reject"));
    assert_eq!(t.from[0].prefix_list, vec!["0.0.0.0/0".to_string()]);
    conf.validate().unwrap();
}
