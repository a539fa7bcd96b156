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

use fnv::FnvHashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::packet::bgp::Family;
use crate::table::loc_rib::LocRib;

pub const IPV4_UNICAST_RIB: &str = "inet.0";
pub const IPV6_UNICAST_RIB: &str = "inet6.0";
pub const DEFAULT_VRF: &str = "master";

/// Route distinguisher, written as `asn:id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RouteDistinguisher(pub u64);

impl RouteDistinguisher {
    pub fn new(asn: u32, id: u32) -> Self {
        RouteDistinguisher((asn as u64) << 32 | id as u64)
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl FromStr for RouteDistinguisher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.splitn(2, ':');
        let (asn, id) = match (iter.next(), iter.next()) {
            (Some(a), Some(i)) => (a, i),
            _ => return Err(Error::InvalidArgument(format!("invalid rd {}", s))),
        };
        match (asn.parse::<u32>(), id.parse::<u32>()) {
            (Ok(a), Ok(i)) => Ok(RouteDistinguisher::new(a, i)),
            _ => Err(Error::InvalidArgument(format!("invalid rd {}", s))),
        }
    }
}

/// A routing table namespace with its own set of Loc-RIBs.
pub struct Vrf {
    name: String,
    rd: RouteDistinguisher,
    ribs: RwLock<FnvHashMap<String, Arc<LocRib>>>,
}

impl Vrf {
    fn new(name: &str, rd: RouteDistinguisher) -> Self {
        let vrf = Vrf {
            name: name.to_string(),
            rd,
            ribs: RwLock::new(FnvHashMap::default()),
        };
        {
            let mut ribs = vrf.ribs.write().unwrap();
            for n in &[IPV4_UNICAST_RIB, IPV6_UNICAST_RIB] {
                ribs.insert(n.to_string(), Arc::new(LocRib::new(n)));
            }
        }
        vrf
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rd(&self) -> RouteDistinguisher {
        self.rd
    }

    pub fn create_loc_rib(&self, name: &str) -> Result<Arc<LocRib>, Error> {
        let mut ribs = self.ribs.write().unwrap();
        if ribs.contains_key(name) {
            return Err(Error::AlreadyExists(format!(
                "rib {} in vrf {}",
                name, self.name
            )));
        }
        let rib = Arc::new(LocRib::new(name));
        ribs.insert(name.to_string(), rib.clone());
        Ok(rib)
    }

    pub fn rib_by_name(&self, name: &str) -> Option<Arc<LocRib>> {
        self.ribs.read().unwrap().get(name).cloned()
    }

    pub fn rib_by_family(&self, family: Family) -> Option<Arc<LocRib>> {
        match family {
            Family::IPV4 => self.rib_by_name(IPV4_UNICAST_RIB),
            Family::IPV6 => self.rib_by_name(IPV6_UNICAST_RIB),
            _ => None,
        }
    }

    pub fn ipv4_unicast_rib(&self) -> Arc<LocRib> {
        self.rib_or_create(IPV4_UNICAST_RIB)
    }

    pub fn ipv6_unicast_rib(&self) -> Arc<LocRib> {
        self.rib_or_create(IPV6_UNICAST_RIB)
    }

    fn rib_or_create(&self, name: &str) -> Arc<LocRib> {
        self.ribs
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LocRib::new(name)))
            .clone()
    }

    pub fn rib_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.ribs.read().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

/// Every VRF of one speaker, unique by name.
#[derive(Default)]
pub struct VrfRegistry {
    vrfs: RwLock<FnvHashMap<String, Arc<Vrf>>>,
}

impl VrfRegistry {
    pub fn new() -> Self {
        VrfRegistry::default()
    }

    pub fn create_vrf(&self, name: &str, rd: RouteDistinguisher) -> Result<Arc<Vrf>, Error> {
        let mut vrfs = self.vrfs.write().unwrap();
        if vrfs.contains_key(name) {
            return Err(Error::AlreadyExists(format!("vrf {}", name)));
        }
        let vrf = Arc::new(Vrf::new(name, rd));
        vrfs.insert(name.to_string(), vrf.clone());
        Ok(vrf)
    }

    pub fn create_vrf_if_not_exists(&self, name: &str, rd: RouteDistinguisher) -> Arc<Vrf> {
        self.vrfs
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Vrf::new(name, rd)))
            .clone()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Vrf>> {
        self.vrfs.read().unwrap().get(name).cloned()
    }

    pub fn get_by_rd(&self, rd: RouteDistinguisher) -> Option<Arc<Vrf>> {
        self.vrfs
            .read()
            .unwrap()
            .values()
            .find(|v| v.rd == rd)
            .cloned()
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Vrf>> {
        self.vrfs.write().unwrap().remove(name)
    }

    pub fn list(&self) -> Vec<Arc<Vrf>> {
        let mut v: Vec<Arc<Vrf>> = self.vrfs.read().unwrap().values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn dispose_all(&self) {
        self.vrfs.write().unwrap().clear();
    }
}

#[test]
fn rd_format() {
    let rd: RouteDistinguisher = "65000:100".parse().unwrap();
    assert_eq!(rd, RouteDistinguisher::new(65000, 100));
    assert_eq!(rd.to_string(), "65000:100");
    assert!("65000".parse::<RouteDistinguisher>().is_err());
    assert!("a:1".parse::<RouteDistinguisher>().is_err());
}

#[test]
fn registry() {
    let reg = VrfRegistry::new();
    let master = reg
        .create_vrf("master", RouteDistinguisher::default())
        .unwrap();
    assert!(matches!(
        reg.create_vrf("master", RouteDistinguisher::new(1, 1)),
        Err(Error::AlreadyExists(_))
    ));
    assert!(Arc::ptr_eq(
        &reg.create_vrf_if_not_exists("master", RouteDistinguisher::new(1, 1)),
        &master
    ));
    reg.create_vrf("blue", RouteDistinguisher::new(65000, 7))
        .unwrap();
    assert_eq!(
        reg.get_by_rd(RouteDistinguisher::new(65000, 7))
            .unwrap()
            .name(),
        "blue"
    );
    assert_eq!(
        reg.list().iter().map(|v| v.name()).collect::<Vec<_>>(),
        vec!["blue", "master"]
    );
    assert!(reg.unregister("blue").is_some());
    assert!(reg.get_by_name("blue").is_none());
    reg.dispose_all();
    assert!(reg.list().is_empty());
}

#[test]
fn vrf_ribs() {
    let vrf = Vrf::new("master", RouteDistinguisher::default());
    assert_eq!(vrf.ipv4_unicast_rib().name(), IPV4_UNICAST_RIB);
    assert!(vrf.rib_by_family(Family::IPV6).is_some());
    assert!(matches!(
        vrf.create_loc_rib(IPV4_UNICAST_RIB),
        Err(Error::AlreadyExists(_))
    ));
    vrf.create_loc_rib("mpls.0").unwrap();
    assert_eq!(vrf.rib_names(), vec!["inet.0", "inet6.0", "mpls.0"]);
}
