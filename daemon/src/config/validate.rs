use fnv::FnvHashSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::config::*;
use crate::error::Error;
use crate::table::vrf::RouteDistinguisher;

impl BgpConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let g = &self.global;
        if g.asn == 0 {
            return Err(Error::InvalidConfiguration("zero as number".to_string()));
        }
        if g.router_id.is_empty() {
            return Err(Error::InvalidConfiguration("empty router-id".to_string()));
        }
        let _: Ipv4Addr = g
            .router_id
            .parse()
            .map_err(|_| Error::InvalidConfiguration("can't parse router-id".to_string()))?;
        for addr in &g.listen_addresses {
            let _: IpAddr = addr.parse().map_err(|_| {
                Error::InvalidConfiguration(format!("can't parse listen address {}", addr))
            })?;
        }
        if let Some(id) = &g.cluster_id {
            let _: Ipv4Addr = id
                .parse()
                .map_err(|_| Error::InvalidConfiguration("can't parse cluster-id".to_string()))?;
        }

        let mut vrfs = FnvHashSet::default();
        for v in &self.vrfs {
            if v.name.is_empty() {
                return Err(Error::InvalidConfiguration("empty vrf name".to_string()));
            }
            if !vrfs.insert(v.name.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicated vrf {}",
                    v.name
                )));
            }
            let _: RouteDistinguisher = v.rd.parse().map_err(|_| {
                Error::InvalidConfiguration(format!("can't parse rd {}", v.rd))
            })?;
        }

        let filters: FnvHashSet<&str> = self.filters.iter().map(|f| f.name.as_str()).collect();
        if filters.len() != self.filters.len() {
            return Err(Error::InvalidConfiguration(
                "duplicated filter name".to_string(),
            ));
        }

        let mut peers = FnvHashSet::default();
        for n in &self.neighbors {
            n.validate(&filters, &vrfs)?;
            let addr: IpAddr = n.peer_address.parse().map_err(|_| {
                Error::InvalidConfiguration("can't parse neighbor address".to_string())
            })?;
            if !peers.insert(addr) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicated neighbor {}",
                    addr
                )));
            }
        }

        if let Some(bmp) = &self.bmp_receiver {
            if let Some(addr) = &bmp.listen_address {
                let _: IpAddr = addr.parse().map_err(|_| {
                    Error::InvalidConfiguration("can't parse bmp listen address".to_string())
                })?;
            }
            for r in &bmp.routers {
                let _: IpAddr = r.address.parse().map_err(|_| {
                    Error::InvalidConfiguration(format!("can't parse bmp router {}", r.address))
                })?;
                if let Some(vrf) = &r.vrf {
                    if !vrfs.contains(vrf.as_str()) {
                        return Err(Error::InvalidConfiguration(format!("unknown vrf {}", vrf)));
                    }
                }
            }
        }

        Ok(())
    }
}

impl Neighbor {
    fn validate(&self, filters: &FnvHashSet<&str>, vrfs: &FnvHashSet<&str>) -> Result<(), Error> {
        if self.peer_as == 0 || self.local_as == Some(0) {
            return Err(Error::InvalidConfiguration("zero as number".to_string()));
        }
        if self.peer_address.is_empty() {
            return Err(Error::InvalidConfiguration(
                "empty neighbor address".to_string(),
            ));
        }
        if let Some(addr) = &self.local_address {
            let _: IpAddr = addr.parse().map_err(|_| {
                Error::InvalidConfiguration("can't parse local address".to_string())
            })?;
        }
        if let Some(id) = &self.cluster_id {
            let _: Ipv4Addr = id
                .parse()
                .map_err(|_| Error::InvalidConfiguration("can't parse cluster-id".to_string()))?;
        }
        if self.hold_time != 0 && self.hold_time < 3 {
            return Err(Error::InvalidConfiguration(format!(
                "invalid hold time {}",
                self.hold_time
            )));
        }
        if let Some(vrf) = &self.vrf {
            if !vrfs.contains(vrf.as_str()) {
                return Err(Error::InvalidConfiguration(format!("unknown vrf {}", vrf)));
            }
        }
        for af in self.ipv4.iter().chain(self.ipv6.iter()) {
            for name in af.import_filter.iter().chain(af.export_filter.iter()) {
                if !filters.contains(name.as_str()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "unknown filter {}",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[test]
fn rejects() {
    let base = || BgpConfig {
        global: Global {
            asn: 65000,
            router_id: "10.0.0.1".to_string(),
            ..Default::default()
        },
        neighbors: vec![Neighbor {
            peer_address: "192.0.2.1".to_string(),
            peer_as: 65001,
            ..Default::default()
        }],
        ..Default::default()
    };
    assert!(base().validate().is_ok());

    let mut c = base();
    c.global.asn = 0;
    assert!(c.validate().is_err());

    let mut c = base();
    c.global.router_id = "10.0.0".to_string();
    assert!(c.validate().is_err());

    let mut c = base();
    c.neighbors.push(c.neighbors[0].clone());
    assert!(c.validate().is_err());

    let mut c = base();
    c.neighbors[0].hold_time = 2;
    assert!(c.validate().is_err());

    let mut c = base();
    c.neighbors[0].hold_time = 0;
    assert!(c.validate().is_ok());

    let mut c = base();
    c.neighbors[0].ipv4 = Some(AddressFamily {
        import_filter: vec!["missing".to_string()],
        ..Default::default()
    });
    assert!(c.validate().is_err());

    let mut c = base();
    c.vrfs = vec![
        Vrf {
            name: "blue".to_string(),
            rd: "1:1".to_string(),
        },
        Vrf {
            name: "blue".to_string(),
            rd: "1:2".to_string(),
        },
    ];
    assert!(c.validate().is_err());
}
