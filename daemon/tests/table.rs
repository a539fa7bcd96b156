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

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rustyrib::packet::bgp::Net;
use rustyrib::table::{BgpPath, Path, RoutingTable};

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

fn random_net(rng: &mut XorShift) -> Net {
    let r = rng.next();
    // few distinct prefixes so that operations collide
    let len = [0u8, 8, 9, 16, 24, 32][(r % 6) as usize];
    let s = if r & 0x100 == 0 {
        let addr = Ipv4Addr::from(((r >> 16) as u32 & 0x0303_0303) | 0x0a00_0000);
        format!("{}/{}", addr, len)
    } else {
        let seg = ((r >> 16) & 0x3) as u16;
        let addr = Ipv6Addr::new(0x2001, 0xdb8, seg, 0, 0, 0, 0, 0);
        format!("{}/{}", addr, len * 2)
    };
    // host bits are masked by the parser
    s.parse().unwrap()
}

fn random_path(rng: &mut XorShift) -> Arc<Path> {
    let source = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1 + (rng.next() % 3) as u8));
    let mut p = BgpPath::new(source, source);
    p.local_pref = 100 * (1 + (rng.next() % 2) as u32);
    Arc::new(Path::Bgp(p))
}

fn snapshot(t: &RoutingTable) -> BTreeMap<Net, Vec<Arc<Path>>> {
    t.dump()
        .into_iter()
        .map(|r| {
            let mut paths = r.paths().to_vec();
            paths.sort_by_key(|p| format!("{:?}", p));
            (r.net(), paths)
        })
        .collect()
}

#[test]
fn matches_map_model() {
    let table = RoutingTable::new();
    let mut model: BTreeMap<Net, Vec<Arc<Path>>> = BTreeMap::new();
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);

    for _ in 0..5000 {
        let net = random_net(&mut rng);
        let path = random_path(&mut rng);
        if rng.next() % 3 == 0 {
            table.add_path(&net, path.clone()).unwrap();
            model.entry(net).or_default().push(path);
        } else {
            let removed = table.remove_path(&net, &path);
            let mut expected = false;
            if let Some(paths) = model.get_mut(&net) {
                let before = paths.len();
                paths.retain(|p| p != &path);
                expected = before != paths.len();
                if paths.is_empty() {
                    model.remove(&net);
                }
            }
            assert_eq!(removed, expected);
        }
    }
    for paths in model.values_mut() {
        paths.sort_by_key(|p| format!("{:?}", p));
    }
    assert_eq!(snapshot(&table), model);
    assert_eq!(table.route_count(), model.len() as u64);

    for (net, paths) in &model {
        for p in paths {
            table.remove_path(net, p);
        }
    }
    assert_eq!(table.route_count(), 0);
    assert!(table.dump().is_empty());
}
