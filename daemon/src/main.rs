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

use clap::{App, Arg};
use log::{error, info};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rustyrib::bmp::BmpReceiver;
use rustyrib::config::{self, BgpConfig};
use rustyrib::error::Error;
use rustyrib::net;
use rustyrib::peer::{build_filters, PeerConfig, PeerManager};
use rustyrib::table::vrf::{RouteDistinguisher, DEFAULT_VRF};
use rustyrib::table::VrfRegistry;

fn load_config(args: &clap::ArgMatches) -> Result<BgpConfig, Error> {
    let mut conf = match args.value_of("config") {
        Some(path) => BgpConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => BgpConfig::default(),
    };
    if let Some(asn) = args.value_of("asn") {
        conf.global.asn = asn
            .parse()
            .map_err(|_| Error::InvalidConfiguration(format!("can't parse as {}", asn)))?;
    }
    if let Some(id) = args.value_of("id") {
        conf.global.router_id = id.to_string();
    }
    if args.is_present("any") {
        conf.bmp_receiver.get_or_insert_with(Default::default).accept_any = true;
    }
    conf.validate()?;
    Ok(conf)
}

fn listeners(conf: &BgpConfig) -> Result<Vec<tokio::net::TcpListener>, Error> {
    let addrs: Vec<IpAddr> = if conf.global.listen_addresses.is_empty() {
        vec![
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        ]
    } else {
        conf.global
            .listen_addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect()
    };
    addrs
        .into_iter()
        .map(|addr| {
            let l = net::create_listen_socket(addr, conf.global.listen_port)?;
            Ok(tokio::net::TcpListener::from_std(l)?)
        })
        .collect()
}

async fn serve(conf: BgpConfig) -> Result<(), Error> {
    let vrfs = Arc::new(VrfRegistry::new());
    for v in &conf.vrfs {
        let rd: RouteDistinguisher = v.rd.parse()?;
        vrfs.create_vrf(&v.name, rd)?;
    }
    vrfs.create_vrf_if_not_exists(DEFAULT_VRF, RouteDistinguisher::default());

    let filters = build_filters(&conf.filters)?;
    let peers = Arc::new(PeerManager::new());
    for n in &conf.neighbors {
        let c = PeerConfig::from_config(&conf.global, n, &filters, &vrfs)?;
        peers.add_peer(c, !n.disabled)?;
    }

    if let Some(b) = &conf.bmp_receiver {
        let receiver = BmpReceiver::from_config(b, &vrfs)?;
        let addr: IpAddr = match &b.listen_address {
            Some(a) => a
                .parse()
                .map_err(|_| Error::InvalidConfiguration(format!("can't parse {}", a)))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let l = net::create_listen_socket(addr, config::DEFAULT_BMP_PORT)?;
        info!("bmp receiver listening on {}:{}", addr, config::DEFAULT_BMP_PORT);
        tokio::spawn(receiver.serve(tokio::net::TcpListener::from_std(l)?));
    }

    let listeners = listeners(&conf)?;
    info!(
        "as {} router-id {} listening on port {}",
        conf.global.asn, conf.global.router_id, conf.global.listen_port
    );
    peers.serve(listeners).await;
    Ok(())
}

fn main() {
    let args = App::new("rustyribd")
        .arg(
            Arg::with_name("config")
                .short("f")
                .long("config-file")
                .takes_value(true)
                .help("specifies a config file"),
        )
        .arg(
            Arg::with_name("asn")
                .long("as")
                .takes_value(true)
                .help("specifies as number"),
        )
        .arg(
            Arg::with_name("id")
                .long("router-id")
                .takes_value(true)
                .help("specifies router id"),
        )
        .arg(
            Arg::with_name("any")
                .long("any")
                .help("accepts any bmp router"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("increases log verbosity"),
        )
        .get_matches();

    let level = match args.occurrences_of("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let conf = match load_config(&args) {
        Ok(conf) => conf,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(serve(conf)) {
        error!("{}", e);
        std::process::exit(1);
    }
}
