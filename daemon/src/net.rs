// Copyright (C) 2019-2022 The RustyBGP Authors.
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

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

pub fn create_listen_socket(addr: IpAddr, port: u16) -> std::io::Result<std::net::TcpListener> {
    let addr = SocketAddr::new(addr, port);

    let sock = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        None,
    )?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }

    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(4096)?;

    Ok(sock.into())
}

/// Active open towards `remote`, optionally from a fixed local address.
pub async fn connect(
    remote: SocketAddr,
    local: Option<IpAddr>,
    ttl: Option<u8>,
) -> std::io::Result<TcpStream> {
    let sock = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(addr) = local {
        sock.bind(SocketAddr::new(addr, 0))?;
    }
    let stream = sock.connect(remote).await?;
    if let Some(ttl) = ttl {
        stream.set_ttl(ttl as u32)?;
    }
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub fn set_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(period);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[tokio::test]
async fn listen_and_connect() {
    let listener = create_listen_socket("127.0.0.1".parse().unwrap(), 0).unwrap();
    let addr = listener.local_addr().unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    let (conn, accepted) = tokio::join!(connect(addr, None, Some(1)), listener.accept());
    let conn = conn.unwrap();
    assert_eq!(conn.ttl().unwrap(), 1);
    assert_eq!(accepted.unwrap().1.ip(), conn.local_addr().unwrap().ip());
    set_keepalive(&conn, Duration::from_secs(30)).unwrap();
}
