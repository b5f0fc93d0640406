// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket creation with the configured options applied.
//!
//! Sockets are built synchronously with `socket2`, switched to non-blocking mode and
//! handed to the engine thread, which converts them into tokio sockets. Building them
//! before the thread starts keeps `start()` failures free of partial state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket, Type};
use tracing::trace;

use crate::service::{MulticastConfig, NetworkConfig};
use crate::AppError::{DetailedIoError, InvalidAddress};
use crate::AppResult;

const LISTEN_BACKLOG: i32 = 1024;

/// Resolves `host:port`, preferring an IPv4 address when the name has several.
pub fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| InvalidAddress(format!("{}:{}: {}", host, port, e)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| InvalidAddress(format!("{}:{} resolved to nothing", host, port)))
}

pub fn parse_ipv4(value: &str) -> AppResult<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| InvalidAddress(format!("{} is not an IPv4 address", value)))
}

fn new_socket(addr: &SocketAddr, ty: Type, protocol: IpProtocol) -> AppResult<Socket> {
    Ok(Socket::new(Domain::for_address(*addr), ty, Some(protocol))?)
}

fn apply_common(socket: &Socket, config: &NetworkConfig) -> AppResult<()> {
    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if let Some(ttl) = config.ttl {
        socket.set_ttl(ttl)?;
    }
    Ok(())
}

fn bind(socket: &Socket, addr: SocketAddr) -> AppResult<()> {
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| DetailedIoError(format!("cannot bind {}: {}", addr, e)))
}

pub fn tcp_listener(addr: SocketAddr, config: &NetworkConfig) -> AppResult<std::net::TcpListener> {
    let socket = new_socket(&addr, Type::STREAM, IpProtocol::TCP)?;
    apply_common(&socket, config)?;
    bind(&socket, addr)?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    trace!("tcp listener bound to {}", addr);
    Ok(socket.into())
}

/// Connects within the configured timeout.
pub fn tcp_connect(addr: SocketAddr, config: &NetworkConfig) -> AppResult<std::net::TcpStream> {
    let socket = new_socket(&addr, Type::STREAM, IpProtocol::TCP)?;
    if let Some(ttl) = config.ttl {
        socket.set_ttl(ttl)?;
    }
    socket.set_keepalive(config.keep_alive)?;
    socket.set_nodelay(true)?;
    let target = SockAddr::from(addr);
    match config.timeout_ms {
        0 => socket.connect(&target)?,
        ms => socket.connect_timeout(&target, std::time::Duration::from_millis(ms))?,
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Prepares an accepted stream the same way a connected one is prepared.
pub fn tune_accepted(stream: &tokio::net::TcpStream, config: &NetworkConfig) -> AppResult<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_keepalive(config.keep_alive)?;
    socket.set_nodelay(true)?;
    Ok(())
}

pub fn udp_bind(addr: SocketAddr, config: &NetworkConfig) -> AppResult<std::net::UdpSocket> {
    let socket = new_socket(&addr, Type::DGRAM, IpProtocol::UDP)?;
    apply_common(&socket, config)?;
    bind(&socket, addr)?;
    socket.set_nonblocking(true)?;
    trace!("udp socket bound to {}", addr);
    Ok(socket.into())
}

/// A UDP socket for a client talking to `remote`, bound to an ephemeral local port.
pub fn udp_client(remote: SocketAddr, config: &NetworkConfig) -> AppResult<std::net::UdpSocket> {
    let local = match remote.ip() {
        IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    };
    udp_bind(local, config)
}

/// Binds the group port and joins `group` on the configured interface.
pub fn multicast_receiver(
    group: Ipv4Addr,
    port: u16,
    network: &NetworkConfig,
    multicast: &MulticastConfig,
) -> AppResult<std::net::UdpSocket> {
    let interface = parse_ipv4(&multicast.interface)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = new_socket(&bind_addr, Type::DGRAM, IpProtocol::UDP)?;
    // several receivers on one host share the group port
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(bind_addr))?;
    socket.join_multicast_v4(&group, &interface)?;
    socket.set_multicast_loop_v4(multicast.loopback)?;
    if let Some(ttl) = network.ttl {
        socket.set_multicast_ttl_v4(ttl)?;
    }
    socket.set_nonblocking(true)?;
    trace!("joined multicast group {} on {}", group, interface);
    Ok(socket.into())
}

/// A blocking socket for sending to a multicast group.
pub fn multicast_sender(
    network: &NetworkConfig,
    multicast: &MulticastConfig,
) -> AppResult<std::net::UdpSocket> {
    let interface = parse_ipv4(&multicast.interface)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    let socket = new_socket(&bind_addr, Type::DGRAM, IpProtocol::UDP)?;
    if network.reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.set_multicast_ttl_v4(network.ttl.unwrap_or(1))?;
    socket.set_multicast_loop_v4(multicast.loopback)?;
    socket.set_broadcast(multicast.broadcast)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    if network.timeout_ms > 0 {
        socket.set_write_timeout(Some(std::time::Duration::from_millis(network.timeout_ms)))?;
    }
    socket.bind(&SockAddr::from(bind_addr))?;
    Ok(socket.into())
}
