//! UDP socket setup. Multicast needs socket options that tokio does not expose, so sockets are
//!  configured with `socket2` and then handed to tokio.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::EngineConfig;

fn new_socket() -> anyhow::Result<Socket> {
    Ok(Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?)
}

fn into_tokio(socket: Socket) -> anyhow::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// A socket receiving a channel's data traffic. For a multicast group this binds the group's
///  port on all interfaces and joins the group on `interface`, otherwise it binds the unicast
///  address itself.
///
/// Address reuse is enabled either way: a reconnecting link binds again while the receive task
///  of its previous connection may still be winding down.
pub fn bind_receiver(addr: SocketAddrV4, interface: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    let socket = new_socket()?;
    socket.set_reuse_address(true)?;

    if addr.ip().is_multicast() {
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port())).into())?;
        socket.join_multicast_v4(addr.ip(), &interface)?;
        debug!("joined multicast group {} on interface {}", addr, interface);
    }
    else {
        socket.bind(&SocketAddr::V4(addr).into())?;
    }

    into_tokio(socket)
}

/// A socket for sending a channel's data traffic to `to`, bound to an ephemeral port on the
///  configured interface
pub fn bind_sender(config: &EngineConfig, to: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    let socket = new_socket()?;
    socket.bind(&SocketAddr::from((config.interface, 0)).into())?;

    if to.ip().is_multicast() {
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(config.loopback)?;
        if !config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface)?;
        }
    }

    into_tokio(socket)
}

pub fn bind_unicast(addr: SocketAddrV4) -> anyhow::Result<UdpSocket> {
    let socket = new_socket()?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    into_tokio(socket)
}
