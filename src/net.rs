//! Socket helpers: address parsing and listener creation.
//!
//! Listeners are built with socket2 so address reuse and dual-stack behaviour
//! are set before binding.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpListener;
use tracing::debug;

const LISTEN_BACKLOG: i32 = 1024;

/// Expand a Go-style `":port"` address to listen on all IPv4 interfaces
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Resolve a listen or dial address to a single socket address
pub async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    let addr = normalize_addr(addr);
    tokio::net::lookup_host(&addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {}", addr)))
}

/// Bind a TCP listener on `addr`
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Unspecified v6 binds accept v4-mapped clients too
        socket.set_only_v6(!addr.ip().is_unspecified())?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Bind an OS-assigned port for a sub-test data channel.
///
/// Prefers a dual-stack socket and falls back to IPv4 on hosts without IPv6.
pub fn bind_ephemeral() -> io::Result<TcpListener> {
    let dual = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
    match bind_tcp_listener(dual) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!("Dual-stack bind failed ({}), using IPv4", e);
            bind_tcp_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        }
    }
}
