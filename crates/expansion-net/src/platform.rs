//! Socket options for game connections.
//!
//! [`SocketConfig`] carries the options applied to every stream and listener:
//! `TCP_NODELAY` so single moves are not held back by Nagle, TCP keepalive so a
//! silently vanished peer is eventually noticed, and `SO_REUSEADDR` so a host
//! can re-listen on its port right after a lost connection.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every game connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 30s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Unanswered probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Set `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Pending-connection queue length. Only one peer plays. Default: 1.
    pub listen_backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            listen_backlog: 1,
        }
    }
}

/// Apply `config` to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a listener on `addr` with the configured options.
///
/// Errors come straight from the OS so callers can tell "address in use" from
/// "address not available".
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog.max(1))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
