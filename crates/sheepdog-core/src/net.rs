//! Blocking TCP/Unix socket setup for sheepdog.
//!
//! Listeners are created per address family with `SO_REUSEADDR` (and
//! `IPV6_V6ONLY` for IPv6) and handed to a caller-supplied registration
//! callback. Outbound sockets abort on close (`SO_LINGER {1, 0}`), carry
//! send and receive timeouts so blocking I/O eventually fails with
//! `EAGAIN`, and enable `TCP_NODELAY` and keepalive.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, UnixAddr,
};
use nix::sys::time::{TimeVal, TimeValLike};
use sheepdog_proto::defaults::{
    KEEPALIVE_COUNT, KEEPALIVE_IDLE_SECS, KEEPALIVE_INTERVAL_SECS, MAX_POLLTIME, POLL_TIMEOUT,
};
use sheepdog_proto::{CanonicalAddr, SdError, SdResult};
use tracing::{debug, error, info, warn};

/// Resolve `(host, port)` into stream endpoints.
///
/// With no host the wildcard addresses of both families are returned,
/// IPv6 first.
fn resolve(host: Option<&str>, port: u16) -> SdResult<Vec<SocketAddr>> {
    match host {
        None => Ok(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ]),
        Some(h) => (h, port)
            .to_socket_addrs()
            .map(|it| it.collect())
            .map_err(|e| {
                error!("failed to get address info for {}: {}", h, e);
                SdError::SystemError
            }),
    }
}

fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn listen_one(addr: SocketAddr) -> nix::Result<TcpListener> {
    let fd = socket::socket(family_of(&addr), SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;

    if let Err(e) = socket::setsockopt(&fd, sockopt::ReuseAddr, &true) {
        error!("failed to set SO_REUSEADDR: {}", e);
    }
    if addr.is_ipv6() {
        socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true)?;
    }

    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(|e| {
        error!("failed to bind server socket {}: {}", addr, e);
        e
    })?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(|e| {
        error!("failed to listen on server socket {}: {}", addr, e);
        e
    })?;

    Ok(TcpListener::from(fd))
}

/// Create one listening socket per resolved address family.
///
/// Each listener is passed to `on_listener`, which registers it with the
/// event loop; a listener whose registration fails is closed. Failure on
/// one family does not abort the others. Returns the number of listeners
/// registered, or `SystemError` when none were.
pub fn create_listen_ports<F>(bind_addr: Option<&str>, port: u16, mut on_listener: F) -> SdResult<usize>
where
    F: FnMut(TcpListener) -> SdResult<()>,
{
    let mut success = 0;

    for addr in resolve(bind_addr, port)? {
        let listener = match listen_one(addr) {
            Ok(l) => l,
            Err(_) => continue,
        };
        match on_listener(listener) {
            Ok(()) => {
                debug!("listening on {}", addr);
                success += 1;
            }
            Err(e) => warn!("failed to register listener {}: {}", addr, e),
        }
    }

    if success == 0 {
        error!("failed to create a listening port");
        return Err(SdError::SystemError);
    }
    Ok(success)
}

/// Create a listening UNIX-domain socket at `path` for the local control
/// surface and pass it to `on_listener`.
pub fn create_unix_listener<F>(path: &Path, on_listener: F) -> SdResult<()>
where
    F: FnOnce(UnixListener) -> SdResult<()>,
{
    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(|e| {
            error!("failed to create socket, {}", e);
            SdError::SystemError
        })?;
    let addr = UnixAddr::new(path).map_err(|_| SdError::InvalidParms)?;

    socket::bind(fd.as_raw_fd(), &addr).map_err(|e| {
        error!("failed to bind socket {}: {}", path.display(), e);
        SdError::SystemError
    })?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(|e| {
        error!("failed to listen on socket {}: {}", path.display(), e);
        SdError::SystemError
    })?;

    on_listener(UnixListener::from(fd))
}

/// Connect to a remote sheepdog node by host name and port.
///
/// Walks every resolved address and returns the first socket that
/// connects. A connect interrupted by a signal is retried on the same
/// socket.
pub fn connect_to(name: &str, port: u16) -> SdResult<TcpStream> {
    'addrs: for addr in resolve(Some(name), port)? {
        let fd = match socket::socket(family_of(&addr), SockType::Stream, SockFlag::SOCK_CLOEXEC, None) {
            Ok(fd) => fd,
            Err(_) => continue,
        };

        let linger = libc::linger { l_onoff: 1, l_linger: 0 };
        if let Err(e) = socket::setsockopt(&fd, sockopt::Linger, &linger) {
            error!("failed to set SO_LINGER: {}", e);
            continue;
        }
        if let Err(e) = set_snd_timeout(&fd) {
            error!("failed to set send timeout: {}", e);
            break;
        }
        if let Err(e) = set_rcv_timeout(&fd) {
            error!("failed to set recv timeout: {}", e);
            break;
        }

        let target = SockaddrStorage::from(addr);
        loop {
            match socket::connect(fd.as_raw_fd(), &target) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("failed to connect to {}:{}: {}", name, port, e);
                    continue 'addrs;
                }
            }
        }

        if let Err(e) = set_nodelay(&fd).and_then(|_| set_keepalive(&fd)) {
            error!("failed to tune socket for {}: {}", addr, e);
            break;
        }

        debug!("{}, {}:{}", fd.as_raw_fd(), name, port);
        return Ok(TcpStream::from(fd));
    }

    Err(SdError::NetworkError)
}

/// Connect to a local UNIX-domain control socket with the same timeouts
/// as peer sockets.
pub fn connect_unix(path: &Path) -> SdResult<UnixStream> {
    let stream = UnixStream::connect(path).map_err(|e| {
        error!("failed to connect to {}: {}", path.display(), e);
        SdError::NetworkError
    })?;
    stream
        .set_write_timeout(Some(Duration::from_secs(POLL_TIMEOUT)))
        .and_then(|_| stream.set_read_timeout(Some(Duration::from_secs(MAX_POLLTIME))))
        .map_err(|_| SdError::NetworkError)?;
    Ok(stream)
}

/// Set the send timeout to [`POLL_TIMEOUT`] seconds.
pub fn set_snd_timeout<F: AsFd>(fd: &F) -> nix::Result<()> {
    socket::setsockopt(fd, sockopt::SendTimeout, &TimeVal::seconds(POLL_TIMEOUT as i64))
}

/// Set the receive timeout to [`MAX_POLLTIME`] seconds; reads wait longer
/// than writes because the target node may be busy doing I/O.
pub fn set_rcv_timeout<F: AsFd>(fd: &F) -> nix::Result<()> {
    socket::setsockopt(fd, sockopt::ReceiveTimeout, &TimeVal::seconds(MAX_POLLTIME as i64))
}

pub fn set_nodelay<F: AsFd>(fd: &F) -> nix::Result<()> {
    socket::setsockopt(fd, sockopt::TcpNoDelay, &true)
}

/// Enable keepalive probing: first probe after 5s idle, then every 1s, the
/// peer is declared dead after 3 misses.
pub fn set_keepalive<F: AsFd>(fd: &F) -> nix::Result<()> {
    socket::setsockopt(fd, sockopt::KeepAlive, &true)?;
    socket::setsockopt(fd, sockopt::TcpKeepIdle, &KEEPALIVE_IDLE_SECS)?;
    socket::setsockopt(fd, sockopt::TcpKeepInterval, &KEEPALIVE_INTERVAL_SECS)?;
    socket::setsockopt(fd, sockopt::TcpKeepCount, &KEEPALIVE_COUNT)
}

/// Find the address of the first non-loopback interface.
pub fn get_local_addr() -> SdResult<CanonicalAddr> {
    let addrs = getifaddrs().map_err(|e| {
        error!("getifaddrs failed: {}", e);
        SdError::SystemError
    })?;

    for ifa in addrs {
        if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(addr) = ifa.address else { continue };

        if let Some(sin) = addr.as_sockaddr_in() {
            info!("found IPv4 address on {}", ifa.interface_name);
            return Ok(CanonicalAddr::from(*SocketAddrV4::from(*sin).ip()));
        }
        if let Some(sin6) = addr.as_sockaddr_in6() {
            info!("found IPv6 address on {}", ifa.interface_name);
            return Ok(CanonicalAddr::from(*SocketAddrV6::from(*sin6).ip()));
        }
    }

    error!("no valid interface found");
    Err(SdError::SystemError)
}
