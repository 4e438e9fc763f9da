//! Listener sockets and the accept path.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::commands::Command;
use crate::config::Config;
use crate::driver::Networking;
use crate::error::Error;
use crate::metrics;

/// Create, bind, and listen the TCP listener socket.
pub(crate) fn setup_tcp_listener(config: &Config) -> Result<RawFd, Error> {
    let addr = SocketAddr::new(config.bind_addr, config.tcp_port);
    let fd = bind_socket(addr, libc::SOCK_STREAM)?;

    if unsafe { libc::listen(fd, config.backlog) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::ListenerSetup(format!(
            "failed to listen on TCP socket: {err}"
        )));
    }
    Ok(fd)
}

/// Create and bind the reserved UDP socket. No datagram handling is wired
/// up; the endpoint exists so the port is claimed.
pub(crate) fn setup_udp_listener(config: &Config) -> Result<RawFd, Error> {
    let addr = SocketAddr::new(config.bind_addr, config.udp_port);
    bind_socket(addr, libc::SOCK_DGRAM)
}

/// socket + SO_REUSEADDR + bind, non-blocking and close-on-exec.
fn bind_socket(addr: SocketAddr, sock_type: libc::c_int) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            sock_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::ListenerSetup(format!(
            "failed to create socket: {}",
            io::Error::last_os_error()
        )));
    }

    let optval: libc::c_int = 1;
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } != 0
    {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::ListenerSetup(format!(
            "failed to set SO_REUSEADDR: {err}"
        )));
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::ListenerSetup(format!("failed to bind {addr}: {err}")));
    }

    Ok(fd)
}

/// Read back the port a socket actually bound (for `port: 0` configs).
pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    } < 0
    {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage)
        .map(|addr| addr.port())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

/// The TCP listener fired: accept one client, configure its socket, publish
/// its connection record, and schedule its read watcher through the async
/// queue. The caller re-arms the listener itself.
pub(crate) fn handle_new_client(net: &Networking) {
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let client_fd = unsafe {
        libc::accept4(
            net.tcp_fd,
            &mut addr_storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if client_fd < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Another leader raced us to this client.
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                log::error!("failed to accept connection, descriptor limit reached: {err}");
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => log::error!("failed to accept connection: {err}"),
        }
        return;
    }

    set_client_sockopts(client_fd);

    if let Some(peer) = sockaddr_to_socket_addr(&addr_storage) {
        log::debug!("accepted client connection {peer} [{client_fd}]");
    }

    let conn = net.conns.get_or_create(client_fd);
    conn.input.lock().reset();
    {
        let mut out = conn.output.lock();
        out.ring.reset();
        out.buffered = false;
    }
    conn.schedulable.store(true, Ordering::Release);

    metrics::CONNECTIONS_ACCEPTED.increment();
    metrics::CONNECTIONS_ACTIVE.increment();

    net.schedule_async(Command::Schedule(conn.read_watcher()));
}

/// TCP_NODELAY so small responses go out immediately, SO_KEEPALIVE to reap
/// silently dead peers. Failures are warnings, not fatal.
fn set_client_sockopts(fd: RawFd) {
    let optval: libc::c_int = 1;
    let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            optlen,
        )
    } != 0
    {
        log::warn!(
            "failed to set TCP_NODELAY on connection [{fd}]: {}",
            io::Error::last_os_error()
        );
    }
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            optlen,
        )
    } != 0
    {
        log::warn!(
            "failed to set SO_KEEPALIVE on connection [{fd}]: {}",
            io::Error::last_os_error()
        );
    }
}

/// Fill a `sockaddr_storage` from a Rust `SocketAddr`.
fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` (from accept4/getsockname) to a Rust
/// `SocketAddr`.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}
