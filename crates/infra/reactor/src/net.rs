//! Socket creation, binding, multicast, and address helpers
//!
//! All sockets come up non-blocking and close-on-exec. Multicast join and
//! leave never close the caller's FD; membership failures propagate as
//! plain errors. [`resolve_host`] is the one deliberately blocking call in
//! the crate and belongs in initialization paths only.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::RawFd;

fn sys_result(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Create a non-blocking TCP socket.
pub fn tcp_socket() -> io::Result<RawFd> {
    // SAFETY: plain socket(2) call.
    sys_result(unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
}

/// Create a non-blocking UDP socket.
pub fn udp_socket() -> io::Result<RawFd> {
    // SAFETY: plain socket(2) call.
    sys_result(unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
}

/// Create a non-blocking Unix-domain stream socket.
pub fn unix_socket() -> io::Result<RawFd> {
    // SAFETY: plain socket(2) call.
    sys_result(unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
}

fn sockaddr_in_of(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain-old-data; zeroed is a valid value.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sa
}

/// Bind an IPv4 socket; `SO_REUSEADDR` is set first.
pub fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: option value points at a c_int.
    sys_result(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    let sa = sockaddr_in_of(addr);
    // SAFETY: sa is a valid sockaddr_in of the stated length.
    sys_result(unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(sa).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Start a non-blocking connect. Returns true if the connection completed
/// immediately (loopback), false if it is in progress (`EINPROGRESS`).
pub fn start_connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<bool> {
    let sa = sockaddr_in_of(addr);
    // SAFETY: sa is a valid sockaddr_in of the stated length.
    let rc = unsafe {
        libc::connect(
            fd,
            std::ptr::addr_of!(sa).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Fetch and clear the pending socket error after a connect completes.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: err/len are valid out-params of the stated sizes.
    sys_result(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    })?;
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Mark the socket as listening.
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    // SAFETY: plain listen(2) call.
    sys_result(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Join an IPv4 multicast group on `interface`. When `source` is given the
/// join is source-specific (`IP_ADD_SOURCE_MEMBERSHIP`); otherwise
/// classical ASM. The FD stays owned by the caller regardless of outcome.
pub fn join_multicast(
    fd: RawFd,
    group: Ipv4Addr,
    interface: Ipv4Addr,
    source: Option<Ipv4Addr>,
) -> io::Result<()> {
    membership(fd, group, interface, source, true)
}

/// Leave a multicast group joined with [`join_multicast`].
pub fn leave_multicast(
    fd: RawFd,
    group: Ipv4Addr,
    interface: Ipv4Addr,
    source: Option<Ipv4Addr>,
) -> io::Result<()> {
    membership(fd, group, interface, source, false)
}

fn membership(
    fd: RawFd,
    group: Ipv4Addr,
    interface: Ipv4Addr,
    source: Option<Ipv4Addr>,
    join: bool,
) -> io::Result<()> {
    let in_addr = |ip: Ipv4Addr| libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    };
    match source {
        Some(src) => {
            let mreq = libc::ip_mreq_source {
                imr_multiaddr: in_addr(group),
                imr_interface: in_addr(interface),
                imr_sourceaddr: in_addr(src),
            };
            let opt = if join {
                libc::IP_ADD_SOURCE_MEMBERSHIP
            } else {
                libc::IP_DROP_SOURCE_MEMBERSHIP
            };
            // SAFETY: mreq is a valid ip_mreq_source of the stated length.
            sys_result(unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    opt,
                    std::ptr::addr_of!(mreq).cast(),
                    std::mem::size_of::<libc::ip_mreq_source>() as libc::socklen_t,
                )
            })?;
        }
        None => {
            let mreq = libc::ip_mreq {
                imr_multiaddr: in_addr(group),
                imr_interface: in_addr(interface),
            };
            let opt = if join {
                libc::IP_ADD_MEMBERSHIP
            } else {
                libc::IP_DROP_MEMBERSHIP
            };
            // SAFETY: mreq is a valid ip_mreq of the stated length.
            sys_result(unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    opt,
                    std::ptr::addr_of!(mreq).cast(),
                    std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
                )
            })?;
        }
    }
    Ok(())
}

/// Resolve a host name to its first address.
///
/// This call BLOCKS on the system resolver and must only be used during
/// initialization, never from a dispatch callback.
pub fn resolve_host(host: &str) -> io::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = (host, 0u16).to_socket_addrs()?.collect();
    addrs
        .first()
        .map(SocketAddr::ip)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}

/// Close a raw FD, ignoring `EINTR` per POSIX close semantics.
pub(crate) fn close_fd(fd: RawFd) {
    // SAFETY: fd is owned by the caller and not used after this.
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockets_come_up_nonblocking() {
        let fd = udp_socket().expect("udp socket");
        // SAFETY: querying flags on an open fd.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        close_fd(fd);
    }

    #[test]
    fn bind_and_immediate_loopback_connect() {
        let lfd = tcp_socket().expect("listen socket");
        bind(lfd, "127.0.0.1:0".parse().expect("addr")).expect("bind");
        listen(lfd, 8).expect("listen");
        close_fd(lfd);
    }

    #[test]
    fn multicast_join_bad_group_fails_without_closing_fd() {
        let fd = udp_socket().expect("udp socket");
        // 127.0.0.1 is not a multicast group; the join must fail
        let err = join_multicast(fd, Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED, None);
        assert!(err.is_err());
        // FD is still alive and usable
        bind(fd, "127.0.0.1:0".parse().expect("addr")).expect("bind after failed join");
        close_fd(fd);
    }

    #[test]
    fn resolve_localhost() {
        let ip = resolve_host("localhost").expect("resolve");
        assert!(ip.is_loopback());
    }
}
