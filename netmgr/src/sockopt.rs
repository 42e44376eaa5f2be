//! Platform socket-option shims.
//!
//! Options that a platform does not provide yield
//! [`NetError::NotImplemented`] without failing the socket; callers decide
//! whether the option was load-bearing.

use std::mem;
use std::os::unix::io::AsRawFd;

use socket2::Socket;

use crate::result::{NetError, NetResult};

fn setsockopt_int(socket: &Socket, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> NetResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(NetError::last_os_error());
    }
    Ok(())
}

/// Allow rebinding the local address. On the BSDs SO_REUSEPORT subsumes
/// SO_REUSEADDR; on Linux SO_REUSEPORT means load balancing instead, so
/// only SO_REUSEADDR is set here (see [`reuse_lb`]).
pub(crate) fn reuse(socket: &Socket) -> NetResult<()> {
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    }
    #[cfg(target_os = "linux")]
    {
        socket.set_reuse_address(true)?;
        Ok(())
    }
}

/// Kernel-level load balancing of incoming connections/datagrams across
/// sockets bound to the same address: SO_REUSEPORT_LB on FreeBSD,
/// SO_REUSEPORT on Linux.
pub(crate) fn reuse_lb(socket: &Socket) -> NetResult<()> {
    #[cfg(target_os = "freebsd")]
    {
        const SO_REUSEPORT_LB: libc::c_int = 0x00010000;
        setsockopt_int(socket, libc::SOL_SOCKET, SO_REUSEPORT_LB, 1)
    }
    #[cfg(target_os = "linux")]
    {
        setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    }
    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    {
        let _ = socket;
        Err(NetError::NotImplemented)
    }
}

/// Whether this platform load-balances across reuseport sockets, which
/// decides between per-worker listening sockets and `dup()`-style sharing.
pub(crate) fn have_reuseport_lb() -> bool {
    cfg!(any(target_os = "linux", target_os = "freebsd"))
}

/// Bind to addresses that are not (yet) configured on an interface.
pub(crate) fn freebind(socket: &Socket, ipv6: bool) -> NetResult<()> {
    #[cfg(target_os = "linux")]
    {
        let _ = ipv6;
        setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_FREEBIND, 1)
    }
    #[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
    {
        if ipv6 {
            return Err(NetError::NotImplemented);
        }
        setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_BINDANY, 1)
    }
    #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd")))]
    {
        let _ = (socket, ipv6);
        Err(NetError::NotImplemented)
    }
}

/// Set the don't-fragment behavior on UDP sockets, preferring the PMTU
/// probing mode that never sets the DF bit on the wire.
pub(crate) fn dontfrag(socket: &Socket, ipv6: bool) -> NetResult<()> {
    #[cfg(target_os = "linux")]
    {
        if ipv6 {
            setsockopt_int(
                socket,
                libc::IPPROTO_IPV6,
                libc::IPV6_MTU_DISCOVER,
                libc::IP_PMTUDISC_OMIT,
            )
            .or_else(|_| {
                setsockopt_int(
                    socket,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_MTU_DISCOVER,
                    libc::IP_PMTUDISC_DONT,
                )
            })
        } else {
            setsockopt_int(
                socket,
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                libc::IP_PMTUDISC_OMIT,
            )
            .or_else(|_| {
                setsockopt_int(
                    socket,
                    libc::IPPROTO_IP,
                    libc::IP_MTU_DISCOVER,
                    libc::IP_PMTUDISC_DONT,
                )
            })
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, ipv6);
        Err(NetError::NotImplemented)
    }
}

/// Disable Nagle. Absent the option, succeed: the socket works without it.
pub(crate) fn tcp_nodelay(socket: &Socket) -> NetResult<()> {
    socket.set_nodelay(true)?;
    Ok(())
}

/// Bound the time the TCP stack retransmits on an unacknowledged
/// connection (TCP_USER_TIMEOUT family). Platforms without an equivalent
/// succeed silently; the library-level connect timer still applies.
pub(crate) fn connection_timeout(socket: &Socket, timeout_ms: u64) -> NetResult<()> {
    #[cfg(target_os = "linux")]
    {
        let timeout = timeout_ms.max(1).min(libc::c_uint::MAX as u64) as libc::c_int;
        setsockopt_int(socket, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, timeout)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, timeout_ms);
        Ok(())
    }
}

/// Hint the kernel to deliver packets on the CPU the handling worker is
/// pinned to.
pub(crate) fn incoming_cpu(socket: &Socket) -> NetResult<()> {
    #[cfg(target_os = "linux")]
    {
        setsockopt_int(socket, libc::SOL_SOCKET, libc::SO_INCOMING_CPU, 1)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        Err(NetError::NotImplemented)
    }
}

/// Apply configured SO_RCVBUF/SO_SNDBUF sizes; zero keeps the OS default.
pub(crate) fn net_buffers(socket: &Socket, recv: usize, send: usize) -> NetResult<()> {
    if recv > 0 {
        socket.set_recv_buffer_size(recv)?;
    }
    if send > 0 {
        socket.set_send_buffer_size(send)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn tcp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    fn udp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap()
    }

    #[test]
    fn test_reuse() {
        let socket = tcp_socket();
        reuse(&socket).unwrap();
    }

    #[test]
    fn test_reuse_lb_best_effort() {
        let socket = tcp_socket();
        match reuse_lb(&socket) {
            Ok(()) => assert!(have_reuseport_lb()),
            Err(NetError::NotImplemented) => assert!(!have_reuseport_lb()),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_tcp_nodelay() {
        let socket = tcp_socket();
        tcp_nodelay(&socket).unwrap();
    }

    #[test]
    fn test_connection_timeout() {
        let socket = tcp_socket();
        connection_timeout(&socket, 120_000).unwrap();
    }

    #[test]
    fn test_dontfrag_udp() {
        let socket = udp_socket();
        match dontfrag(&socket, false) {
            Ok(()) | Err(NetError::NotImplemented) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_net_buffers() {
        let socket = tcp_socket();
        net_buffers(&socket, 65536, 65536).unwrap();
        // Zero leaves defaults alone.
        net_buffers(&socket, 0, 0).unwrap();
    }
}
