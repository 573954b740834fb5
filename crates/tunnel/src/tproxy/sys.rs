//! Linux socket plumbing for transparent proxying.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tunnel_core::DEFAULT_CONNECTION_BACKLOG;

use super::session::ReplySender;
use super::{DatagramSocket, StreamListener};

// From linux/in.h and linux/in6.h.
const IP_TRANSPARENT: libc::c_int = 19;
const IP_RECVORIGDSTADDR: libc::c_int = 20;
const IP_ORIGDSTADDR: libc::c_int = 20;
const IPV6_RECVORIGDSTADDR: libc::c_int = 74;
const IPV6_ORIGDSTADDR: libc::c_int = 74;
const IPV6_TRANSPARENT: libc::c_int = 75;

fn set_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &enable as *const _ as *const libc::c_void,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_transparent(socket: &Socket, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        set_int_option(socket.as_raw_fd(), libc::SOL_IPV6, IPV6_TRANSPARENT)
    } else {
        set_int_option(socket.as_raw_fd(), libc::SOL_IP, IP_TRANSPARENT)
    }
}

fn transparent_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    set_transparent(&socket, addr.is_ipv6())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a TCP listener that accepts connections for any destination.
pub(crate) fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = transparent_socket(addr, Type::STREAM, Protocol::TCP)?;
    socket.bind(&addr.into())?;
    socket.listen(DEFAULT_CONNECTION_BACKLOG as i32)?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
}

/// Bind a UDP socket that reports each datagram's original destination.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = transparent_socket(addr, Type::DGRAM, Protocol::UDP)?;
    if addr.is_ipv6() {
        set_int_option(socket.as_raw_fd(), libc::SOL_IPV6, IPV6_RECVORIGDSTADDR)?;
    }
    // Dual-stack IPv6 sockets also receive IPv4 datagrams.
    let _ = set_int_option(socket.as_raw_fd(), libc::SOL_IP, IP_RECVORIGDSTADDR);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Destination the client originally connected to.
///
/// Connections redirected by NAT report it through `SO_ORIGINAL_DST`;
/// TPROXY connections keep it as their local address.
fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    let sock = SockRef::from(stream);
    let nat = match stream.local_addr()? {
        SocketAddr::V4(_) => sock.original_dst(),
        SocketAddr::V6(_) => sock.original_dst_ipv6(),
    };
    if let Ok(addr) = nat
        && let Some(addr) = addr.as_socket()
    {
        return Ok(addr);
    }
    stream.local_addr()
}

#[async_trait]
impl StreamListener for TcpListener {
    async fn accept_redirected(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.accept().await
    }

    fn original_dst(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        original_dst(stream)
    }
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_redirected(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, SocketAddr)> {
        self.async_io(Interest::READABLE, || {
            recvmsg_original_dst(self.as_raw_fd(), buf)
        })
        .await
    }
}

fn recvmsg_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, SocketAddr)> {
    let mut src: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // u64 elements keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; 16];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut src as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let src = sockaddr_to_std(&src)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown source family"))?;

    let mut dst = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let matches = (hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == IP_ORIGDSTADDR)
                || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == IPV6_ORIGDSTADDR);
            if matches {
                let mut storage: libc::sockaddr_storage = mem::zeroed();
                let len = (hdr.cmsg_len as usize)
                    .saturating_sub(libc::CMSG_LEN(0) as usize)
                    .min(mem::size_of::<libc::sockaddr_storage>());
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
                    len,
                );
                dst = sockaddr_to_std(&storage);
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    let dst = dst.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing original destination")
    })?;
    Ok((n as usize, src, dst))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
            };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Sends replies from a spoofed source through a fresh transparent socket.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransparentReplySender;

#[async_trait]
impl ReplySender for TransparentReplySender {
    async fn send_reply(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        payload: &[u8],
    ) -> io::Result<usize> {
        let socket = transparent_socket(from, Type::DGRAM, Protocol::UDP)?;
        socket.bind(&from.into())?;
        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;
        socket.send_to(payload, to).await
    }
}
