use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::IpFamily;
use crate::error::PingError;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV4_TTL_OFFSET: usize = 8;

/// Settings fixed at the time an endpoint is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub family: IpFamily,
    /// Raw socket when true, kernel-framed datagram socket otherwise.
    pub privileged: bool,
    pub source: Option<IpAddr>,
    /// Interface (or VRF device) all egress traffic is pinned to.
    pub interface: Option<String>,
}

impl EndpointConfig {
    pub fn new(family: IpFamily, privileged: bool) -> Self {
        Self {
            family,
            privileged,
            source: None,
            interface: None,
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.privileged { "raw" } else { "datagram" }
    }
}

/// One inbound message. `buf[..len]` holds a bare ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    pub peer: IpAddr,
    pub ttl: Option<u8>,
}

/// An ICMP-capable socket, normalized across privilege modes and OS families.
pub trait Endpoint: Send + Sync {
    fn family(&self) -> IpFamily;

    /// The identifier replies to this endpoint will carry.
    ///
    /// `None` means the platform gives no usable identifier and replies must be
    /// matched on the payload tracker alone.
    fn identifier(&self, requested: u16) -> Option<u16>;

    /// Whether the kernel fills in the ICMP checksum on send.
    fn computes_checksum(&self) -> bool;

    fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError>;

    /// Blocks until a message arrives or `deadline` passes, in which case
    /// `PingError::Timeout` is returned.
    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError>;

    fn close(&self);
}

impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn family(&self) -> IpFamily {
        (**self).family()
    }

    fn identifier(&self, requested: u16) -> Option<u16> {
        (**self).identifier(requested)
    }

    fn computes_checksum(&self) -> bool {
        (**self).computes_checksum()
    }

    fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError> {
        (**self).send_to(message, destination)
    }

    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError> {
        (**self).recv(buf, deadline)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Extracts a TTL / hop limit from one control message, given its level, type and data.
pub(crate) type TtlFromCmsg = fn(libc::c_int, libc::c_int, *const u8) -> Option<u8>;

/// The socket2 socket shared by every platform endpoint.
pub(crate) struct IcmpSocket {
    socket: Socket,
    config: EndpointConfig,
    closed: AtomicBool,
}

impl IcmpSocket {
    pub fn open(config: &EndpointConfig) -> Result<Self, PingError> {
        let (domain, protocol) = match config.family {
            IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = if config.privileged { Type::RAW } else { Type::DGRAM };

        let socket = Socket::new(domain, ty, Some(protocol)).map_err(|e| PingError::SocketOpen {
            mode: config.mode(),
            source: e,
        })?;
        socket.set_nonblocking(false)?;

        log::debug!("Opened {} {} ICMP socket", config.family, config.mode());
        Ok(Self {
            socket,
            config: config.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Binds the local address: the configured source, or the wildcard so routing picks one.
    pub fn bind_source(&self) -> Result<(), PingError> {
        let ip = match (self.config.source, self.config.family) {
            (Some(ip), family) if IpFamily::of(&ip) == family => ip,
            (Some(ip), family) => {
                return Err(PingError::Bind {
                    target: ip.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("source address is not {}", family),
                    ),
                });
            }
            (None, IpFamily::V4) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (None, IpFamily::V6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        self.socket
            .bind(&SockAddr::from(SocketAddr::new(ip, 0)))
            .map_err(|e| PingError::Bind {
                target: ip.to_string(),
                source: e,
            })?;
        log::debug!("Bound ICMP socket to {}", ip);
        Ok(())
    }

    /// The local port, which datagram ICMP sockets on some kernels use as the echo identifier.
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .map(|addr| addr.port())
    }

    pub fn set_int_option(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError> {
        self.ensure_open()?;
        let sent = self
            .socket
            .send_to(message, &SockAddr::from(SocketAddr::new(destination, 0)))?;
        Ok(sent)
    }

    /// `recvmsg` bounded by `deadline`, collecting the TTL from ancillary data.
    pub fn recv_msg(&self, buf: &mut [u8], deadline: Instant, ttl_from_cmsg: TtlFromCmsg) -> Result<Received, PingError> {
        self.ensure_open()?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PingError::Timeout);
        }
        self.socket
            .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // u64 elements keep the control buffer aligned for cmsghdr
        let mut cmsg_buf = [0u64; 16];
        let mut src_storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();

        loop {
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = src_storage.as_mut_ptr() as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            // msg_controllen is usize on Linux and u32 on macOS
            msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

            let len = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
            if len < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Err(PingError::Timeout),
                    _ => return Err(PingError::Io(err)),
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(closed_error());
            }

            let storage = unsafe { src_storage.assume_init_ref() };
            let peer = parse_sockaddr_storage(storage)?;
            let ttl = ttl_from_control(&msg, ttl_from_cmsg);
            log::debug!("Received {} bytes from {}", len, peer);

            return Ok(Received {
                len: len as usize,
                peer,
                ttl,
            });
        }
    }

    /// Marks the socket closed and wakes a reader blocked in `recv_msg`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Unconnected sockets report ENOTCONN here but the reader is still woken
            let _ = self.socket.shutdown(Shutdown::Read);
            log::debug!("Closed {} ICMP socket", self.config.mode());
        }
    }

    fn ensure_open(&self) -> Result<(), PingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }
}

fn closed_error() -> PingError {
    PingError::Io(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))
}

fn ttl_from_control(msg: &libc::msghdr, ttl_from_cmsg: TtlFromCmsg) -> Option<u8> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let data = libc::CMSG_DATA(cmsg) as *const u8;
            if let Some(ttl) = ttl_from_cmsg(hdr.cmsg_level, hdr.cmsg_type, data) {
                return Some(ttl);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> Result<IpAddr, PingError> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)))
        }
        _ => Err(PingError::Decode("reply from an unknown address family")),
    }
}

/// Removes a leading IPv4 header in place, returning the bare ICMP message and the header's TTL.
pub(crate) fn strip_ipv4_header(buf: &mut [u8], received: Received) -> Result<Received, PingError> {
    let len = received.len;
    if len < IPV4_MIN_HEADER_LEN || buf[0] >> 4 != 4 {
        return Err(PingError::Decode("missing IPv4 header"));
    }

    let header_len = ((buf[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > len {
        return Err(PingError::Decode("bad IPv4 header length"));
    }

    let ttl = buf[IPV4_TTL_OFFSET];
    buf.copy_within(header_len..len, 0);
    Ok(Received {
        len: len - header_len,
        peer: received.peer,
        ttl: Some(ttl),
    })
}

/// Reads a native-endian `int` out of control message data.
pub(crate) fn read_cmsg_int(data: *const u8) -> u8 {
    let value = unsafe { std::ptr::read_unaligned(data as *const libc::c_int) };
    value as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(len: usize) -> Received {
        Received {
            len,
            peer: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ttl: None,
        }
    }

    #[test]
    fn test_strip_ipv4_header() {
        let mut buf = vec![0u8; 64];
        buf[0] = 0x45;
        buf[IPV4_TTL_OFFSET] = 57;
        buf[20..28].copy_from_slice(&[0, 0, 0xAB, 0xCD, 0, 1, 0, 2]);

        let stripped = strip_ipv4_header(&mut buf, received(28)).unwrap();
        assert_eq!(stripped.len, 8);
        assert_eq!(stripped.ttl, Some(57));
        assert_eq!(&buf[..8], &[0, 0, 0xAB, 0xCD, 0, 1, 0, 2]);
    }

    #[test]
    fn test_strip_ipv4_header_with_options() {
        let mut buf = vec![0u8; 64];
        buf[0] = 0x46;
        buf[IPV4_TTL_OFFSET] = 3;
        buf[24] = 0xEE;

        let stripped = strip_ipv4_header(&mut buf, received(32)).unwrap();
        assert_eq!(stripped.len, 8);
        assert_eq!(buf[0], 0xEE);
    }

    #[test]
    fn test_strip_rejects_headerless() {
        let mut buf = vec![0u8; 64];
        assert!(matches!(strip_ipv4_header(&mut buf, received(28)), Err(PingError::Decode(_))));

        buf[0] = 0x4F;
        assert!(matches!(strip_ipv4_header(&mut buf, received(40)), Err(PingError::Decode(_))));
    }

    #[test]
    fn test_source_family_mismatch() {
        let mut config = EndpointConfig::new(IpFamily::V4, false);
        config.source = Some("::1".parse().unwrap());

        // Socket creation may be refused in sandboxes; the family check only runs once it succeeds.
        match IcmpSocket::open(&config) {
            Ok(socket) => assert!(matches!(socket.bind_source(), Err(PingError::Bind { .. }))),
            Err(e) => println!("ICMP socket unavailable: {}", e),
        }
    }

    #[test]
    fn test_endpoint_config_mode() {
        assert_eq!(EndpointConfig::new(IpFamily::V4, true).mode(), "raw");
        assert_eq!(EndpointConfig::new(IpFamily::V6, false).mode(), "datagram");
    }
}
