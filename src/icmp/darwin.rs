//! macOS endpoint.
//!
//! IPv4 sockets are switched to `IP_STRIPHDR`, so replies arrive without an IP
//! header in both modes and the TTL comes from ancillary data. Datagram sockets
//! hand every Echo Reply to every ping socket on the host, so they offer no
//! identifier to match on.

use std::ffi::CString;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Instant;

use super::socket::{Endpoint, EndpointConfig, IcmpSocket, Received, read_cmsg_int};
use super::IpFamily;
use crate::error::PingError;

// <netinet/in.h> and <netinet6/in6.h>
const IP_STRIPHDR: libc::c_int = 23;
const IP_RECVTTL: libc::c_int = 24;
const IPV6_RECVHOPLIMIT: libc::c_int = 37;
const IPV6_HOPLIMIT: libc::c_int = 47;

pub struct DarwinEndpoint {
    socket: IcmpSocket,
}

impl DarwinEndpoint {
    pub fn open(config: EndpointConfig) -> Result<Self, PingError> {
        let socket = IcmpSocket::open(&config)?;

        if let Some(name) = &config.interface {
            bind_interface(&socket, name, config.family)?;
        }
        socket.bind_source()?;

        match config.family {
            IpFamily::V4 => {
                socket
                    .set_int_option(libc::IPPROTO_IP, IP_STRIPHDR, 1)
                    .map_err(|e| PingError::SocketOpen {
                        mode: config.mode(),
                        source: e,
                    })?;
                if let Err(e) = socket.set_int_option(libc::IPPROTO_IP, IP_RECVTTL, 1) {
                    log::warn!("Could not enable TTL reception, replies will carry no TTL: {}", e);
                }
            }
            IpFamily::V6 => {
                if let Err(e) = socket.set_int_option(libc::IPPROTO_IPV6, IPV6_RECVHOPLIMIT, 1) {
                    log::warn!("Could not enable hop limit reception, replies will carry no TTL: {}", e);
                }
            }
        }

        Ok(Self { socket })
    }
}

/// macOS binds by interface index (`IP_BOUND_IF` / `IPV6_BOUND_IF`).
fn bind_interface(socket: &IcmpSocket, name: &str, family: IpFamily) -> Result<(), PingError> {
    let bind_error = |source: io::Error| PingError::Bind {
        target: format!("interface '{}'", name),
        source,
    };

    let c_name = CString::new(name)
        .map_err(|_| bind_error(io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL")))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    let index = NonZeroU32::new(index)
        .ok_or_else(|| bind_error(io::Error::new(io::ErrorKind::NotFound, "no such interface")))?;

    let bound = match family {
        IpFamily::V4 => socket.socket().bind_device_by_index_v4(Some(index)),
        IpFamily::V6 => socket.socket().bind_device_by_index_v6(Some(index)),
    };
    bound.map_err(bind_error)?;

    log::debug!("Bound ICMP socket to interface {} (index {})", name, index);
    Ok(())
}

fn ttl_from_cmsg(level: libc::c_int, ty: libc::c_int, data: *const u8) -> Option<u8> {
    match (level, ty) {
        // IP_RECVTTL delivers a single byte
        (libc::IPPROTO_IP, IP_RECVTTL) => Some(unsafe { *data }),
        (libc::IPPROTO_IPV6, IPV6_HOPLIMIT) => Some(read_cmsg_int(data)),
        _ => None,
    }
}

impl Endpoint for DarwinEndpoint {
    fn family(&self) -> IpFamily {
        self.socket.config().family
    }

    fn identifier(&self, requested: u16) -> Option<u16> {
        self.socket.config().privileged.then_some(requested)
    }

    fn computes_checksum(&self) -> bool {
        self.family() == IpFamily::V6
    }

    fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError> {
        self.socket.send_to(message, destination)
    }

    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError> {
        self.socket.recv_msg(buf, deadline, ttl_from_cmsg)
    }

    fn close(&self) {
        self.socket.close()
    }
}
