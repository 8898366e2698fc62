//! Linux endpoint.
//!
//! Raw IPv4 sockets deliver the IP header with every reply, so it is stripped
//! here and the TTL read from it. Datagram sockets and all ICMPv6 sockets
//! deliver bare ICMP messages; their TTL / hop limit comes from ancillary data.
//! Datagram sockets also replace the echo identifier with the socket's local port.

use std::net::IpAddr;
use std::time::Instant;

use super::socket::{Endpoint, EndpointConfig, IcmpSocket, Received, read_cmsg_int, strip_ipv4_header};
use super::IpFamily;
use crate::error::PingError;

pub struct LinuxEndpoint {
    socket: IcmpSocket,
    header_included: bool,
    /// Kernel-assigned identifier of a datagram socket.
    bound_identifier: Option<u16>,
}

impl LinuxEndpoint {
    pub fn open(config: EndpointConfig) -> Result<Self, PingError> {
        let socket = IcmpSocket::open(&config)?;

        if let Some(name) = &config.interface {
            socket
                .socket()
                .bind_device(Some(name.as_bytes()))
                .map_err(|e| PingError::Bind {
                    target: format!("interface '{}'", name),
                    source: e,
                })?;
            log::debug!("Bound ICMP socket to interface {}", name);
        }
        socket.bind_source()?;

        let header_included = config.privileged && config.family == IpFamily::V4;
        if !header_included {
            let (level, name) = match config.family {
                IpFamily::V4 => (libc::IPPROTO_IP, libc::IP_RECVTTL),
                IpFamily::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT),
            };
            if let Err(e) = socket.set_int_option(level, name, 1) {
                log::warn!("Could not enable TTL reception, replies will carry no TTL: {}", e);
            }
        }

        let bound_identifier = if config.privileged { None } else { socket.local_port() };
        if let Some(id) = bound_identifier {
            log::debug!("Kernel assigned echo identifier {}", id);
        }

        Ok(Self {
            socket,
            header_included,
            bound_identifier,
        })
    }
}

fn ttl_from_cmsg(level: libc::c_int, ty: libc::c_int, data: *const u8) -> Option<u8> {
    match (level, ty) {
        (libc::IPPROTO_IP, libc::IP_TTL) | (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) => Some(read_cmsg_int(data)),
        _ => None,
    }
}

impl Endpoint for LinuxEndpoint {
    fn family(&self) -> IpFamily {
        self.socket.config().family
    }

    fn identifier(&self, requested: u16) -> Option<u16> {
        Some(self.bound_identifier.unwrap_or(requested))
    }

    fn computes_checksum(&self) -> bool {
        !self.socket.config().privileged || self.family() == IpFamily::V6
    }

    fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError> {
        self.socket.send_to(message, destination)
    }

    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError> {
        let received = self.socket.recv_msg(buf, deadline, ttl_from_cmsg)?;
        if self.header_included {
            strip_ipv4_header(buf, received)
        } else {
            Ok(received)
        }
    }

    fn close(&self) {
        self.socket.close()
    }
}
