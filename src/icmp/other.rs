//! Fallback endpoint for Unix systems without a dedicated implementation.
//!
//! Whether an IPv4 header is present is decided per message from the version
//! nibble. Interface binding is not available.

use std::io;
use std::net::IpAddr;
use std::time::Instant;

use super::socket::{Endpoint, EndpointConfig, IcmpSocket, Received, strip_ipv4_header};
use super::IpFamily;
use crate::error::PingError;

pub struct GenericEndpoint {
    socket: IcmpSocket,
}

impl GenericEndpoint {
    pub fn open(config: EndpointConfig) -> Result<Self, PingError> {
        if let Some(name) = &config.interface {
            return Err(PingError::Bind {
                target: format!("interface '{}'", name),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "interface binding is only available on Linux and macOS",
                ),
            });
        }

        let socket = IcmpSocket::open(&config)?;
        socket.bind_source()?;
        Ok(Self { socket })
    }
}

fn no_ttl(_level: libc::c_int, _ty: libc::c_int, _data: *const u8) -> Option<u8> {
    None
}

impl Endpoint for GenericEndpoint {
    fn family(&self) -> IpFamily {
        self.socket.config().family
    }

    fn identifier(&self, requested: u16) -> Option<u16> {
        Some(requested)
    }

    fn computes_checksum(&self) -> bool {
        self.family() == IpFamily::V6
    }

    fn send_to(&self, message: &[u8], destination: IpAddr) -> Result<usize, PingError> {
        self.socket.send_to(message, destination)
    }

    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError> {
        let received = self.socket.recv_msg(buf, deadline, no_ttl)?;
        if self.family() == IpFamily::V4 && received.len > 0 && buf[0] >> 4 == 4 {
            strip_ipv4_header(buf, received)
        } else {
            Ok(received)
        }
    }

    fn close(&self) {
        self.socket.close()
    }
}
