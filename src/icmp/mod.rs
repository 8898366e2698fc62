pub mod packet;
pub mod socket;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "macos", target_os = "ios"))]
mod darwin;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
mod other;

pub use packet::*;
pub use socket::*;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxEndpoint as PlatformEndpoint;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use darwin::DarwinEndpoint as PlatformEndpoint;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub use other::GenericEndpoint as PlatformEndpoint;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn echo_request_type(self) -> u8 {
        match self {
            IpFamily::V4 => ICMP_ECHO_REQUEST,
            IpFamily::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    pub fn echo_reply_type(self) -> u8 {
        match self {
            IpFamily::V4 => ICMP_ECHO_REPLY,
            IpFamily::V6 => ICMPV6_ECHO_REPLY,
        }
    }

    pub fn is_ipv6(self) -> bool {
        self == IpFamily::V6
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// A matched Echo Reply, handed to the reply and duplicate handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// ICMP bytes received, header included.
    pub nbytes: usize,
    pub addr: IpAddr,
    pub seq: u16,
    pub rtt: Duration,
    /// IP TTL or IPv6 hop limit, when the platform exposes it.
    pub ttl: Option<u8>,
}
