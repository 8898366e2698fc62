//! ICMP echo probing with optional source address and interface (VRF) binding.
//!
//! A [`Pinger`] sends Echo Requests at a fixed interval, correlates Echo
//! Replies by sequence number, reports replies and duplicates through
//! handlers, and summarizes loss and round-trip times in [`Statistics`].
//! Both raw (privileged) and datagram (unprivileged) ICMP sockets are
//! supported on Linux and macOS.

#[cfg(not(unix))]
compile_error!("vrfping requires a Unix-like operating system");

pub mod dns;
pub mod error;
pub mod icmp;
pub mod pinger;
pub mod stats;
pub mod utils;

pub use error::PingError;
pub use icmp::{Endpoint, EndpointConfig, IpFamily, Packet, PlatformEndpoint, Received};
pub use pinger::{Pinger, PingerConfig, SessionState, StopHandle};
pub use stats::Statistics;
