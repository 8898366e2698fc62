use std::net::IpAddr;
use std::time::Duration;

use crate::icmp::Packet;

/// Streaming RTT aggregate using Welford's update, so no samples are retained.
#[derive(Debug, Clone, Default)]
pub struct RttAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: Option<Duration>,
    max: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RttSummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    /// Population standard deviation, zero below two samples.
    pub stddev: Duration,
}

impl RttAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, rtt: Duration) {
        self.count += 1;

        let x = rtt.as_nanos() as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn snapshot(&self) -> RttSummary {
        if self.count == 0 {
            return RttSummary::default();
        }

        let stddev = if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        };

        RttSummary {
            count: self.count,
            min: self.min.unwrap_or_default(),
            max: self.max.unwrap_or_default(),
            mean: nanos_to_duration(self.mean),
            stddev: nanos_to_duration(stddev),
        }
    }
}

fn nanos_to_duration(nanos: f64) -> Duration {
    Duration::from_nanos(nanos.max(0.0).round() as u64)
}

/// Counters for one session, owned by the engine loop.
#[derive(Debug, Clone, Default)]
pub struct PingStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub duplicates: u64,
    rtt: RttAccumulator,
}

impl PingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// A first reply for its sequence number.
    pub fn record_received(&mut self, rtt: Duration) {
        self.packets_received += 1;
        self.rtt.observe(rtt);
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        let lost = self.packets_sent.saturating_sub(self.packets_received);
        (lost as f64 / self.packets_sent as f64) * 100.0
    }

    pub fn snapshot(&self, addr: IpAddr) -> Statistics {
        let rtt = self.rtt.snapshot();
        Statistics {
            addr,
            packets_sent: self.packets_sent,
            packets_recv: self.packets_received,
            packets_recv_duplicates: self.duplicates,
            packet_loss: self.loss_percentage(),
            min_rtt: rtt.min,
            avg_rtt: rtt.mean,
            max_rtt: rtt.max,
            std_dev_rtt: rtt.stddev,
        }
    }
}

/// Final summary of a session. RTT fields are zero when nothing was received.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub addr: IpAddr,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub packets_recv_duplicates: u64,
    pub packet_loss: f64,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub std_dev_rtt: Duration,
}

impl Statistics {
    pub fn format_summary(&self) -> String {
        format!(
            "\n--- {} ping statistics ---\n\
             {} packets transmitted, {} packets received, {} duplicates, {}% packet loss\n\
             round-trip min/avg/max/stddev = {:?}/{:?}/{:?}/{:?}",
            self.addr,
            self.packets_sent,
            self.packets_recv,
            self.packets_recv_duplicates,
            format_loss(self.packet_loss),
            self.min_rtt,
            self.avg_rtt,
            self.max_rtt,
            self.std_dev_rtt
        )
    }
}

fn format_loss(loss: f64) -> String {
    if loss.fract() == 0.0 {
        format!("{:.0}", loss)
    } else {
        format!("{:.3}", loss)
    }
}

pub fn format_response(packet: &Packet, duplicate: bool) -> String {
    let ttl = packet
        .ttl
        .map(|ttl| ttl.to_string())
        .unwrap_or_else(|| "?".to_string());

    format!(
        "{} bytes from {}: icmp_seq={} time={:?} ttl={}{}",
        packet.nbytes,
        packet.addr,
        packet.seq,
        packet.rtt,
        ttl,
        if duplicate { " (DUP!)" } else { "" }
    )
}

pub fn format_header(target: &str, addr: IpAddr, source: Option<IpAddr>, interface: Option<&str>) -> String {
    let source = source.map(|ip| ip.to_string()).unwrap_or_default();
    format!("PING {} ({}) from {} ({}):", target, addr, source, interface.unwrap_or(""))
}
