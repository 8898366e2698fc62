//! The probe engine.
//!
//! A session runs two activities. A blocking receiver thread reads from the
//! endpoint with a bounded deadline, decodes and filters replies, and forwards
//! them over a channel. The async owner loop is the only code that touches the
//! outstanding-probe set, the duplicate markers and the statistics: it sends a
//! probe on every interval tick, correlates forwarded replies, and decides when
//! the session ends.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dns;
use crate::error::PingError;
use crate::icmp::{self, EchoReply, Endpoint, EndpointConfig, IpFamily, Packet, PlatformEndpoint};
use crate::stats::{PingStatistics, Statistics};
use crate::utils::generate_identifier;

/// Large enough for any IPv4 datagram, header included.
const RECV_BUFFER_SIZE: usize = 65536;
const INBOUND_QUEUE: usize = 256;
/// Stand-in for "never" when the configured timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86400);

#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Number of probes to send; `None` pings until stopped or timed out.
    pub count: Option<u32>,
    pub interval: Duration,
    /// Overall session timeout.
    pub timeout: Duration,
    /// How long a counted session waits for outstanding replies after its last probe.
    pub linger: Duration,
    /// Echo payload size in bytes.
    pub size: usize,
    pub privileged: bool,
    pub source: Option<IpAddr>,
    pub interface: Option<String>,
    /// Requested echo identifier. Unprivileged Linux sockets substitute their own.
    pub identifier: u16,
    /// Upper bound on a single blocking read, and so on stop latency.
    pub read_deadline: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            count: None,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(100_000),
            linger: Duration::from_secs(1),
            size: 16,
            privileged: false,
            source: None,
            interface: None,
            identifier: generate_identifier(),
            read_deadline: Duration::from_millis(250),
        }
    }
}

impl PingerConfig {
    pub fn validate(&self) -> Result<(), PingError> {
        if self.count == Some(0) {
            return Err(PingError::Config("count must be greater than 0".to_string()));
        }
        if self.interval.is_zero() {
            return Err(PingError::Config("interval must be greater than 0".to_string()));
        }
        if self.read_deadline.is_zero() {
            return Err(PingError::Config("read deadline must be greater than 0".to_string()));
        }
        icmp::validate_payload_size(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// Ended by count, timeout or a fatal I/O error.
    Completed,
    /// Ended by `stop()`.
    Stopped,
}

/// Cancels a running session from outside its own activities. Cloneable and idempotent.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

type PacketHandler = Box<dyn FnMut(&Packet) + Send>;
type FinishHandler = Box<dyn FnMut(&Statistics) + Send>;

/// Decides which replies belong to this session.
#[derive(Debug, Clone, Copy)]
struct Matcher {
    family: IpFamily,
    /// `None` when the endpoint cannot preserve identifiers.
    identifier: Option<u16>,
    tracker: u64,
}

impl Matcher {
    fn accepts(&self, reply: &EchoReply) -> bool {
        self.identifier.is_none_or(|id| id == reply.identifier) && reply.tracker == Some(self.tracker)
    }
}

/// A reply that passed the matcher, as forwarded by the receiver.
#[derive(Debug)]
struct Arrival {
    reply: EchoReply,
    peer: IpAddr,
    ttl: Option<u8>,
    nbytes: usize,
    received_at: SystemTime,
}

#[derive(Debug)]
enum Inbound {
    Reply(Arrival),
    Failed(PingError),
}

#[derive(Debug, PartialEq)]
enum Correlated {
    Reply(Packet),
    Duplicate(Packet),
    Unknown(u16),
}

enum Outcome {
    Finished,
    Stopped,
    Failed(PingError),
}

/// Mutable state of one session, owned by the engine loop.
#[derive(Debug, Default)]
struct Session {
    next_sequence: u16,
    /// Sent and not yet answered.
    outstanding: HashSet<u16>,
    /// Answered at least once.
    answered: HashSet<u16>,
    stats: PingStatistics,
}

impl Session {
    fn wants_send(&self, count: Option<u32>) -> bool {
        count.is_none_or(|c| self.stats.packets_sent < c as u64)
    }

    fn count_reached(&self, count: Option<u32>) -> bool {
        count.is_some_and(|c| self.stats.packets_received >= c as u64)
    }

    fn record_sent(&mut self, sequence: u16) {
        // Reuse after wraparound starts a fresh cycle for this sequence number
        self.answered.remove(&sequence);
        self.outstanding.insert(sequence);
        self.stats.record_sent();
        self.next_sequence = sequence.wrapping_add(1);
    }

    fn correlate(&mut self, arrival: Arrival) -> Correlated {
        let seq = arrival.reply.sequence;
        let rtt = arrival.reply.rtt(arrival.received_at);
        let packet = Packet {
            nbytes: arrival.nbytes,
            addr: arrival.peer,
            seq,
            rtt,
            ttl: arrival.ttl,
        };

        if self.outstanding.remove(&seq) {
            self.answered.insert(seq);
            self.stats.record_received(rtt);
            Correlated::Reply(packet)
        } else if self.answered.contains(&seq) {
            self.stats.record_duplicate();
            Correlated::Duplicate(packet)
        } else {
            Correlated::Unknown(seq)
        }
    }
}

pub struct Pinger {
    addr: IpAddr,
    config: PingerConfig,
    state: SessionState,
    stop: StopHandle,
    on_reply: Option<PacketHandler>,
    on_duplicate: Option<PacketHandler>,
    on_finish: Option<FinishHandler>,
}

impl Pinger {
    pub fn new(addr: IpAddr, config: PingerConfig) -> Self {
        Self {
            addr,
            config,
            state: SessionState::Idle,
            stop: StopHandle::default(),
            on_reply: None,
            on_duplicate: None,
            on_finish: None,
        }
    }

    /// Resolves `host`, optionally restricted to one IP family, and builds a pinger for it.
    pub async fn resolve(host: &str, family: Option<IpFamily>, config: PingerConfig) -> Result<Self, PingError> {
        let addr = dns::resolve_hostname(host, family).await?;
        Ok(Self::new(addr, config))
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn config(&self) -> &PingerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn on_reply<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.on_reply = Some(Box::new(handler));
        self
    }

    pub fn on_duplicate<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.on_duplicate = Some(Box::new(handler));
        self
    }

    /// Called exactly once when the session ends, whatever ended it.
    pub fn on_finish<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&Statistics) + Send + 'static,
    {
        self.on_finish = Some(Box::new(handler));
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            family: IpFamily::of(&self.addr),
            privileged: self.config.privileged,
            source: self.config.source,
            interface: self.config.interface.clone(),
        }
    }

    /// Opens the platform endpoint and runs the session to completion.
    ///
    /// Setup errors are returned before anything is sent. A fatal I/O error
    /// mid-session still fires the finish handler with what was collected.
    pub async fn run(&mut self) -> Result<Statistics, PingError> {
        self.check_startable()?;
        let endpoint = PlatformEndpoint::open(self.endpoint_config())?;
        self.run_with(endpoint).await
    }

    /// Runs the session over a caller-supplied endpoint.
    pub async fn run_with<E: Endpoint + 'static>(&mut self, endpoint: E) -> Result<Statistics, PingError> {
        self.check_startable()?;

        let endpoint = Arc::new(endpoint);
        let matcher = Matcher {
            family: endpoint.family(),
            identifier: endpoint.identifier(self.config.identifier),
            tracker: rand::random(),
        };
        self.state = SessionState::Running;
        log::info!(
            "Pinging {} (identifier {:?}, {} byte payload)",
            self.addr,
            matcher.identifier,
            self.config.size
        );

        let shutdown = self.stop.token.child_token();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let receiver = {
            let endpoint = Arc::clone(&endpoint);
            let shutdown = shutdown.clone();
            let read_deadline = self.config.read_deadline;
            tokio::task::spawn_blocking(move || receive_loop(&*endpoint, matcher, tx, shutdown, read_deadline))
        };

        let mut session = Session::default();
        let outcome = self.drive(&*endpoint, matcher, &mut session, rx).await;

        shutdown.cancel();
        endpoint.close();
        if let Err(e) = receiver.await {
            log::warn!("Receiver task failed: {}", e);
        }

        self.state = match outcome {
            Outcome::Stopped => SessionState::Stopped,
            _ => SessionState::Completed,
        };
        let stats = session.stats.snapshot(self.addr);
        log::info!(
            "Session {:?}: {} sent, {} received, {} duplicates",
            self.state,
            stats.packets_sent,
            stats.packets_recv,
            stats.packets_recv_duplicates
        );
        if let Some(on_finish) = self.on_finish.as_mut() {
            on_finish(&stats);
        }

        match outcome {
            Outcome::Failed(e) => Err(e),
            _ => Ok(stats),
        }
    }

    fn check_startable(&self) -> Result<(), PingError> {
        if self.state != SessionState::Idle {
            return Err(PingError::AlreadyStarted);
        }
        self.config.validate()
    }

    async fn drive<E: Endpoint + ?Sized>(
        &mut self,
        endpoint: &E,
        matcher: Matcher,
        session: &mut Session,
        mut rx: mpsc::Receiver<Inbound>,
    ) -> Outcome {
        let stop = self.stop.token.clone();
        let count = self.config.count;

        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let now = time::Instant::now();
        let session_deadline = now
            .checked_add(self.config.timeout)
            .unwrap_or(now + FAR_FUTURE);
        let mut drain_deadline: Option<time::Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Outcome::Stopped,
                _ = time::sleep_until(session_deadline) => {
                    log::debug!("Session timeout elapsed");
                    return Outcome::Finished;
                }
                _ = time::sleep_until(drain_deadline.unwrap_or(session_deadline)), if drain_deadline.is_some() => {
                    log::debug!("Stopped waiting for {} outstanding replies", session.outstanding.len());
                    return Outcome::Finished;
                }
                _ = ticker.tick(), if session.wants_send(count) => {
                    if let Err(e) = self.send_probe(endpoint, matcher, session) {
                        return Outcome::Failed(e);
                    }
                    if !session.wants_send(count) {
                        drain_deadline = Some(time::Instant::now() + self.config.linger);
                    }
                }
                inbound = rx.recv() => match inbound {
                    Some(Inbound::Reply(arrival)) => {
                        let correlated = session.correlate(arrival);
                        self.dispatch(correlated);
                        if session.count_reached(count) {
                            return Outcome::Finished;
                        }
                    }
                    Some(Inbound::Failed(e)) => return Outcome::Failed(e),
                    None => {
                        return Outcome::Failed(PingError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "receiver stopped unexpectedly",
                        )));
                    }
                },
            }
        }
    }

    fn send_probe<E: Endpoint + ?Sized>(
        &self,
        endpoint: &E,
        matcher: Matcher,
        session: &mut Session,
    ) -> Result<(), PingError> {
        let sequence = session.next_sequence;
        let payload = icmp::build_payload(self.config.size, matcher.tracker, SystemTime::now())?;
        let message = icmp::encode_echo_request(
            matcher.family,
            matcher.identifier.unwrap_or(self.config.identifier),
            sequence,
            &payload,
            !endpoint.computes_checksum(),
        );

        endpoint.send_to(&message, self.addr)?;
        session.record_sent(sequence);
        log::debug!("Sent echo request seq={} ({} bytes) to {}", sequence, message.len(), self.addr);
        Ok(())
    }

    fn dispatch(&mut self, correlated: Correlated) {
        match correlated {
            Correlated::Reply(packet) => {
                log::debug!("Echo reply seq={} rtt={:?}", packet.seq, packet.rtt);
                if let Some(handler) = self.on_reply.as_mut() {
                    handler(&packet);
                }
            }
            Correlated::Duplicate(packet) => {
                log::debug!("Duplicate echo reply seq={}", packet.seq);
                if let Some(handler) = self.on_duplicate.as_mut() {
                    handler(&packet);
                }
            }
            Correlated::Unknown(seq) => {
                log::debug!("Discarding echo reply for unsent seq={}", seq);
            }
        }
    }
}

fn receive_loop<E: Endpoint + ?Sized>(
    endpoint: &E,
    matcher: Matcher,
    tx: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
    read_deadline: Duration,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    while !shutdown.is_cancelled() {
        let received = match endpoint.recv(&mut buf, Instant::now() + read_deadline) {
            Ok(received) => received,
            Err(PingError::Timeout) => continue,
            Err(PingError::Decode(reason)) => {
                log::debug!("Dropping malformed message: {}", reason);
                continue;
            }
            Err(e) => {
                if !shutdown.is_cancelled() {
                    let _ = tx.blocking_send(Inbound::Failed(e));
                }
                return;
            }
        };
        let received_at = SystemTime::now();

        let reply = match icmp::decode(&buf[..received.len], matcher.family) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                log::trace!("Ignoring non echo reply message from {}", received.peer);
                continue;
            }
            Err(e) => {
                log::debug!("Dropping message from {}: {}", received.peer, e);
                continue;
            }
        };
        if !matcher.accepts(&reply) {
            log::trace!("Ignoring echo reply id={} from another session", reply.identifier);
            continue;
        }

        let arrival = Arrival {
            reply,
            peer: received.peer,
            ttl: received.ttl,
            nbytes: received.len,
            received_at,
        };
        if tx.blocking_send(Inbound::Reply(arrival)).is_err() {
            return;
        }
    }
}
