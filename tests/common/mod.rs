//! In-memory ICMP endpoint for driving the engine without sockets

use byteorder::{BigEndian, ByteOrder};
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use vrfping::icmp::{IcmpPacket, TIMESTAMP_LEN};
use vrfping::{Endpoint, IpFamily, PingError, Received};

/// How the loopback answers one echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// No reply, the probe is lost.
    Drop,
    /// `n` identical replies.
    Echo(usize),
    /// A reply carrying a different identifier.
    ForeignIdentifier,
    /// A reply carrying a different payload tracker.
    ForeignTracker,
    /// One reply, held back until after the next request's replies.
    Hold,
}

type Script = Box<dyn Fn(u16) -> Reply + Send + Sync>;
type Delay = Box<dyn Fn(u16) -> Duration + Send + Sync>;

/// Echoes requests back as replies, shaped by a per-sequence script.
pub struct LoopbackEndpoint {
    family: IpFamily,
    peer: IpAddr,
    /// Identifier the "kernel" forces onto every reply, like Linux datagram sockets.
    kernel_identifier: Option<u16>,
    script: Script,
    /// Pretend each reply took this long, by backdating its embedded timestamp.
    delay: Delay,
    queue: Mutex<VecDeque<Vec<u8>>>,
    held: Mutex<Vec<Vec<u8>>>,
    ready: Condvar,
    sends: AtomicUsize,
    fail_after_sends: Option<usize>,
    recv_broken: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackEndpoint {
    pub fn new(script: impl Fn(u16) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            family: IpFamily::V4,
            peer: "127.0.0.1".parse().unwrap(),
            kernel_identifier: None,
            script: Box::new(script),
            delay: Box::new(|_| Duration::ZERO),
            queue: Mutex::new(VecDeque::new()),
            held: Mutex::new(Vec::new()),
            ready: Condvar::new(),
            sends: AtomicUsize::new(0),
            fail_after_sends: None,
            recv_broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn echo_all() -> Self {
        Self::new(|_| Reply::Echo(1))
    }

    pub fn silent() -> Self {
        Self::new(|_| Reply::Drop)
    }

    pub fn with_delay(mut self, delay: impl Fn(u16) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    pub fn with_kernel_identifier(mut self, identifier: u16) -> Self {
        self.kernel_identifier = Some(identifier);
        self
    }

    pub fn failing_after(mut self, sends: usize) -> Self {
        self.fail_after_sends = Some(sends);
        self
    }

    pub fn ipv6(mut self) -> Self {
        self.family = IpFamily::V6;
        self.peer = "::1".parse().unwrap();
        self
    }

    /// Makes every later `recv` fail with a hard I/O error.
    pub fn break_receiver(&self) {
        self.recv_broken.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    /// Queues raw bytes as if they had arrived from the network.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.queue.lock().unwrap().push_back(bytes);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &IcmpPacket) -> Vec<Vec<u8>> {
        let mut reply = request.clone();
        reply.icmp_type = self.family.echo_reply_type();
        if let Some(id) = self.kernel_identifier {
            reply.identifier = id;
        }

        let delay = (self.delay)(request.sequence);
        if !delay.is_zero() && reply.payload.len() >= TIMESTAMP_LEN {
            let sent = UNIX_EPOCH + Duration::from_nanos(BigEndian::read_u64(&reply.payload[..TIMESTAMP_LEN]));
            let backdated = (sent - delay).duration_since(UNIX_EPOCH).unwrap();
            BigEndian::write_u64(&mut reply.payload[..TIMESTAMP_LEN], backdated.as_nanos() as u64);
        }

        let copies = match (self.script)(request.sequence) {
            Reply::Drop => 0,
            Reply::Echo(n) => n,
            Reply::Hold => 1,
            Reply::ForeignIdentifier => {
                reply.identifier = reply.identifier.wrapping_add(1);
                1
            }
            Reply::ForeignTracker => {
                reply.payload[TIMESTAMP_LEN] ^= 0xFF;
                1
            }
        };

        reply.calculate_checksum();
        vec![reply.to_bytes(); copies]
    }
}

impl Endpoint for LoopbackEndpoint {
    fn family(&self) -> IpFamily {
        self.family
    }

    fn identifier(&self, requested: u16) -> Option<u16> {
        Some(self.kernel_identifier.unwrap_or(requested))
    }

    fn computes_checksum(&self) -> bool {
        false
    }

    fn send_to(&self, message: &[u8], _destination: IpAddr) -> Result<usize, PingError> {
        let sent = self.sends.fetch_add(1, Ordering::SeqCst);
        if self.fail_after_sends.is_some_and(|limit| sent >= limit) {
            return Err(PingError::Io(io::Error::new(io::ErrorKind::NetworkDown, "link down")));
        }

        let request = IcmpPacket::from_bytes(message)?;
        assert_eq!(request.icmp_type, self.family.echo_request_type());
        assert!(request.verify_checksum(), "request checksum must be valid");

        let replies = self.reply_for(&request);
        let released = std::mem::take(&mut *self.held.lock().unwrap());
        {
            let mut queue = self.queue.lock().unwrap();
            if (self.script)(request.sequence) == Reply::Hold {
                self.held.lock().unwrap().extend(replies);
            } else {
                queue.extend(replies);
            }
            queue.extend(released);
        }
        self.ready.notify_all();
        Ok(message.len())
    }

    fn recv(&self, buf: &mut [u8], deadline: Instant) -> Result<Received, PingError> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if self.recv_broken.load(Ordering::SeqCst) || self.is_closed() {
                return Err(PingError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, "receive failed")));
            }
            if let Some(message) = queue.pop_front() {
                buf[..message.len()].copy_from_slice(&message);
                return Ok(Received {
                    len: message.len(),
                    peer: self.peer,
                    ttl: Some(64),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PingError::Timeout);
            }
            queue = self.ready.wait_timeout(queue, deadline - now).unwrap().0;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

