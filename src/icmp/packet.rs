use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::IpFamily;
use crate::error::PingError;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

pub const ICMP_HEADER_LEN: usize = 8;

/// Send time, big-endian nanoseconds since the UNIX epoch.
pub const TIMESTAMP_LEN: usize = 8;
/// Per-session random tag written right after the timestamp.
pub const TRACKER_LEN: usize = 8;
pub const MIN_PAYLOAD_SIZE: usize = TIMESTAMP_LEN + TRACKER_LEN;
/// Largest payload that fits an IPv4 datagram after the IP and ICMP headers.
pub const MAX_PAYLOAD_SIZE: usize = 65507;

const FILLER: u8 = 0x61;

#[derive(Debug, Clone)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn echo_request(family: IpFamily, identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            icmp_type: family.echo_request_type(),
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PingError> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(PingError::Decode("ICMP message shorter than its header"));
        }

        let truncated = |_| PingError::Decode("truncated ICMP header");
        let mut cursor = Cursor::new(data);
        let icmp_type = cursor.read_u8().map_err(truncated)?;
        let code = cursor.read_u8().map_err(truncated)?;
        let checksum = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        let identifier = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        let sequence = cursor.read_u16::<BigEndian>().map_err(truncated)?;

        let mut payload = Vec::with_capacity(data.len() - ICMP_HEADER_LEN);
        cursor.read_to_end(&mut payload).map_err(truncated)?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ICMP_HEADER_LEN + self.payload.len()];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        BigEndian::write_u16(&mut bytes[4..6], self.identifier);
        BigEndian::write_u16(&mut bytes[6..8], self.sequence);
        bytes[ICMP_HEADER_LEN..].copy_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    pub fn is_echo_reply(&self, family: IpFamily) -> bool {
        self.icmp_type == family.echo_reply_type() && self.code == 0
    }

    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }
}

/// RFC 1071 Internet checksum.
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Builds an echo payload of `size` bytes: timestamp, tracker, then filler.
pub fn build_payload(size: usize, tracker: u64, sent_at: SystemTime) -> Result<Vec<u8>, PingError> {
    validate_payload_size(size)?;

    let nanos = sent_at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| PingError::Encode("system clock is before the UNIX epoch".to_string()))?
        .as_nanos() as u64;

    let mut payload = vec![FILLER; size];
    BigEndian::write_u64(&mut payload[..TIMESTAMP_LEN], nanos);
    BigEndian::write_u64(&mut payload[TIMESTAMP_LEN..MIN_PAYLOAD_SIZE], tracker);
    Ok(payload)
}

pub fn validate_payload_size(size: usize) -> Result<(), PingError> {
    if size < MIN_PAYLOAD_SIZE {
        return Err(PingError::Encode(format!(
            "payload size {} is below the {} bytes needed for timestamp and tracker",
            size, MIN_PAYLOAD_SIZE
        )));
    }
    if size > MAX_PAYLOAD_SIZE {
        return Err(PingError::Encode(format!(
            "payload size {} exceeds the maximum of {} bytes",
            size, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

/// Encodes an Echo Request. The checksum is left zero when the socket fills it in.
pub fn encode_echo_request(
    family: IpFamily,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    with_checksum: bool,
) -> Vec<u8> {
    let mut packet = IcmpPacket::echo_request(family, identifier, sequence, payload.to_vec());
    if with_checksum {
        packet.calculate_checksum();
    }
    packet.to_bytes()
}

/// The fields of an inbound Echo Reply the engine correlates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub sent_at: SystemTime,
    /// Absent when the peer echoed a payload too short to carry one.
    pub tracker: Option<u64>,
    pub len: usize,
}

impl EchoReply {
    pub fn rtt(&self, received_at: SystemTime) -> Duration {
        received_at
            .duration_since(self.sent_at)
            .unwrap_or(Duration::ZERO)
    }
}

/// Decodes a bare ICMP message.
///
/// Returns `Ok(None)` for anything that is not an Echo Reply of `family`:
/// those are other traffic, not errors.
pub fn decode(data: &[u8], family: IpFamily) -> Result<Option<EchoReply>, PingError> {
    let packet = IcmpPacket::from_bytes(data)?;
    if !packet.is_echo_reply(family) {
        return Ok(None);
    }

    if packet.payload.len() < TIMESTAMP_LEN {
        return Err(PingError::Decode("echo payload too short for a timestamp"));
    }

    let nanos = BigEndian::read_u64(&packet.payload[..TIMESTAMP_LEN]);
    let tracker = (packet.payload.len() >= MIN_PAYLOAD_SIZE)
        .then(|| BigEndian::read_u64(&packet.payload[TIMESTAMP_LEN..MIN_PAYLOAD_SIZE]));

    Ok(Some(EchoReply {
        identifier: packet.identifier,
        sequence: packet.sequence,
        sent_at: UNIX_EPOCH + Duration::from_nanos(nanos),
        tracker,
        len: data.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_bytes(family: IpFamily, identifier: u16, sequence: u16, payload: Vec<u8>) -> Vec<u8> {
        let mut packet = IcmpPacket::echo_request(family, identifier, sequence, payload);
        packet.icmp_type = family.echo_reply_type();
        packet.calculate_checksum();
        packet.to_bytes()
    }

    #[test]
    fn test_echo_request_layout() {
        let payload = build_payload(32, 0xDEAD_BEEF, UNIX_EPOCH + Duration::from_secs(5)).unwrap();
        let bytes = encode_echo_request(IpFamily::V4, 1234, 7, &payload, true);

        assert_eq!(bytes.len(), ICMP_HEADER_LEN + 32);
        assert_eq!(bytes[0], ICMP_ECHO_REQUEST);
        assert_eq!(bytes[1], 0);
        assert_eq!(BigEndian::read_u16(&bytes[4..6]), 1234);
        assert_eq!(BigEndian::read_u16(&bytes[6..8]), 7);
        assert_eq!(BigEndian::read_u64(&bytes[8..16]), 5_000_000_000);
        assert_eq!(BigEndian::read_u64(&bytes[16..24]), 0xDEAD_BEEF);
        assert!(bytes[24..].iter().all(|&b| b == FILLER));
        assert_eq!(compute_checksum(&bytes), 0);
    }

    #[test]
    fn test_icmpv6_request_leaves_checksum_to_kernel() {
        let payload = build_payload(16, 1, SystemTime::now()).unwrap();
        let bytes = encode_echo_request(IpFamily::V6, 1, 1, &payload, false);
        assert_eq!(bytes[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&bytes[2..4], &[0, 0]);
    }

    #[test]
    fn test_checksum_odd_length() {
        let mut packet = IcmpPacket::echo_request(IpFamily::V4, 1, 1, vec![1, 2, 3]);
        packet.calculate_checksum();
        assert!(packet.verify_checksum());
        assert_eq!(compute_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_payload_size_bounds() {
        assert!(matches!(build_payload(15, 0, SystemTime::now()), Err(PingError::Encode(_))));
        assert!(matches!(build_payload(MAX_PAYLOAD_SIZE + 1, 0, SystemTime::now()), Err(PingError::Encode(_))));
        assert_eq!(build_payload(MIN_PAYLOAD_SIZE, 0, SystemTime::now()).unwrap().len(), 16);
    }

    #[test]
    fn test_decode_reply_and_rtt() {
        let sent_at = UNIX_EPOCH + Duration::from_millis(1_000);
        let payload = build_payload(24, 99, sent_at).unwrap();
        let bytes = reply_bytes(IpFamily::V4, 42, 3, payload);

        let reply = decode(&bytes, IpFamily::V4).unwrap().unwrap();
        assert_eq!(reply.identifier, 42);
        assert_eq!(reply.sequence, 3);
        assert_eq!(reply.tracker, Some(99));
        assert_eq!(reply.len, 32);
        assert_eq!(reply.rtt(sent_at + Duration::from_millis(12)), Duration::from_millis(12));
        assert_eq!(reply.rtt(sent_at - Duration::from_millis(1)), Duration::ZERO);
    }

    #[test]
    fn test_decode_ignores_requests_and_other_family() {
        let payload = build_payload(16, 0, SystemTime::now()).unwrap();
        let request = encode_echo_request(IpFamily::V4, 1, 1, &payload, true);
        assert_eq!(decode(&request, IpFamily::V4).unwrap(), None);

        let v6_reply = reply_bytes(IpFamily::V6, 1, 1, payload);
        assert_eq!(decode(&v6_reply, IpFamily::V4).unwrap(), None);
        assert!(decode(&v6_reply, IpFamily::V6).unwrap().is_some());
    }

    #[test]
    fn test_decode_ignores_destination_unreachable() {
        // Type 3 code 1, followed by a quoted header
        let mut bytes = vec![3, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0x45; 28]);
        assert_eq!(decode(&bytes, IpFamily::V4).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode(&[0, 0, 0], IpFamily::V4), Err(PingError::Decode(_))));

        let short = reply_bytes(IpFamily::V4, 1, 1, vec![0; 4]);
        assert!(matches!(decode(&short, IpFamily::V4), Err(PingError::Decode(_))));
    }

    #[test]
    fn test_decode_without_tracker() {
        let bytes = reply_bytes(IpFamily::V4, 1, 1, vec![0; TIMESTAMP_LEN]);
        let reply = decode(&bytes, IpFamily::V4).unwrap().unwrap();
        assert_eq!(reply.tracker, None);
        assert_eq!(reply.sent_at, UNIX_EPOCH);
    }
}
