// RTP header construction and per-SSRC send state.
// Headers are built big-endian in place; sequence and timestamp wrap at
// their field widths and advance exactly once per emitted packet.

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_EXTENSION_HEADER_LEN: usize = 4;

// RTP header field offsets
const MARKER_PT_OFFSET: usize = 1;
const SEQUENCE_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 4;
const SSRC_OFFSET: usize = 8;

const EXTENSION_BIT: u8 = 0x10;
const MARKER_BIT: u8 = 0x80;

/// One-byte-header extension id for playout delay.
pub const PLAYOUT_DELAY_EXT_ID: u8 = 5;

/// Per-SSRC RTP send state.
pub struct RtpSession {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    total_packets: u32,
    total_bytes: u32,
}

impl RtpSession {
    pub fn new(ssrc: u32, payload_type: u8) -> RtpSession {
        let mut buffer = [0; 8];
        rand::thread_rng().fill_bytes(&mut buffer);
        let sequence = BigEndian::read_u16(&buffer[..2]) & 0x7fff;
        let timestamp = BigEndian::read_u32(&buffer[4..]) & 0xfffffff;
        Self::with_state(ssrc, payload_type, sequence, timestamp)
    }

    pub fn with_state(
        ssrc: u32,
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
    ) -> RtpSession {
        RtpSession {
            ssrc,
            payload_type,
            sequence,
            timestamp,
            total_packets: 0,
            total_bytes: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn total_packets(&self) -> u32 {
        self.total_packets
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    /// Build the 12-byte header for the next packet and advance the
    /// sequence number, wrapping at 16 bits.
    pub fn header(&mut self, marker: bool, extension: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION << 6;
        if extension {
            header[0] |= EXTENSION_BIT;
        }
        header[MARKER_PT_OFFSET] = self.payload_type & 0x7f;
        if marker {
            header[MARKER_PT_OFFSET] |= MARKER_BIT;
        }
        BigEndian::write_u16(&mut header[SEQUENCE_OFFSET..], self.sequence);
        BigEndian::write_u32(&mut header[TIMESTAMP_OFFSET..], self.timestamp);
        BigEndian::write_u32(&mut header[SSRC_OFFSET..], self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Advance the media clock, wrapping at 32 bits.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }

    pub fn record_sent(&mut self, packets: u32, bytes: u32) {
        self.total_packets = self.total_packets.wrapping_add(packets);
        self.total_bytes = self.total_bytes.wrapping_add(bytes);
    }
}

/// One-byte-form header extension block (RFC 5285) with the single
/// playout-delay entry: `{0xBE, 0xDE, count=1}` then a 4-byte slot of
/// `id|len` and the value as u24 big-endian.
pub fn playout_delay_extension(value: u32) -> [u8; 8] {
    let mut ext = [0u8; 8];
    ext[0] = 0xbe;
    ext[1] = 0xde;
    BigEndian::write_u16(&mut ext[2..4], 1);
    ext[4] = ((PLAYOUT_DELAY_EXT_ID & 0x0f) << 4) | ((2 - 1) & 0x0f);
    ext[5] = (value >> 16) as u8;
    ext[6] = (value >> 8) as u8;
    ext[7] = value as u8;
    ext
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut session = RtpSession::with_state(0x11223344, 101, 0x5566, 0x77889900);
        let header = session.header(true, true);
        assert_eq!(header[0], (2 << 6) | 0x10);
        assert_eq!(header[1], 101 | 0x80);
        assert_eq!(&header[2..4], &[0x55, 0x66]);
        assert_eq!(&header[4..8], &[0x77, 0x88, 0x99, 0x00]);
        assert_eq!(&header[8..12], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(session.sequence(), 0x5567);
    }

    #[test]
    fn test_header_no_marker_no_extension() {
        let mut session = RtpSession::with_state(1, 120, 0, 0);
        let header = session.header(false, false);
        assert_eq!(header[0], 2 << 6);
        assert_eq!(header[1], 120);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut session = RtpSession::with_state(1, 101, u16::MAX, 0);
        session.header(false, false);
        assert_eq!(session.sequence(), 0);
        session.header(false, false);
        assert_eq!(session.sequence(), 1);
    }

    #[test]
    fn test_sequence_advances_once_per_header() {
        let mut session = RtpSession::with_state(1, 101, 100, 0);
        for _ in 0..250 {
            session.header(false, true);
        }
        assert_eq!(session.sequence(), 350);
    }

    #[test]
    fn test_timestamp_wraps() {
        let mut session = RtpSession::with_state(1, 101, 0, u32::MAX - 1);
        session.advance_timestamp(3);
        assert_eq!(session.timestamp(), 1);
    }

    #[test]
    fn test_totals_wrap() {
        let mut session = RtpSession::with_state(1, 101, 0, 0);
        session.record_sent(2, u32::MAX);
        session.record_sent(1, 2);
        assert_eq!(session.total_packets(), 3);
        assert_eq!(session.total_bytes(), 1);
    }

    #[test]
    fn test_playout_delay_extension_layout() {
        let ext = playout_delay_extension(0);
        assert_eq!(&ext[..4], &[0xbe, 0xde, 0x00, 0x01]);
        assert_eq!(ext[4], (5 << 4) | 1);
        assert_eq!(&ext[5..], &[0, 0, 0]);

        let ext = playout_delay_extension(0x00a1b2c3);
        assert_eq!(&ext[5..], &[0xa1, 0xb2, 0xc3]);
    }
}
