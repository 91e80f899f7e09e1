// RTCP Sender Report construction. The report is the only control
// packet we originate; its 20-byte body is sealed with the 8-byte
// header as associated data and the truncated nonce appended, the same
// framing the RTP path uses.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};

pub const SR_HEADER_LEN: usize = 8;
pub const SR_BODY_LEN: usize = 20;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Fixed sender-report header: version 2, packet type 200, length 6
/// 32-bit words, followed by the sender SSRC.
pub fn sender_report_header(ssrc: u32) -> [u8; SR_HEADER_LEN] {
    let mut header = [0x80, 0xc8, 0x00, 0x06, 0, 0, 0, 0];
    BigEndian::write_u32(&mut header[4..], ssrc);
    header
}

pub fn sender_report_body(
    now: SystemTime,
    rtp_timestamp: u32,
    packet_count: u32,
    byte_count: u32,
) -> [u8; SR_BODY_LEN] {
    let since_epoch = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let (ntp_seconds, ntp_fraction) = ntp_timestamp(since_epoch);

    let mut body = [0u8; SR_BODY_LEN];
    BigEndian::write_u32(&mut body[0..], ntp_seconds);
    BigEndian::write_u32(&mut body[4..], ntp_fraction);
    BigEndian::write_u32(&mut body[8..], rtp_timestamp);
    BigEndian::write_u32(&mut body[12..], packet_count);
    BigEndian::write_u32(&mut body[16..], byte_count);
    body
}

/// NTP short-format timestamp. The fraction rounds toward 2^32 for
/// sub-nanosecond remainders and must be clamped into the field.
fn ntp_timestamp(since_epoch: Duration) -> (u32, u32) {
    let seconds = (since_epoch.as_secs() + NTP_UNIX_OFFSET) as u32;
    let fraction =
        (since_epoch.subsec_nanos() as f64 / 1e9 * 4_294_967_296.0).round();
    let fraction = if fraction >= u32::MAX as f64 {
        u32::MAX
    } else {
        fraction as u32
    };
    (seconds, fraction)
}
