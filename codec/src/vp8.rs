//! Sender-side VP8 payload descriptor (RFC 7741 section 4.2).
//!
//! We always emit the fixed X+I form: an extension byte announcing a
//! 15-bit picture id. The S bit is set on the first chunk of a frame
//! and the picture id advances once per frame.

pub const DESCRIPTOR_LEN: usize = 4;

pub fn descriptor(first: bool, picture_id: u16) -> [u8; DESCRIPTOR_LEN] {
    let mut byte0 = 0x80; // X: extension byte present
    if first {
        byte0 |= 0x10; // S: start of partition
    }
    [
        byte0,
        0x80, // I: picture id present
        0x80 | ((picture_id >> 8) as u8 & 0x7f),
        picture_id as u8,
    ]
}
