use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::CodecError;

// H.264 NAL unit types
pub const H264_NAL_IDR: u8 = 5;
pub const H264_NAL_SPS: u8 = 7;
pub const H264_NAL_PPS: u8 = 8;
pub const H264_NAL_FU_A: u8 = 28;

// H.265 NAL unit types
pub const H265_NAL_IDR_W_RADL: u8 = 19;
pub const H265_NAL_IDR_N_LP: u8 = 20;
pub const H265_NAL_VPS: u8 = 32;
pub const H265_NAL_SPS: u8 = 33;
pub const H265_NAL_PPS: u8 = 34;
pub const H265_NAL_FU: u8 = 49;

const LENGTH_PREFIX_LEN: usize = 4;

/// Split a length-prefixed access unit into its NAL unit payloads.
/// Each entry on the wire is a u32 big-endian length followed by that
/// many payload bytes.
pub fn split(frame: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < frame.len() {
        if frame.len() - offset < LENGTH_PREFIX_LEN {
            return Err(CodecError::TruncatedNal);
        }
        let len = BigEndian::read_u32(&frame[offset..]) as usize;
        offset += LENGTH_PREFIX_LEN;
        if frame.len() - offset < len {
            return Err(CodecError::TruncatedNal);
        }
        units.push(Bytes::copy_from_slice(&frame[offset..offset + len]));
        offset += len;
    }
    Ok(units)
}

/// Re-merge NAL units into the length-prefixed form. `merge(split(x)) == x`
/// for any well-formed input.
pub fn merge<T: AsRef<[u8]>>(units: &[T]) -> Bytes {
    let total: usize = units
        .iter()
        .map(|u| LENGTH_PREFIX_LEN + u.as_ref().len())
        .sum();
    let mut out = BytesMut::with_capacity(total);
    for unit in units {
        let unit = unit.as_ref();
        out.put_u32(unit.len() as u32);
        out.extend_from_slice(unit);
    }
    out.freeze()
}

pub fn h264_unit_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

pub fn h265_unit_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| (b >> 1) & 0x3f).unwrap_or(0)
}

pub fn h264_is_idr(nal: &[u8]) -> bool {
    h264_unit_type(nal) == H264_NAL_IDR
}

pub fn h265_is_idr(nal: &[u8]) -> bool {
    let t = h265_unit_type(nal);
    t == H265_NAL_IDR_W_RADL || t == H265_NAL_IDR_N_LP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_merge_round_trip() {
        let frame = merge(&[vec![0x65, 1, 2, 3], vec![0x41], vec![]]);
        let units = split(&frame).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[0x65, 1, 2, 3]);
        assert_eq!(&units[1][..], &[0x41]);
        assert!(units[2].is_empty());
        assert_eq!(merge(&units), frame);
    }

    #[test]
    fn test_split_empty_frame() {
        assert!(split(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_split_truncated_prefix() {
        assert!(matches!(
            split(&[0, 0, 1]),
            Err(CodecError::TruncatedNal)
        ));
    }

    #[test]
    fn test_split_truncated_payload() {
        assert!(matches!(
            split(&[0, 0, 0, 4, 0xaa, 0xbb]),
            Err(CodecError::TruncatedNal)
        ));
    }

    #[test]
    fn test_unit_types() {
        assert_eq!(h264_unit_type(&[0x65]), 5);
        assert!(h264_is_idr(&[0x65]));
        assert!(!h264_is_idr(&[0x41]));
        // H.265 type sits in bits 1..6 of the first header byte
        assert_eq!(h265_unit_type(&[19 << 1, 0x01]), 19);
        assert!(h265_is_idr(&[19 << 1, 0x01]));
        assert!(h265_is_idr(&[20 << 1, 0x01]));
        assert!(!h265_is_idr(&[1 << 1, 0x01]));
        assert_eq!(h264_unit_type(&[]), 0);
    }
}
