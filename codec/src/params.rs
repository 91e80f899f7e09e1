use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::nal::{
    self, H265_NAL_PPS, H265_NAL_SPS, H265_NAL_VPS,
};
use crate::{CodecError, VideoCodec};

/// Parameter sets lifted from a track's codec-private configuration
/// record, re-injected in front of key frames that arrive without them.
#[derive(Debug, Clone, Default)]
pub struct H264ParameterSets {
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct H265ParameterSets {
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub enum ParameterSets {
    H264(H264ParameterSets),
    H265(H265ParameterSets),
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::InvalidConfigurationRecord);
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(take(buf, 1)?[0])
}

fn take_nalus(buf: &mut &[u8], count: usize) -> Result<Vec<Bytes>, CodecError> {
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        let len = BigEndian::read_u16(take(buf, 2)?) as usize;
        units.push(Bytes::copy_from_slice(take(buf, len)?));
    }
    Ok(units)
}

impl ParameterSets {
    /// Parse the codec-private data of a track once. VP8/VP9/AV1 carry no
    /// parameter sets and yield `None`.
    pub fn parse(
        codec: VideoCodec,
        private: Option<&[u8]>,
    ) -> Result<Option<ParameterSets>, CodecError> {
        match codec {
            VideoCodec::H264 => {
                let private =
                    private.ok_or(CodecError::InvalidConfigurationRecord)?;
                Ok(Some(ParameterSets::H264(parse_avcc(private)?)))
            }
            VideoCodec::H265 => {
                let private =
                    private.ok_or(CodecError::InvalidConfigurationRecord)?;
                Ok(Some(ParameterSets::H265(parse_hvcc(private)?)))
            }
            _ => Ok(None),
        }
    }

    /// Prepend missing parameter sets to an access unit that carries an IDR
    /// NAL. Non-IDR frames and frames that already carry their sets pass
    /// through untouched, so applying this twice equals applying it once.
    pub fn inject(&self, frame: &[u8]) -> Result<Bytes, CodecError> {
        let units = nal::split(frame)?;
        match self {
            ParameterSets::H264(sets) => {
                let mut is_idr = false;
                let mut has_sps = false;
                let mut has_pps = false;
                for unit in &units {
                    match nal::h264_unit_type(unit) {
                        nal::H264_NAL_IDR => is_idr = true,
                        nal::H264_NAL_SPS => has_sps = true,
                        nal::H264_NAL_PPS => has_pps = true,
                        _ => {}
                    }
                }
                if !is_idr || (has_sps && has_pps) {
                    return Ok(Bytes::copy_from_slice(frame));
                }
                let mut merged: Vec<Bytes> = Vec::new();
                if !has_sps {
                    merged.extend(sets.sps.iter().cloned());
                }
                if !has_pps {
                    merged.extend(sets.pps.iter().cloned());
                }
                merged.extend(units);
                Ok(nal::merge(&merged))
            }
            ParameterSets::H265(sets) => {
                let mut is_idr = false;
                let mut has_vps = false;
                let mut has_sps = false;
                let mut has_pps = false;
                for unit in &units {
                    match nal::h265_unit_type(unit) {
                        H265_NAL_VPS => has_vps = true,
                        H265_NAL_SPS => has_sps = true,
                        H265_NAL_PPS => has_pps = true,
                        t if t == nal::H265_NAL_IDR_W_RADL
                            || t == nal::H265_NAL_IDR_N_LP =>
                        {
                            is_idr = true
                        }
                        _ => {}
                    }
                }
                if !is_idr || (has_vps && has_sps && has_pps) {
                    return Ok(Bytes::copy_from_slice(frame));
                }
                let mut merged: Vec<Bytes> = Vec::new();
                if !has_vps {
                    merged.extend(sets.vps.iter().cloned());
                }
                if !has_sps {
                    merged.extend(sets.sps.iter().cloned());
                }
                if !has_pps {
                    merged.extend(sets.pps.iter().cloned());
                }
                merged.extend(units);
                Ok(nal::merge(&merged))
            }
        }
    }
}

/// avcC layout: version, profile, compatibility, level, lengthSize,
/// then `0xE0 | sps_count` and the length-prefixed sets.
fn parse_avcc(data: &[u8]) -> Result<H264ParameterSets, CodecError> {
    if data.first() != Some(&1) {
        return Err(CodecError::InvalidConfigurationRecord);
    }
    let mut buf = data;
    take(&mut buf, 5)?;
    let sps_count = (take_u8(&mut buf)? & 0x1f) as usize;
    let sps = take_nalus(&mut buf, sps_count)?;
    let pps_count = take_u8(&mut buf)? as usize;
    let pps = take_nalus(&mut buf, pps_count)?;
    Ok(H264ParameterSets { sps, pps })
}

/// hvcC: 22 bytes of profile/level/flags, then `num_arrays` arrays of
/// `0b10xxxxxx | nalu_type`, u16 count, and length-prefixed NALs.
fn parse_hvcc(data: &[u8]) -> Result<H265ParameterSets, CodecError> {
    if data.first() != Some(&1) {
        return Err(CodecError::InvalidConfigurationRecord);
    }
    let mut buf = data;
    take(&mut buf, 22)?;
    let num_arrays = take_u8(&mut buf)? as usize;
    let mut sets = H265ParameterSets::default();
    for _ in 0..num_arrays {
        let nalu_type = take_u8(&mut buf)? & 0x3f;
        let count = BigEndian::read_u16(take(&mut buf, 2)?) as usize;
        let units = take_nalus(&mut buf, count)?;
        match nalu_type {
            H265_NAL_VPS => sets.vps.extend(units),
            H265_NAL_SPS => sets.sps.extend(units),
            H265_NAL_PPS => sets.pps.extend(units),
            _ => {}
        }
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];

    fn avcc_record() -> Vec<u8> {
        let mut record = vec![1, 0x42, 0x00, 0x1e, 0xff];
        record.push(0xe0 | 1);
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(SPS);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(PPS);
        record
    }

    #[test]
    fn test_parse_avcc() {
        let sets = parse_avcc(&avcc_record()).unwrap();
        assert_eq!(sets.sps.len(), 1);
        assert_eq!(&sets.sps[0][..], SPS);
        assert_eq!(sets.pps.len(), 1);
        assert_eq!(&sets.pps[0][..], PPS);
    }

    #[test]
    fn test_avcc_bad_version() {
        let mut record = avcc_record();
        record[0] = 0;
        assert!(matches!(
            parse_avcc(&record),
            Err(CodecError::InvalidConfigurationRecord)
        ));
    }

    #[test]
    fn test_inject_prepends_sets_before_idr() {
        let sets = ParameterSets::H264(parse_avcc(&avcc_record()).unwrap());
        let idr = vec![0x65u8, 0x88, 0x84, 0x00];
        let frame = nal::merge(&[idr.clone()]);
        let injected = sets.inject(&frame).unwrap();
        let units = nal::split(&injected).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], SPS);
        assert_eq!(&units[1][..], PPS);
        assert_eq!(&units[2][..], &idr[..]);
    }

    #[test]
    fn test_inject_is_idempotent() {
        let sets = ParameterSets::H264(parse_avcc(&avcc_record()).unwrap());
        let frame = nal::merge(&[vec![0x65u8, 0x88]]);
        let once = sets.inject(&frame).unwrap();
        let twice = sets.inject(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_inject_skips_non_idr() {
        let sets = ParameterSets::H264(parse_avcc(&avcc_record()).unwrap());
        let frame = nal::merge(&[vec![0x41u8, 0x9a]]);
        assert_eq!(sets.inject(&frame).unwrap(), frame);
    }

    fn hvcc_record() -> Vec<u8> {
        let mut record = vec![1u8];
        record.extend_from_slice(&[0u8; 21]);
        record.push(3); // num_arrays
        for (nalu_type, payload) in [
            (32u8, vec![0x40u8, 0x01, 0x0c]),
            (33, vec![0x42, 0x01, 0x01]),
            (34, vec![0x44, 0x01, 0xc0]),
        ] {
            record.push(0x80 | nalu_type);
            record.extend_from_slice(&1u16.to_be_bytes());
            record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            record.extend_from_slice(&payload);
        }
        record
    }

    #[test]
    fn test_parse_hvcc() {
        let sets = parse_hvcc(&hvcc_record()).unwrap();
        assert_eq!(sets.vps.len(), 1);
        assert_eq!(sets.sps.len(), 1);
        assert_eq!(sets.pps.len(), 1);
        assert_eq!(&sets.vps[0][..], &[0x40, 0x01, 0x0c]);
    }

    #[test]
    fn test_hvcc_inject_order() {
        let sets = ParameterSets::H265(parse_hvcc(&hvcc_record()).unwrap());
        // IDR_W_RADL access unit without parameter sets
        let idr = vec![19u8 << 1, 0x01, 0xaf];
        let frame = nal::merge(&[idr.clone()]);
        let units = nal::split(&sets.inject(&frame).unwrap()).unwrap();
        assert_eq!(units.len(), 4);
        assert_eq!(nal::h265_unit_type(&units[0]), 32);
        assert_eq!(nal::h265_unit_type(&units[1]), 33);
        assert_eq!(nal::h265_unit_type(&units[2]), 34);
        assert_eq!(&units[3][..], &idr[..]);
    }
}
