pub mod h264;
pub mod h265;
pub mod nal;
pub mod params;
pub mod vp8;

use strum_macros::{self, EnumString};
use thiserror::Error;

/// Largest RTP payload we put in a single datagram.
pub const MTU: usize = 1200;

pub const OPUS_PAYLOAD_TYPE: u8 = 120;
pub const OPUS_CODEC_ID: &str = "A_OPUS";
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid configuration record")]
    InvalidConfigurationRecord,

    #[error("truncated nal unit")]
    TruncatedNal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, EnumString)]
pub enum VideoCodec {
    #[strum(serialize = "H264")]
    H264,
    #[strum(serialize = "H265")]
    H265,
    #[strum(serialize = "VP8")]
    Vp8,
    #[strum(serialize = "VP9")]
    Vp9,
    #[strum(serialize = "AV1")]
    Av1,
}

impl VideoCodec {
    /// Map a Matroska track codec id to a supported video codec.
    pub fn from_track_codec_id(id: &str) -> Option<VideoCodec> {
        match id {
            "V_MPEG4/ISO/AVC" => Some(VideoCodec::H264),
            "V_MPEGH/ISO/HEVC" => Some(VideoCodec::H265),
            "V_VP8" => Some(VideoCodec::Vp8),
            "V_VP9" => Some(VideoCodec::Vp9),
            "V_AV1" => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 101,
            VideoCodec::H265 => 103,
            VideoCodec::Vp8 => 105,
            VideoCodec::Vp9 => 107,
            VideoCodec::Av1 => 109,
        }
    }

    pub fn rtx_payload_type(&self) -> u8 {
        self.payload_type() + 1
    }

    /// Codecs carried as length-prefixed NAL units that need
    /// parameter-set handling and FU fragmentation.
    pub fn is_nal_based(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_codec_id_whitelist() {
        assert_eq!(
            VideoCodec::from_track_codec_id("V_MPEG4/ISO/AVC"),
            Some(VideoCodec::H264)
        );
        assert_eq!(
            VideoCodec::from_track_codec_id("V_MPEGH/ISO/HEVC"),
            Some(VideoCodec::H265)
        );
        assert_eq!(
            VideoCodec::from_track_codec_id("V_VP8"),
            Some(VideoCodec::Vp8)
        );
        assert_eq!(VideoCodec::from_track_codec_id("V_MS/VFW/FOURCC"), None);
        assert_eq!(VideoCodec::from_track_codec_id("V_THEORA"), None);
    }

    #[test]
    fn test_payload_types() {
        assert_eq!(VideoCodec::H264.payload_type(), 101);
        assert_eq!(VideoCodec::H264.rtx_payload_type(), 102);
        assert_eq!(VideoCodec::H265.payload_type(), 103);
        assert_eq!(VideoCodec::Vp8.payload_type(), 105);
        assert_eq!(VideoCodec::Vp9.payload_type(), 107);
        assert_eq!(VideoCodec::Av1.payload_type(), 109);
        assert_eq!(VideoCodec::Av1.rtx_payload_type(), 110);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(VideoCodec::H264.to_string(), "H264");
        assert_eq!(VideoCodec::Vp8.to_string(), "VP8");
        assert_eq!(VideoCodec::from_str("VP9").unwrap(), VideoCodec::Vp9);
    }
}
