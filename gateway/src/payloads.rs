// Voice-gateway v8 opcode payloads, shaped exactly as the service
// expects them on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use codec::{VideoCodec, OPUS_PAYLOAD_TYPE};

pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const VIDEO: u8 = 12;
}

pub mod speaking {
    pub const NONE: u8 = 0;
    pub const MICROPHONE: u8 = 1;
    pub const SOUNDSHARE: u8 = 2;
}

/// The single simulcast layer we advertise.
pub const STREAM_RID: &str = "100";
pub const STREAM_QUALITY: u8 = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl GatewayMessage {
    pub fn new(op: u8, d: Value) -> GatewayMessage {
        GatewayMessage { op, d, seq: None }
    }
}

#[derive(Debug, Serialize)]
pub struct Identify<'a> {
    pub server_id: &'a str,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub token: &'a str,
    pub video: bool,
    pub streams: Vec<IdentifyStream>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyStream {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub rid: &'static str,
    pub quality: u8,
}

impl IdentifyStream {
    pub fn screen() -> IdentifyStream {
        IdentifyStream {
            kind: "screen",
            rid: STREAM_RID,
            quality: STREAM_QUALITY,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Resume<'a> {
    pub server_id: &'a str,
    pub session_id: &'a str,
    pub token: &'a str,
    pub seq_ack: i64,
}

#[derive(Debug, Serialize)]
pub struct Heartbeat {
    pub t: i64,
    pub seq_ack: i64,
}

#[derive(Debug, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
    #[serde(default)]
    pub streams: Vec<ReadyStream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyStream {
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub rtx_ssrc: u32,
    #[serde(default)]
    pub rid: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct SelectProtocol {
    pub protocol: &'static str,
    pub codecs: Vec<CodecDescription>,
    pub data: ProtocolData,
}

#[derive(Debug, Serialize)]
pub struct ProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Serialize)]
pub struct CodecDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub priority: u16,
    pub payload_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx_payload_type: Option<u8>,
}

impl CodecDescription {
    /// The fixed payload-type table: Opus plus the negotiated video
    /// codec with its RTX twin.
    pub fn list(video: VideoCodec) -> Vec<CodecDescription> {
        vec![
            CodecDescription {
                name: "opus".to_string(),
                kind: "audio",
                priority: 1000,
                payload_type: OPUS_PAYLOAD_TYPE,
                rtx_payload_type: None,
            },
            CodecDescription {
                name: video.to_string(),
                kind: "video",
                priority: 1000,
                payload_type: video.payload_type(),
                rtx_payload_type: Some(video.rtx_payload_type()),
            },
        ]
    }
}

#[derive(Debug, Serialize)]
pub struct Speaking {
    pub delay: u32,
    pub speaking: u8,
    pub ssrc: u32,
}

#[derive(Debug, Serialize)]
pub struct Video {
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub rtx_ssrc: u32,
    pub streams: Vec<VideoStream>,
}

#[derive(Debug, Serialize)]
pub struct VideoStream {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub rid: &'static str,
    pub ssrc: u32,
    pub active: bool,
    pub quality: u8,
    pub rtx_ssrc: u32,
    pub max_bitrate: u32,
    pub max_framerate: u32,
    pub max_resolution: Resolution,
}

#[derive(Debug, Serialize)]
pub struct Resolution {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Advertised properties of the one active video layer.
#[derive(Debug, Clone, Copy)]
pub struct VideoLayer {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
}

impl Video {
    pub fn active(
        audio_ssrc: u32,
        video_ssrc: u32,
        rtx_ssrc: u32,
        layer: VideoLayer,
    ) -> Video {
        Video {
            audio_ssrc,
            video_ssrc,
            rtx_ssrc,
            streams: vec![VideoStream {
                kind: "video",
                rid: STREAM_RID,
                ssrc: video_ssrc,
                active: true,
                quality: STREAM_QUALITY,
                rtx_ssrc,
                max_bitrate: layer.bitrate,
                max_framerate: layer.framerate,
                max_resolution: Resolution {
                    kind: "fixed",
                    width: layer.width,
                    height: layer.height,
                },
            }],
        }
    }

    pub fn deactivated(audio_ssrc: u32) -> Video {
        Video {
            audio_ssrc,
            video_ssrc: 0,
            rtx_ssrc: 0,
            streams: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identify_shape() {
        let identify = Identify {
            server_id: "g1",
            user_id: "u1",
            session_id: "s1",
            token: "t1",
            video: true,
            streams: vec![IdentifyStream::screen()],
        };
        let value = serde_json::to_value(&identify).unwrap();
        assert_eq!(
            value,
            json!({
                "server_id": "g1",
                "user_id": "u1",
                "session_id": "s1",
                "token": "t1",
                "video": true,
                "streams": [{"type": "screen", "rid": "100", "quality": 100}],
            })
        );
    }

    #[test]
    fn test_resume_echoes_seq_ack() {
        let resume = Resume {
            server_id: "g1",
            session_id: "s1",
            token: "t1",
            seq_ack: 42,
        };
        let value = serde_json::to_value(&resume).unwrap();
        assert_eq!(value["seq_ack"], 42);
        assert_eq!(value["server_id"], "g1");
    }

    #[test]
    fn test_ready_parses_streams() {
        let ready: Ready = serde_json::from_value(json!({
            "ssrc": 11,
            "ip": "5.6.7.8",
            "port": 443,
            "modes": ["aead_aes256_gcm_rtpsize", "aead_xchacha20_poly1305_rtpsize"],
            "streams": [{"ssrc": 22, "rtx_ssrc": 23, "rid": "100", "active": false}],
            "experiments": ["x"],
        }))
        .unwrap();
        assert_eq!(ready.ssrc, 11);
        assert_eq!(ready.streams[0].ssrc, 22);
        assert_eq!(ready.streams[0].rtx_ssrc, 23);
    }

    #[test]
    fn test_codec_list_payload_types() {
        let codecs = CodecDescription::list(VideoCodec::H264);
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0].name, "opus");
        assert_eq!(codecs[0].payload_type, 120);
        assert_eq!(codecs[1].name, "H264");
        assert_eq!(codecs[1].payload_type, 101);
        assert_eq!(codecs[1].rtx_payload_type, Some(102));
    }

    #[test]
    fn test_video_deactivated_form() {
        let value =
            serde_json::to_value(Video::deactivated(99)).unwrap();
        assert_eq!(
            value,
            json!({
                "audio_ssrc": 99,
                "video_ssrc": 0,
                "rtx_ssrc": 0,
                "streams": [],
            })
        );
    }

    #[test]
    fn test_video_active_form() {
        let video = Video::active(
            1,
            2,
            3,
            VideoLayer {
                width: 1920,
                height: 1080,
                framerate: 30,
                bitrate: 2_500_000,
            },
        );
        let value = serde_json::to_value(&video).unwrap();
        let stream = &value["streams"][0];
        assert_eq!(stream["type"], "video");
        assert_eq!(stream["rid"], "100");
        assert_eq!(stream["active"], true);
        assert_eq!(stream["max_resolution"]["type"], "fixed");
        assert_eq!(stream["max_resolution"]["width"], 1920);
    }

    #[test]
    fn test_gateway_message_seq_roundtrip() {
        let message: GatewayMessage = serde_json::from_value(json!({
            "op": 5,
            "d": {"speaking": 2},
            "seq": 17,
        }))
        .unwrap();
        assert_eq!(message.op, 5);
        assert_eq!(message.seq, Some(17));

        // outbound messages never serialize a seq field
        let out = GatewayMessage::new(3, json!({"t": 1}));
        let text = serde_json::to_string(&out).unwrap();
        assert!(!text.contains("seq"));
    }
}
