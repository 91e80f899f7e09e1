// Bridge to the application gateway: the four typed events we consume
// and the four opcodes we hand back for the host to send on its own
// socket.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::stream_key::StreamKey;

pub mod app_opcode {
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const STREAM_CREATE: u8 = 18;
    pub const STREAM_DELETE: u8 = 19;
    pub const STREAM_SET_PAUSED: u8 = 22;
}

/// Events the host application pushes into the session.
#[derive(Debug, Clone, Deserialize)]
pub enum AppEvent {
    VoiceStateUpdate {
        user_id: String,
        session_id: String,
        #[serde(default)]
        guild_id: Option<String>,
        #[serde(default)]
        channel_id: Option<String>,
    },
    VoiceServerUpdate {
        #[serde(default)]
        guild_id: Option<String>,
        endpoint: String,
        token: String,
    },
    StreamCreate {
        stream_key: String,
        #[serde(default)]
        rtc_server_id: Option<String>,
    },
    StreamServerUpdate {
        stream_key: String,
        endpoint: String,
        token: String,
    },
}

/// An opcode for the host to forward to the application gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCommand {
    pub op: u8,
    pub d: Value,
}

pub fn join_voice(
    guild_id: Option<&str>,
    channel_id: &str,
) -> GatewayCommand {
    GatewayCommand {
        op: app_opcode::VOICE_STATE_UPDATE,
        d: json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": false,
            "self_deaf": true,
            "self_video": false,
        }),
    }
}

/// The all-null form used to leave; the field values are part of the
/// protocol contract and intentionally not symmetric with the join.
pub fn leave_voice() -> GatewayCommand {
    GatewayCommand {
        op: app_opcode::VOICE_STATE_UPDATE,
        d: json!({
            "guild_id": null,
            "channel_id": null,
            "self_mute": null,
            "self_deaf": null,
            "self_video": null,
        }),
    }
}

pub fn stream_create(key: &StreamKey) -> GatewayCommand {
    let d = match key {
        StreamKey::Guild {
            guild_id,
            channel_id,
            ..
        } => json!({
            "type": "guild",
            "guild_id": guild_id,
            "channel_id": channel_id,
            "preferred_region": null,
        }),
        StreamKey::Call { channel_id, .. } => json!({
            "type": "call",
            "guild_id": null,
            "channel_id": channel_id,
            "preferred_region": null,
        }),
    };
    GatewayCommand {
        op: app_opcode::STREAM_CREATE,
        d,
    }
}

pub fn stream_set_paused(key: &StreamKey, paused: bool) -> GatewayCommand {
    GatewayCommand {
        op: app_opcode::STREAM_SET_PAUSED,
        d: json!({
            "stream_key": key.to_string(),
            "paused": paused,
        }),
    }
}

pub fn stream_delete(key: &StreamKey) -> GatewayCommand {
    GatewayCommand {
        op: app_opcode::STREAM_DELETE,
        d: json!({
            "stream_key": key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guild_key() -> StreamKey {
        "guild:1:2:3".parse().unwrap()
    }

    #[test]
    fn test_join_voice_payload() {
        let command = join_voice(Some("1"), "2");
        assert_eq!(command.op, 4);
        assert_eq!(
            command.d,
            json!({
                "guild_id": "1",
                "channel_id": "2",
                "self_mute": false,
                "self_deaf": true,
                "self_video": false,
            })
        );
    }

    #[test]
    fn test_leave_voice_is_all_null() {
        let command = leave_voice();
        assert_eq!(command.op, 4);
        for field in [
            "guild_id",
            "channel_id",
            "self_mute",
            "self_deaf",
            "self_video",
        ] {
            assert!(command.d[field].is_null());
        }
    }

    #[test]
    fn test_stream_create_guild() {
        let command = stream_create(&guild_key());
        assert_eq!(command.op, 18);
        assert_eq!(command.d["type"], "guild");
        assert_eq!(command.d["guild_id"], "1");
        assert_eq!(command.d["channel_id"], "2");
        assert!(command.d["preferred_region"].is_null());
    }

    #[test]
    fn test_stream_create_call() {
        let key: StreamKey = "call:9:3".parse().unwrap();
        let command = stream_create(&key);
        assert_eq!(command.d["type"], "call");
        assert!(command.d["guild_id"].is_null());
        assert_eq!(command.d["channel_id"], "9");
    }

    #[test]
    fn test_stream_pause_and_delete_carry_key() {
        let key = guild_key();
        let pause = stream_set_paused(&key, false);
        assert_eq!(pause.op, 22);
        assert_eq!(pause.d["stream_key"], "guild:1:2:3");
        assert_eq!(pause.d["paused"], false);

        let delete = stream_delete(&key);
        assert_eq!(delete.op, 19);
        assert_eq!(delete.d["stream_key"], "guild:1:2:3");
    }
}
