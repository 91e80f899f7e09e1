use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// Identifier of a Go Live broadcast:
/// `guild:<guildId>:<channelId>:<userId>` or `call:<channelId>:<userId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKey {
    Guild {
        guild_id: String,
        channel_id: String,
        user_id: String,
    },
    Call {
        channel_id: String,
        user_id: String,
    },
}

impl StreamKey {
    /// The id the voice gateway identifies with: the guild, or the
    /// channel for calls.
    pub fn server_id(&self) -> &str {
        match self {
            StreamKey::Guild { guild_id, .. } => guild_id,
            StreamKey::Call { channel_id, .. } => channel_id,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            StreamKey::Guild { channel_id, .. } => channel_id,
            StreamKey::Call { channel_id, .. } => channel_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            StreamKey::Guild { user_id, .. } => user_id,
            StreamKey::Call { user_id, .. } => user_id,
        }
    }
}

impl FromStr for StreamKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<StreamKey, GatewayError> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["guild", guild_id, channel_id, user_id]
                if !guild_id.is_empty()
                    && !channel_id.is_empty()
                    && !user_id.is_empty() =>
            {
                Ok(StreamKey::Guild {
                    guild_id: guild_id.to_string(),
                    channel_id: channel_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
            ["call", channel_id, user_id]
                if !channel_id.is_empty() && !user_id.is_empty() =>
            {
                Ok(StreamKey::Call {
                    channel_id: channel_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
            _ => Err(GatewayError::InvalidStreamKey(s.to_string())),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Guild {
                guild_id,
                channel_id,
                user_id,
            } => write!(f, "guild:{guild_id}:{channel_id}:{user_id}"),
            StreamKey::Call {
                channel_id,
                user_id,
            } => write!(f, "call:{channel_id}:{user_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_guild_key() {
        let key: StreamKey = "guild:123:456:789".parse().unwrap();
        assert_eq!(
            key,
            StreamKey::Guild {
                guild_id: "123".to_string(),
                channel_id: "456".to_string(),
                user_id: "789".to_string(),
            }
        );
        assert_eq!(key.server_id(), "123");
        assert_eq!(key.to_string(), "guild:123:456:789");
    }

    #[test]
    fn test_parse_call_key() {
        let key: StreamKey = "call:456:789".parse().unwrap();
        assert_eq!(key.server_id(), "456");
        assert_eq!(key.user_id(), "789");
        assert_eq!(key.to_string(), "call:456:789");
    }

    #[test]
    fn test_malformed_keys_rejected() {
        for bad in [
            "",
            "guild:123:456",
            "call:456",
            "call:456:789:extra",
            "dm:456:789",
            "guild:::",
        ] {
            assert!(matches!(
                bad.parse::<StreamKey>(),
                Err(GatewayError::InvalidStreamKey(_))
            ));
        }
    }
}
