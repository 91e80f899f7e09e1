//! Voice-gateway v8 control plane: the WebSocket state machine that
//! negotiates a session, plus the typed bridge to the application
//! gateway that supplies its credentials.

pub mod bridge;
pub mod error;
pub mod payloads;
pub mod stream_key;
pub mod voice;

pub use error::GatewayError;
pub use stream_key::StreamKey;
pub use voice::{VoiceEvent, VoiceGateway};
