//! Session orchestration: joins the voice channel, creates the Go Live
//! stream, runs the gateway handshake and drives the media pipeline.

pub mod session;

pub use session::{Broadcaster, StreamOptions};
