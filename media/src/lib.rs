//! Media transport pipeline: Matroska demuxing, paced delivery, RTP
//! packetization, AEAD framing and the UDP transport that carries it.

pub mod crypto;
pub mod demux;
pub mod error;
pub mod packet;
pub mod packetizer;
pub mod pipe;
pub mod rtcp;
pub mod stream;
pub mod transport;

pub use error::MediaError;
pub use transport::UdpTransport;
