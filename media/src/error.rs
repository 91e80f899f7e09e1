use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unsupported codec {0}")]
    UnsupportedCodec(String),

    #[error("invalid configuration record")]
    InvalidConfigurationRecord,

    #[error("ip discovery timed out")]
    DiscoveryTimeout,

    #[error("malformed ip discovery response")]
    InvalidDiscoveryResponse,

    #[error("packetizers not installed before send")]
    EncryptorMissing,

    #[error("aead seal failed")]
    Cipher,

    #[error("bitstream: {0}")]
    Codec(codec::CodecError),

    #[error("demux: {0}")]
    Demux(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<codec::CodecError> for MediaError {
    fn from(e: codec::CodecError) -> Self {
        match e {
            codec::CodecError::InvalidConfigurationRecord => {
                MediaError::InvalidConfigurationRecord
            }
            other => MediaError::Codec(other),
        }
    }
}
