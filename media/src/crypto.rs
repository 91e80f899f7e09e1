// Transport AEAD suites. Each packetizer owns one cipher whose nonce
// is a monotonic u32 counter, big-endian at offset 0 of the zero-padded
// nonce buffer; the wire carries only the first four nonce bytes.

use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use byteorder::{BigEndian, ByteOrder};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use strum_macros::{self, EnumString};

use crate::error::MediaError;

pub const SECRET_KEY_LEN: usize = 32;
pub const GCM_NONCE_LEN: usize = 12;
pub const XCHACHA_NONCE_LEN: usize = 24;
pub const NONCE_PREFIX_LEN: usize = 4;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, EnumString,
)]
pub enum EncryptionMode {
    #[strum(serialize = "aead_aes256_gcm_rtpsize")]
    Aes256Gcm,
    #[strum(serialize = "aead_xchacha20_poly1305_rtpsize")]
    XChaCha20Poly1305,
}

impl EncryptionMode {
    /// Prefer AES-256-GCM when the remote offers it, unless forced onto
    /// ChaCha; XChaCha20 is the fallback for every other offer set.
    pub fn select(supported: &[String], force_chacha: bool) -> EncryptionMode {
        let gcm = EncryptionMode::Aes256Gcm.to_string();
        if !force_chacha && supported.iter().any(|m| *m == gcm) {
            EncryptionMode::Aes256Gcm
        } else {
            EncryptionMode::XChaCha20Poly1305
        }
    }

    pub fn from_wire(mode: &str) -> Option<EncryptionMode> {
        EncryptionMode::from_str(mode).ok()
    }
}

pub enum TransportCipher {
    Aes256Gcm { cipher: Aes256Gcm, counter: u32 },
    XChaCha20Poly1305 { cipher: XChaCha20Poly1305, counter: u32 },
}

impl TransportCipher {
    pub fn new(mode: EncryptionMode, key: &[u8; SECRET_KEY_LEN]) -> TransportCipher {
        match mode {
            EncryptionMode::Aes256Gcm => TransportCipher::Aes256Gcm {
                cipher: Aes256Gcm::new(key.into()),
                counter: 0,
            },
            EncryptionMode::XChaCha20Poly1305 => {
                TransportCipher::XChaCha20Poly1305 {
                    cipher: XChaCha20Poly1305::new(key.into()),
                    counter: 0,
                }
            }
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        match self {
            TransportCipher::Aes256Gcm { .. } => EncryptionMode::Aes256Gcm,
            TransportCipher::XChaCha20Poly1305 { .. } => {
                EncryptionMode::XChaCha20Poly1305
            }
        }
    }

    /// Seal a payload; the ciphertext includes the tag and the returned
    /// buffer is the full-width nonce used. The counter advances once
    /// per call and wraps at 32 bits.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), MediaError> {
        match self {
            TransportCipher::Aes256Gcm { cipher, counter } => {
                let mut nonce = vec![0u8; GCM_NONCE_LEN];
                BigEndian::write_u32(&mut nonce[..4], *counter);
                *counter = counter.wrapping_add(1);
                let ciphertext = cipher
                    .encrypt(
                        aes_gcm::Nonce::from_slice(&nonce),
                        Payload { msg: plaintext, aad },
                    )
                    .map_err(|_| MediaError::Cipher)?;
                Ok((ciphertext, nonce))
            }
            TransportCipher::XChaCha20Poly1305 { cipher, counter } => {
                let mut nonce = vec![0u8; XCHACHA_NONCE_LEN];
                BigEndian::write_u32(&mut nonce[..4], *counter);
                *counter = counter.wrapping_add(1);
                let ciphertext = cipher
                    .encrypt(
                        XNonce::from_slice(&nonce),
                        Payload { msg: plaintext, aad },
                    )
                    .map_err(|_| MediaError::Cipher)?;
                Ok((ciphertext, nonce))
            }
        }
    }
}
