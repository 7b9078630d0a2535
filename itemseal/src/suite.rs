//! Algorithm suites and per-attribute authenticated encryption.

use crate::error::Error;
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nonce size shared by every supported AEAD (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Data key size shared by every supported suite (256 bits).
pub const DATA_KEY_SIZE: usize = 32;

/// Identifies the AEAD, key derivation and record MAC in effect for a record.
///
/// Every suite derives per-record keys with HKDF-SHA256 and authenticates the
/// record with HMAC-SHA256; they differ in the attribute cipher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmSuiteId {
    /// ChaCha20-Poly1305 attribute encryption (default).
    #[default]
    #[serde(rename = "CHACHA20_POLY1305_HKDF_SHA256")]
    ChaCha20Poly1305HkdfSha256,
    /// AES-256-GCM attribute encryption.
    #[serde(rename = "AES_256_GCM_HKDF_SHA256")]
    Aes256GcmHkdfSha256,
}

impl AlgorithmSuiteId {
    /// Header wire id.
    #[must_use]
    pub const fn id(self) -> u16 {
        match self {
            Self::ChaCha20Poly1305HkdfSha256 => 0x0001,
            Self::Aes256GcmHkdfSha256 => 0x0002,
        }
    }

    /// Parses a header wire id.
    #[must_use]
    pub const fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(Self::ChaCha20Poly1305HkdfSha256),
            0x0002 => Some(Self::Aes256GcmHkdfSha256),
            _ => None,
        }
    }

    /// Length of the plaintext data key this suite expects.
    #[must_use]
    pub const fn data_key_len(self) -> usize {
        DATA_KEY_SIZE
    }

    /// Encrypts `plaintext` under `key` and `nonce`, authenticating `aad`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the key has the wrong length or the cipher
    /// fails.
    pub fn seal(
        self,
        key: &[u8],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            Self::ChaCha20Poly1305HkdfSha256 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("invalid attribute key: {e}")))?;
                cipher
                    .encrypt(&Nonce::from(*nonce), payload)
                    .map_err(|e| Error::Crypto(format!("ChaCha20-Poly1305 encryption failed: {e}")))
            }
            Self::Aes256GcmHkdfSha256 => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("invalid attribute key: {e}")))?;
                cipher
                    .encrypt(&Nonce::from(*nonce), payload)
                    .map_err(|e| Error::Crypto(format!("AES-256-GCM encryption failed: {e}")))
            }
        }
    }

    /// Decrypts and authenticates `ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Integrity` if authentication fails and `Error::Crypto`
    /// if the key has the wrong length.
    pub fn open(
        self,
        key: &[u8],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let result = match self {
            Self::ChaCha20Poly1305HkdfSha256 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| Error::Crypto(format!("invalid attribute key: {e}")))?
                .decrypt(&Nonce::from(*nonce), payload),
            Self::Aes256GcmHkdfSha256 => Aes256Gcm::new_from_slice(key)
                .map_err(|e| Error::Crypto(format!("invalid attribute key: {e}")))?
                .decrypt(&Nonce::from(*nonce), payload),
        };
        result.map_err(|_| {
            Error::Integrity("attribute ciphertext failed authentication".to_string())
        })
    }
}

impl fmt::Display for AlgorithmSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ChaCha20Poly1305HkdfSha256 => "CHACHA20_POLY1305_HKDF_SHA256",
            Self::Aes256GcmHkdfSha256 => "AES_256_GCM_HKDF_SHA256",
        })
    }
}
