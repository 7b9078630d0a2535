//! Error types for `itemseal` operations.

use std::fmt;

/// Main error type for record encryption and decryption.
///
/// Configuration problems are reported once, when a [`RecordEncryptor`] is
/// built. Every other variant is data-dependent and aborts the single record
/// operation that raised it.
///
/// [`RecordEncryptor`]: crate::encryptor::RecordEncryptor
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or contradictory table, action or beacon configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An attribute carries an action it is not allowed to have, or a record
    /// contains an attribute the configuration cannot classify
    #[error("attribute action violation: {0}")]
    AttributeActionViolation(String),

    /// Header bytes are truncated or structurally corrupt
    #[error("header parse error: {0}")]
    HeaderParse(String),

    /// Well-formed input carrying a value this version does not understand
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// The encryption context recomputed from the record disagrees with the
    /// one stored in the header or bound by the key provider
    #[error("encryption context mismatch: {0}")]
    EncryptionContextMismatch(String),

    /// No configured provider could produce or recover a data key
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Record authentication failed (data may be corrupted or tampered)
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A partition or sort key attribute is absent from the record
    #[error("missing key attribute: {0}")]
    MissingKeyAttribute(String),

    /// Serialized attribute bytes could not be decoded
    #[error("malformed attribute value: {0}")]
    MalformedValue(String),

    /// A cryptographic primitive rejected its input
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// Opaque failure from the external material provider
    #[error("material provider error: {0}")]
    MaterialProvider(#[from] MaterialProviderError),
}

/// Errors reported by [`MaterialProvider`] and [`BeaconKeyStore`]
/// implementations.
///
/// [`MaterialProvider`]: crate::material::MaterialProvider
/// [`BeaconKeyStore`]: crate::beacon::BeaconKeyStore
#[derive(Debug)]
pub enum MaterialProviderError {
    /// Wrapping key not found
    KeyNotFound(String),

    /// None of the supplied encrypted data keys could be unwrapped
    NoKeyUnwrapped,

    /// Data key generation failed
    GenerationFailed(String),

    /// Data key wrapping failed
    WrapFailed(String),

    /// Data key unwrapping failed
    UnwrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for MaterialProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "wrapping key not found: {id}"),
            Self::NoKeyUnwrapped => write!(f, "no encrypted data key could be unwrapped"),
            Self::GenerationFailed(msg) => write!(f, "data key generation failed: {msg}"),
            Self::WrapFailed(msg) => write!(f, "data key wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "data key unwrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for MaterialProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MaterialProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl MaterialProviderError {
    /// Returns `true` when the failure means no usable key exists, as opposed
    /// to an operational fault inside the provider.
    #[must_use]
    pub const fn is_key_unavailable(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound(_) | Self::NoKeyUnwrapped | Self::UnwrapFailed(_)
        )
    }
}
