//! Material provider abstraction and the resolver adapter around it.
//!
//! The provider (a keyring, KMS client or cryptographic materials manager)
//! is external. This module defines the contract it implements and the thin
//! adapter the engine calls, which validates what the provider returns.

use crate::context::EncryptionContext;
use crate::error::{Error, MaterialProviderError};
use crate::suite::AlgorithmSuiteId;
use secrecy::{ExposeSecret, SecretVec};

/// A wrapped form of a record's data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDataKey {
    /// Identifies the kind of provider that produced the key.
    pub provider_id: String,
    /// Provider-specific key identifier (e.g. wrapping key name).
    pub provider_info: String,
    /// The wrapped key bytes.
    pub ciphertext: Vec<u8>,
}

impl EncryptedDataKey {
    /// Creates a new encrypted data key.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        provider_info: impl Into<String>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_info: provider_info.into(),
            ciphertext,
        }
    }
}

/// Output of the encrypt path: a fresh data key and its wrapped forms.
pub struct EncryptionMaterials {
    /// Plaintext data key.
    pub plaintext_data_key: SecretVec<u8>,
    /// One entry per wrapping key.
    pub encrypted_data_keys: Vec<EncryptedDataKey>,
}

/// Output of the decrypt path.
pub struct DecryptionMaterials {
    /// Recovered plaintext data key.
    pub plaintext_data_key: SecretVec<u8>,
    /// Context the provider bound during unwrap.
    pub encryption_context: EncryptionContext,
}

/// Produces and recovers record data keys.
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent record operations. They may block (e.g. on a KMS call); the
/// engine surfaces their errors without retrying.
///
/// # Example
///
/// ```rust,ignore
/// use itemseal::material::MaterialProvider;
///
/// struct MyKeyring;
///
/// impl MaterialProvider for MyKeyring {
///     fn generate_data_key(&self, context, suite) -> Result<EncryptionMaterials, _> {
///         // Implementation
///     }
///     // ... decrypt_data_key
/// }
/// ```
pub trait MaterialProvider: Send + Sync {
    /// Generates a fresh data key and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::GenerationFailed` or `WrapFailed` if
    /// no key could be produced.
    fn generate_data_key(
        &self,
        context: &EncryptionContext,
        suite: AlgorithmSuiteId,
    ) -> Result<EncryptionMaterials, MaterialProviderError>;

    /// Recovers the data key from any one of `encrypted_data_keys`.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::NoKeyUnwrapped` if none of the keys
    /// can be unwrapped with the given context.
    fn decrypt_data_key(
        &self,
        context: &EncryptionContext,
        suite: AlgorithmSuiteId,
        encrypted_data_keys: &[EncryptedDataKey],
    ) -> Result<DecryptionMaterials, MaterialProviderError>;
}

/// Encrypt path of the resolver.
///
/// # Errors
///
/// - `Error::KeyUnavailable` if the provider reports no usable key, returns
///   no encrypted data keys, or returns a key of the wrong length
/// - `Error::MaterialProvider` for any other provider failure
pub fn resolve_encryption_materials<P: MaterialProvider + ?Sized>(
    provider: &P,
    context: &EncryptionContext,
    suite: AlgorithmSuiteId,
) -> Result<EncryptionMaterials, Error> {
    let materials = provider.generate_data_key(context, suite).map_err(provider_error)?;

    if materials.encrypted_data_keys.is_empty() {
        return Err(Error::KeyUnavailable("provider returned no encrypted data keys".to_string()));
    }
    check_key_len(&materials.plaintext_data_key, suite)?;

    Ok(materials)
}

/// Decrypt path of the resolver.
///
/// # Errors
///
/// - `Error::KeyUnavailable` if there is nothing to unwrap, no provider key
///   matches, or the recovered key has the wrong length
/// - `Error::EncryptionContextMismatch` if the provider bound a different
///   context than `context`
/// - `Error::MaterialProvider` for any other provider failure
pub fn resolve_decryption_materials<P: MaterialProvider + ?Sized>(
    provider: &P,
    context: &EncryptionContext,
    suite: AlgorithmSuiteId,
    encrypted_data_keys: &[EncryptedDataKey],
) -> Result<DecryptionMaterials, Error> {
    if encrypted_data_keys.is_empty() {
        return Err(Error::KeyUnavailable("header carries no encrypted data keys".to_string()));
    }

    let materials = provider
        .decrypt_data_key(context, suite, encrypted_data_keys)
        .map_err(provider_error)?;

    if materials.encryption_context != *context {
        let keys = materials.encryption_context.diff_keys(context);
        return Err(Error::EncryptionContextMismatch(format!(
            "provider bound a different context (keys: {})",
            keys.join(", ")
        )));
    }
    check_key_len(&materials.plaintext_data_key, suite)?;

    Ok(materials)
}

fn provider_error(err: MaterialProviderError) -> Error {
    if err.is_key_unavailable() {
        Error::KeyUnavailable(err.to_string())
    } else {
        Error::MaterialProvider(err)
    }
}

fn check_key_len(key: &SecretVec<u8>, suite: AlgorithmSuiteId) -> Result<(), Error> {
    let len = key.expose_secret().len();
    if len == suite.data_key_len() {
        Ok(())
    } else {
        Err(Error::KeyUnavailable(format!(
            "data key is {len} bytes, {suite} needs {}",
            suite.data_key_len()
        )))
    }
}
