//! File-based keyring and beacon key store for `itemseal`.
//!
//! Both read raw key material from the filesystem and are suitable for
//! development and testing environments.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use itemseal::beacon::BeaconKeyStore;
use itemseal::context::EncryptionContext;
use itemseal::error::MaterialProviderError;
use itemseal::kdf::generate_data_key;
use itemseal::material::{
    DecryptionMaterials, EncryptedDataKey, EncryptionMaterials, MaterialProvider,
};
use itemseal::suite::AlgorithmSuiteId;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretVec};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Provider id written into every encrypted data key this keyring produces.
pub const PROVIDER_ID: &str = "raw-chacha20";

/// Size of wrapping and beacon keys in bytes.
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const KEY_EXTENSION: &str = "key";
const BEACON_EXTENSION: &str = "beacon";

/// File-based keyring.
///
/// Keys are stored in the filesystem with the following structure:
/// ```text
/// keys/
/// ├── kek_v1.key      (32 bytes, 0600 permissions)
/// ├── kek_v2.key      (32 bytes, 0600 permissions)
/// └── email.beacon    (beacon key, see FileBeaconKeyStore)
/// ```
///
/// Every loaded key wraps each new data key, so a record can be decrypted by
/// any keyring holding at least one of them. Wrapping is ChaCha20-Poly1305
/// with the canonical encryption context and suite id as associated data.
pub struct FileKeyring {
    wrapping_keys: Vec<(String, SecretVec<u8>)>,
}

impl FileKeyring {
    /// Loads the wrapping key `<key_dir>/<name>.key`.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::KeyNotFound` if the file does not
    /// exist, or `MaterialProviderError::Io` if it cannot be read or is not
    /// exactly 32 bytes.
    pub fn open(key_dir: impl AsRef<Path>, name: &str) -> Result<Self, MaterialProviderError> {
        Self::open_all(key_dir, [name])
    }

    /// Loads several wrapping keys from `key_dir`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open`]; also fails if `names` is empty.
    pub fn open_all<I, S>(
        key_dir: impl AsRef<Path>,
        names: I,
    ) -> Result<Self, MaterialProviderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key_dir = key_dir.as_ref();
        let mut wrapping_keys = Vec::new();
        for name in names {
            let name = name.as_ref();
            let key = read_key(&key_path(key_dir, name, KEY_EXTENSION)?)?
                .ok_or_else(|| MaterialProviderError::KeyNotFound(name.to_string()))?;
            if key.expose_secret().len() != KEY_SIZE {
                return Err(invalid_data(format!("wrapping key {name} must be {KEY_SIZE} bytes")));
            }
            wrapping_keys.push((name.to_string(), key));
        }
        if wrapping_keys.is_empty() {
            return Err(MaterialProviderError::KeyNotFound("no wrapping key given".to_string()));
        }

        tracing::debug!(keys = wrapping_keys.len(), dir = %key_dir.display(), "keyring loaded");
        Ok(Self { wrapping_keys })
    }

    /// Writes a fresh random wrapping key to `<key_dir>/<name>.key`,
    /// creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::Io` if the key already exists or the
    /// file cannot be written.
    pub fn generate(
        key_dir: impl AsRef<Path>,
        name: &str,
    ) -> Result<PathBuf, MaterialProviderError> {
        write_random_key(key_dir.as_ref(), name, KEY_EXTENSION)
    }

    /// Names of the loaded wrapping keys.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.wrapping_keys.iter().map(|(name, _)| name.as_str())
    }

    fn wrap_key(
        key: &SecretVec<u8>,
        data_key: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, MaterialProviderError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret())
            .map_err(|e| MaterialProviderError::WrapFailed(format!("invalid wrapping key: {e}")))?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let payload = Payload { msg: data_key, aad };
        let ciphertext = cipher
            .encrypt(&Nonce::from(nonce), payload)
            .map_err(|e| MaterialProviderError::WrapFailed(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_key(key: &SecretVec<u8>, wrapped: &[u8], aad: &[u8]) -> Option<SecretVec<u8>> {
        if wrapped.len() <= NONCE_SIZE {
            return None;
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().ok()?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret()).ok()?;
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        cipher
            .decrypt(&Nonce::from(nonce), payload)
            .ok()
            .map(SecretVec::new)
    }
}

impl MaterialProvider for FileKeyring {
    fn generate_data_key(
        &self,
        context: &EncryptionContext,
        suite: AlgorithmSuiteId,
    ) -> Result<EncryptionMaterials, MaterialProviderError> {
        let data_key = generate_data_key();
        if data_key.expose_secret().len() != suite.data_key_len() {
            return Err(MaterialProviderError::GenerationFailed(format!(
                "{suite} needs a {}-byte data key",
                suite.data_key_len()
            )));
        }

        let aad = associated_data(context, suite);
        let encrypted_data_keys = self
            .wrapping_keys
            .iter()
            .map(|(name, key)| {
                Self::wrap_key(key, data_key.expose_secret(), &aad)
                    .map(|wrapped| EncryptedDataKey::new(PROVIDER_ID, name.as_str(), wrapped))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EncryptionMaterials {
            plaintext_data_key: data_key,
            encrypted_data_keys,
        })
    }

    fn decrypt_data_key(
        &self,
        context: &EncryptionContext,
        suite: AlgorithmSuiteId,
        encrypted_data_keys: &[EncryptedDataKey],
    ) -> Result<DecryptionMaterials, MaterialProviderError> {
        let aad = associated_data(context, suite);

        for edk in encrypted_data_keys.iter().filter(|edk| edk.provider_id == PROVIDER_ID) {
            let Some((name, key)) =
                self.wrapping_keys.iter().find(|(name, _)| *name == edk.provider_info)
            else {
                continue;
            };
            if let Some(data_key) = Self::unwrap_key(key, &edk.ciphertext, &aad) {
                return Ok(DecryptionMaterials {
                    plaintext_data_key: data_key,
                    encryption_context: context.clone(),
                });
            }
            tracing::debug!(key = %name, "wrapped data key did not authenticate");
        }

        Err(MaterialProviderError::NoKeyUnwrapped)
    }
}

/// File-based store of per-beacon keys, read from `<key_dir>/<beacon>.beacon`.
///
/// A beacon with no key file has no key (`Ok(None)`).
#[derive(Debug, Clone)]
pub struct FileBeaconKeyStore {
    key_dir: PathBuf,
}

impl FileBeaconKeyStore {
    /// Creates a store over `key_dir`.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::Io` if the directory does not exist.
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, MaterialProviderError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(MaterialProviderError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("key directory does not exist: {}", key_dir.display()),
            )));
        }
        Ok(Self { key_dir })
    }

    /// Writes a fresh random key for `beacon_name`.
    ///
    /// # Errors
    ///
    /// Returns `MaterialProviderError::Io` if the key already exists or the
    /// file cannot be written.
    pub fn generate(&self, beacon_name: &str) -> Result<PathBuf, MaterialProviderError> {
        write_random_key(&self.key_dir, beacon_name, BEACON_EXTENSION)
    }
}

impl BeaconKeyStore for FileBeaconKeyStore {
    fn get_key(&self, beacon_name: &str) -> Result<Option<SecretVec<u8>>, MaterialProviderError> {
        let key = read_key(&key_path(&self.key_dir, beacon_name, BEACON_EXTENSION)?)?;
        if key.as_ref().is_some_and(|k| k.expose_secret().is_empty()) {
            return Err(invalid_data(format!("beacon key {beacon_name} is empty")));
        }
        Ok(key)
    }
}

fn key_path(key_dir: &Path, name: &str, extension: &str) -> Result<PathBuf, MaterialProviderError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.');
    if !valid {
        return Err(MaterialProviderError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid key name: {name:?}"),
        )));
    }
    Ok(key_dir.join(format!("{name}.{extension}")))
}

fn read_key(path: &Path) -> Result<Option<SecretVec<u8>>, MaterialProviderError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(SecretVec::new(bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_random_key(
    key_dir: &Path,
    name: &str,
    extension: &str,
) -> Result<PathBuf, MaterialProviderError> {
    let path = key_path(key_dir, name, extension)?;
    fs::create_dir_all(key_dir)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(&key[..])?;
    file.sync_all()?;

    tracing::debug!(path = %path.display(), "generated key file");
    Ok(path)
}

fn associated_data(context: &EncryptionContext, suite: AlgorithmSuiteId) -> Vec<u8> {
    let mut aad = context.to_canonical_bytes();
    aad.extend_from_slice(&suite.id().to_be_bytes());
    aad
}

fn invalid_data(message: String) -> MaterialProviderError {
    MaterialProviderError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}
