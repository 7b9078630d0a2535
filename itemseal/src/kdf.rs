//! Key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Every record gets a fresh random salt. HKDF-SHA256 over the record's data
//! key and that salt yields three independent values:
//!
//! - the attribute encryption key
//! - the record MAC key
//! - a 12-byte nonce base, XORed with the attribute counter per attribute

use crate::error::Error;
use crate::suite::{AlgorithmSuiteId, DATA_KEY_SIZE, NONCE_SIZE};
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use hkdf::Hkdf;
use secrecy::SecretVec;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of the per-record random salt stored in the header.
pub const RECORD_SALT_SIZE: usize = 16;

const INFO_ENCRYPTION_KEY: &[u8] = b"itemseal-v1-attribute-key";
const INFO_MAC_KEY: &[u8] = b"itemseal-v1-record-mac-key";
const INFO_NONCE_BASE: &[u8] = b"itemseal-v1-nonce-base";

/// Keys derived for a single record. Zeroized on drop.
pub struct RecordKeys {
    encryption_key: Zeroizing<[u8; DATA_KEY_SIZE]>,
    mac_key: Zeroizing<[u8; DATA_KEY_SIZE]>,
    nonce_base: [u8; NONCE_SIZE],
}

impl RecordKeys {
    /// Derives the record keys from a data key and the record salt.
    ///
    /// The suite id is mixed into every `info` so keys never cross suites.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if HKDF expansion fails.
    pub fn derive(
        data_key: &[u8],
        salt: &[u8; RECORD_SALT_SIZE],
        suite: AlgorithmSuiteId,
    ) -> Result<Self, Error> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), data_key);

        let mut encryption_key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
        expand(&hkdf, INFO_ENCRYPTION_KEY, suite, &mut encryption_key[..])?;

        let mut mac_key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
        expand(&hkdf, INFO_MAC_KEY, suite, &mut mac_key[..])?;

        let mut nonce_base = [0u8; NONCE_SIZE];
        expand(&hkdf, INFO_NONCE_BASE, suite, &mut nonce_base)?;

        Ok(Self {
            encryption_key,
            mac_key,
            nonce_base,
        })
    }

    /// Attribute encryption key.
    #[must_use]
    pub fn encryption_key(&self) -> &[u8] {
        &self.encryption_key[..]
    }

    /// Record MAC key.
    #[must_use]
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key[..]
    }

    /// Nonce for the attribute with the given per-record counter.
    ///
    /// The counter is XORed big-endian into the low 8 bytes of the nonce base,
    /// so distinct counters always give distinct nonces for one record.
    #[must_use]
    pub fn nonce(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = self.nonce_base;
        for (byte, ctr) in nonce[NONCE_SIZE - 8..].iter_mut().zip(counter.to_be_bytes()) {
            *byte ^= ctr;
        }
        nonce
    }
}

fn expand(
    hkdf: &Hkdf<Sha256>,
    label: &[u8],
    suite: AlgorithmSuiteId,
    out: &mut [u8],
) -> Result<(), Error> {
    let suite_id = suite.id().to_be_bytes();
    hkdf.expand_multi_info(&[label, &suite_id], out)
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))
}

/// Generates a fresh record salt from the OS CSPRNG.
#[must_use]
pub fn generate_record_salt() -> [u8; RECORD_SALT_SIZE] {
    let mut salt = [0u8; RECORD_SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generates a random data key.
///
/// Intended for [`MaterialProvider`] implementations; the engine itself
/// always obtains data keys from its provider.
///
/// [`MaterialProvider`]: crate::material::MaterialProvider
#[must_use]
pub fn generate_data_key() -> SecretVec<u8> {
    let mut key = vec![0u8; DATA_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}

/// Derives a labelled sub-key with HKDF-SHA256 (no salt).
///
/// # Errors
///
/// Returns `Error::Crypto` if HKDF expansion fails.
pub fn derive_subkey(ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; DATA_KEY_SIZE]>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; DATA_KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
    Ok(okm)
}
