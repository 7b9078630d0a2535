//! Running record authentication tag (HMAC-SHA256).
//!
//! The tag covers the header body, then every signed attribute in signing
//! order as `[name_len:4][name][action:1][value_len:4][value]`. For
//! `SIGN_ONLY` attributes the value is the canonical plaintext bytes; for
//! `ENCRYPT_AND_SIGN` it is the stored ciphertext.

use crate::action::AttributeAction;
use crate::error::Error;
use crate::header::RECORD_TAG_SIZE;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Incrementally computes the record tag.
pub struct RecordTag {
    mac: HmacSha256,
}

impl RecordTag {
    /// Starts a tag over `header_body` with the record MAC key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the key is rejected.
    pub fn new(mac_key: &[u8], header_body: &[u8]) -> Result<Self, Error> {
        let mut mac = HmacSha256::new_from_slice(mac_key)
            .map_err(|e| Error::Crypto(format!("invalid record MAC key: {e}")))?;
        mac.update(&(header_body.len() as u64).to_be_bytes());
        mac.update(header_body);
        Ok(Self { mac })
    }

    /// Folds one signed attribute into the tag.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedValue` if the name or value exceeds 4 GiB.
    pub fn update(
        &mut self,
        name: &str,
        action: AttributeAction,
        value: &[u8],
    ) -> Result<(), Error> {
        let name_len = u32::try_from(name.len())
            .map_err(|_| Error::MalformedValue(format!("attribute name too long: {name}")))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| Error::MalformedValue(format!("attribute {name} too long")))?;

        self.mac.update(&name_len.to_be_bytes());
        self.mac.update(name.as_bytes());
        self.mac.update(&[action.tag()]);
        self.mac.update(&value_len.to_be_bytes());
        self.mac.update(value);
        Ok(())
    }

    /// Finishes the tag.
    #[must_use]
    pub fn finalize(self) -> [u8; RECORD_TAG_SIZE] {
        self.mac.finalize().into_bytes().into()
    }

    /// Verifies `expected` in constant time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Integrity` on mismatch.
    pub fn verify(self, expected: &[u8]) -> Result<(), Error> {
        self.mac
            .verify_slice(expected)
            .map_err(|_| Error::Integrity("record tag mismatch".to_string()))
    }
}
