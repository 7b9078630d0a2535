//! Record header format.
//!
//! The header carries everything needed to decrypt and verify a record:
//! - Format version and algorithm suite
//! - Per-record salt
//! - Action table of the signed attributes
//! - Encrypted data keys
//! - Stored encryption context
//!
//! The engine appends the 32-byte record tag after the body.

use crate::action::AttributeAction;
use crate::context::EncryptionContext;
use crate::error::Error;
use crate::kdf::RECORD_SALT_SIZE;
use crate::material::EncryptedDataKey;
use crate::suite::AlgorithmSuiteId;
use std::collections::BTreeMap;

/// Header format version.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the record tag appended to the header body (HMAC-SHA256).
pub const RECORD_TAG_SIZE: usize = 32;

/// Record header.
///
/// Format (all integers big-endian):
/// ```text
/// [version:1][suite:2][salt:16]
/// [action_count:2]  { [name_len:2][name][action:1] }
/// [edk_count:2]     { [provider_id_len:2][provider_id]
///                     [provider_info_len:2][provider_info]
///                     [ciphertext_len:2][ciphertext] }
/// [context_count:2] { [key_len:2][key][value_len:2][value] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    algorithm_suite: AlgorithmSuiteId,
    record_salt: [u8; RECORD_SALT_SIZE],
    attribute_actions: BTreeMap<String, AttributeAction>,
    encrypted_data_keys: Vec<EncryptedDataKey>,
    stored_context: EncryptionContext,
}

impl Header {
    /// Creates a new header.
    #[must_use]
    pub const fn new(
        algorithm_suite: AlgorithmSuiteId,
        record_salt: [u8; RECORD_SALT_SIZE],
        attribute_actions: BTreeMap<String, AttributeAction>,
        encrypted_data_keys: Vec<EncryptedDataKey>,
        stored_context: EncryptionContext,
    ) -> Self {
        Self {
            algorithm_suite,
            record_salt,
            attribute_actions,
            encrypted_data_keys,
            stored_context,
        }
    }

    /// Returns the algorithm suite.
    #[must_use]
    pub const fn algorithm_suite(&self) -> AlgorithmSuiteId {
        self.algorithm_suite
    }

    /// Returns the per-record salt.
    #[must_use]
    pub const fn record_salt(&self) -> &[u8; RECORD_SALT_SIZE] {
        &self.record_salt
    }

    /// Returns the recorded attribute actions.
    #[must_use]
    pub const fn attribute_actions(&self) -> &BTreeMap<String, AttributeAction> {
        &self.attribute_actions
    }

    /// Returns the encrypted data keys.
    #[must_use]
    pub fn encrypted_data_keys(&self) -> &[EncryptedDataKey] {
        &self.encrypted_data_keys
    }

    /// Returns the stored encryption context.
    #[must_use]
    pub const fn stored_context(&self) -> &EncryptionContext {
        &self.stored_context
    }

    /// Serializes the header body.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedValue` if any count or length exceeds 65535.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::new();

        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&self.algorithm_suite.id().to_be_bytes());
        bytes.extend_from_slice(&self.record_salt);

        put_count(
            &mut bytes,
            self.attribute_actions.len(),
            "attribute actions",
        )?;
        for (name, action) in &self.attribute_actions {
            put_field(&mut bytes, name.as_bytes(), "attribute name")?;
            bytes.push(action.tag());
        }

        put_count(
            &mut bytes,
            self.encrypted_data_keys.len(),
            "encrypted data keys",
        )?;
        for edk in &self.encrypted_data_keys {
            put_field(&mut bytes, edk.provider_id.as_bytes(), "provider id")?;
            put_field(&mut bytes, edk.provider_info.as_bytes(), "provider info")?;
            put_field(&mut bytes, &edk.ciphertext, "encrypted data key")?;
        }

        put_count(&mut bytes, self.stored_context.len(), "context entries")?;
        for (key, value) in self.stored_context.iter() {
            put_field(&mut bytes, key.as_bytes(), "context key")?;
            put_field(&mut bytes, value.as_bytes(), "context value")?;
        }

        Ok(bytes)
    }

    /// Parses a header body. The whole input must be consumed.
    ///
    /// Structural problems (truncation, an over-long length, trailing bytes,
    /// an unknown suite, duplicate names, invalid UTF-8) are
    /// `Error::HeaderParse`. A well-bounded header that only carries an
    /// unknown version or action tag is `Error::UnsupportedValue`.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor { data, pos: 0 };
        let mut unsupported: Option<String> = None;

        let version = cursor.u8("version")?;
        if version != FORMAT_VERSION {
            unsupported = Some(format!("header version {version} (supported: {FORMAT_VERSION})"));
        }

        let suite_id = cursor.u16("algorithm suite")?;
        let algorithm_suite = AlgorithmSuiteId::from_id(suite_id).ok_or_else(|| {
            Error::HeaderParse(format!("unknown algorithm suite {suite_id:#06x}"))
        })?;

        let mut record_salt = [0u8; RECORD_SALT_SIZE];
        record_salt.copy_from_slice(cursor.take(RECORD_SALT_SIZE, "record salt")?);

        let action_count = cursor.u16("attribute action count")?;
        let mut attribute_actions = BTreeMap::new();
        for _ in 0..action_count {
            let name = cursor.string("attribute name")?;
            let tag = cursor.u8("attribute action")?;
            let action = AttributeAction::from_tag(tag).unwrap_or_else(|| {
                unsupported.get_or_insert_with(|| format!("attribute action tag {tag:#04x}"));
                AttributeAction::DoNothing
            });
            if attribute_actions.insert(name.clone(), action).is_some() {
                return Err(Error::HeaderParse(format!("duplicate attribute name: {name}")));
            }
        }

        let edk_count = cursor.u16("encrypted data key count")?;
        let mut encrypted_data_keys = Vec::with_capacity(usize::from(edk_count));
        for _ in 0..edk_count {
            let provider_id = cursor.string("provider id")?;
            let provider_info = cursor.string("provider info")?;
            let ciphertext = cursor.field("encrypted data key")?.to_vec();
            encrypted_data_keys.push(EncryptedDataKey {
                provider_id,
                provider_info,
                ciphertext,
            });
        }

        let context_count = cursor.u16("context entry count")?;
        let mut stored_context = EncryptionContext::new();
        for _ in 0..context_count {
            let key = cursor.string("context key")?;
            let value = cursor.string("context value")?;
            if stored_context.insert(key.clone(), value).is_some() {
                return Err(Error::HeaderParse(format!("duplicate context key: {key}")));
            }
        }

        if cursor.pos != data.len() {
            return Err(Error::HeaderParse(format!(
                "{} trailing bytes after header",
                data.len() - cursor.pos
            )));
        }

        if let Some(what) = unsupported {
            return Err(Error::UnsupportedValue(what));
        }

        Ok(Self {
            algorithm_suite,
            record_salt,
            attribute_actions,
            encrypted_data_keys,
            stored_context,
        })
    }

    /// Splits sealed header bytes (`body || tag`) and parses the body.
    ///
    /// # Errors
    ///
    /// Returns `Error::HeaderParse` if the input is shorter than a tag, plus
    /// any error from [`Self::from_bytes`].
    pub fn from_sealed(data: &[u8]) -> Result<(Self, &[u8], &[u8]), Error> {
        if data.len() < RECORD_TAG_SIZE {
            return Err(Error::HeaderParse(format!(
                "header is {} bytes, shorter than the record tag",
                data.len()
            )));
        }
        let (body, tag) = data.split_at(data.len() - RECORD_TAG_SIZE);
        Ok((Self::from_bytes(body)?, body, tag))
    }

    /// Converts into the caller-facing read-only view.
    #[must_use]
    pub fn into_parsed(self) -> ParsedHeader {
        ParsedHeader {
            algorithm_suite: self.algorithm_suite,
            attribute_actions: self.attribute_actions,
            encrypted_data_keys: self.encrypted_data_keys,
            stored_context: self.stored_context,
        }
    }
}

/// Read-only view of a verified header, returned from decrypt for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Algorithm suite the record was written with.
    pub algorithm_suite: AlgorithmSuiteId,
    /// Actions of the signed attributes.
    pub attribute_actions: BTreeMap<String, AttributeAction>,
    /// Wrapped data keys.
    pub encrypted_data_keys: Vec<EncryptedDataKey>,
    /// Encryption context stored at encrypt time.
    pub stored_context: EncryptionContext,
}

fn put_count(bytes: &mut Vec<u8>, count: usize, what: &str) -> Result<(), Error> {
    let count = u16::try_from(count)
        .map_err(|_| Error::MalformedValue(format!("too many {what}: {count} (max: 65535)")))?;
    bytes.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_field(bytes: &mut Vec<u8>, field: &[u8], what: &str) -> Result<(), Error> {
    let len = u16::try_from(field.len()).map_err(|_| {
        Error::MalformedValue(format!("{what} too long: {} bytes (max: 65535)", field.len()))
    })?;
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(field);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.pos {
            return Err(Error::HeaderParse(format!(
                "{what} truncated: need {len} bytes, {} remain",
                self.data.len() - self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8, Error> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, Error> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn field(&mut self, what: &str) -> Result<&'a [u8], Error> {
        let len = self.u16(what)?;
        self.take(usize::from(len), what)
    }

    fn string(&mut self, what: &str) -> Result<String, Error> {
        let bytes = self.field(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::HeaderParse(format!("invalid {what} UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        let mut actions = BTreeMap::new();
        actions.insert("pk".to_string(), AttributeAction::SignOnly);
        actions.insert("secret".to_string(), AttributeAction::EncryptAndSign);
        Header::new(
            AlgorithmSuiteId::default(),
            [7u8; RECORD_SALT_SIZE],
            actions,
            vec![
                EncryptedDataKey::new("raw-chacha20", "kek_v1", vec![1, 2, 3, 4]),
                EncryptedDataKey::new("raw-chacha20", "kek_v2", vec![5; 60]),
            ],
            EncryptionContext::new()
                .with_entry("seal-table-name", "orders")
                .with_entry("seal-partition-value", "S:pk1"),
        )
    }

    #[test]
    fn test_header_serialization() {
        let header = header();
        let bytes = header.to_bytes().expect("Failed to serialize header");
        let parsed = Header::from_bytes(&bytes).expect("Failed to parse header");

        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_layout_prefix() {
        let bytes = header().to_bytes().unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(&bytes[1..3], &[0x00, 0x01]);
        assert_eq!(&bytes[3..19], &[7u8; RECORD_SALT_SIZE]);
        // two actions, first is "pk" (sorted)
        assert_eq!(&bytes[19..21], &[0, 2]);
        assert_eq!(&bytes[21..23], &[0, 2]);
        assert_eq!(&bytes[23..25], b"pk");
        assert_eq!(bytes[25], AttributeAction::SignOnly.tag());
    }

    #[test]
    fn test_header_empty_data() {
        assert!(matches!(Header::from_bytes(&[]), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_header_every_truncation_fails() {
        let bytes = header().to_bytes().unwrap();
        for len in 0..bytes.len() {
            assert!(
                matches!(
                    Header::from_bytes(&bytes[..len]),
                    Err(Error::HeaderParse(_))
                ),
                "truncation at {len} was accepted"
            );
        }
    }

    #[test]
    fn test_header_length_exceeding_buffer() {
        let mut bytes = header().to_bytes().unwrap();
        // first attribute name length
        bytes[21] = 0xFF;
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_header_trailing_bytes() {
        let mut bytes = header().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_header_unknown_suite() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[1] = 0x67;
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[0] = 99;
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::UnsupportedValue(_))));
    }

    #[test]
    fn test_header_unknown_action_tag() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[25] = 0x09;
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::UnsupportedValue(_))));
    }

    #[test]
    fn test_header_corruption_wins_over_unsupported() {
        let mut bytes = header().to_bytes().unwrap();
        bytes[25] = 0x09;
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_header_duplicate_attribute_name() {
        let mut bytes = empty_prefix();
        bytes.extend_from_slice(&[0, 2]);
        for _ in 0..2 {
            bytes.extend_from_slice(&[0, 1, b'a', AttributeAction::SignOnly.tag()]);
        }
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(Error::HeaderParse(msg)) if msg.contains("duplicate")
        ));
    }

    fn empty_prefix() -> Vec<u8> {
        let mut bytes = vec![FORMAT_VERSION, 0x00, 0x01];
        bytes.extend_from_slice(&[0u8; RECORD_SALT_SIZE]);
        bytes
    }

    #[test]
    fn test_header_duplicate_context_key() {
        let mut bytes = empty_prefix();
        // no actions, no data keys, two entries for "k"
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 2]);
        bytes.extend_from_slice(&[0, 1, b'k', 0, 1, b'a']);
        bytes.extend_from_slice(&[0, 1, b'k', 0, 1, b'b']);

        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(Error::HeaderParse(msg)) if msg.contains("duplicate context key")
        ));
    }

    #[test]
    fn test_header_invalid_utf8() {
        let mut bytes = empty_prefix();
        bytes.extend_from_slice(&[0, 1, 0, 1, 0xFF, AttributeAction::SignOnly.tag()]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(Error::HeaderParse(msg)) if msg.contains("UTF-8")
        ));

        let mut bytes = empty_prefix();
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
        bytes.extend_from_slice(&[0, 1, b'k', 0, 2, 0xC3, 0x28]);
        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(Error::HeaderParse(msg)) if msg.contains("UTF-8")
        ));
    }

    #[test]
    fn test_header_field_too_long() {
        let mut actions = BTreeMap::new();
        actions.insert("a".repeat(70_000), AttributeAction::SignOnly);
        let header = Header::new(
            AlgorithmSuiteId::default(),
            [0u8; RECORD_SALT_SIZE],
            actions,
            Vec::new(),
            EncryptionContext::new(),
        );
        assert!(matches!(header.to_bytes(), Err(Error::MalformedValue(_))));
    }

    #[test]
    fn test_from_sealed_splits_tag() {
        let header = header();
        let mut sealed = header.to_bytes().unwrap();
        let body_len = sealed.len();
        sealed.extend_from_slice(&[0xAB; RECORD_TAG_SIZE]);

        let (parsed, body, tag) = Header::from_sealed(&sealed).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body.len(), body_len);
        assert_eq!(tag, &[0xAB; RECORD_TAG_SIZE]);

        assert!(matches!(Header::from_sealed(&[0u8; 10]), Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_into_parsed() {
        let parsed = header().into_parsed();
        assert_eq!(parsed.algorithm_suite, AlgorithmSuiteId::default());
        assert_eq!(parsed.encrypted_data_keys.len(), 2);
        assert_eq!(parsed.stored_context.get("seal-table-name"), Some("orders"));
    }
}
