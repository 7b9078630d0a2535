//! Record encryption and decryption engine.
//!
//! [`RecordEncryptor`] ties the other modules together: it classifies every
//! attribute with the [`AttributeActionTable`], builds the encryption context,
//! obtains a data key from the [`MaterialProvider`], derives per-record keys,
//! encrypts and signs attributes, computes beacons and seals the header.
//!
//! Encryption and decryption are all-or-nothing: on any error the caller gets
//! the error and no partially transformed record.

use crate::action::{AttributeAction, AttributeActionTable, TableConfig, RESERVED_PREFIX};
use crate::beacon::{BeaconGenerator, BeaconKeySource};
use crate::context::build_encryption_context;
use crate::error::Error;
use crate::header::{Header, ParsedHeader};
use crate::kdf::{generate_record_salt, RecordKeys};
use crate::material::{resolve_decryption_materials, resolve_encryption_materials, MaterialProvider};
use crate::signature::RecordTag;
use crate::suite::{AlgorithmSuiteId, NONCE_SIZE};
use crate::value::{AttributeValue, Record};
use secrecy::ExposeSecret;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Reserved attribute holding the sealed header in embedded records.
pub const HEADER_ATTRIBUTE: &str = "seal_head";

/// Authentication tag size of both AEAD suites.
const AEAD_TAG_SIZE: usize = 16;

/// An encrypted record and its sealed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    /// Transformed record, ready to store.
    pub record: Record,
    /// Sealed header bytes (header body followed by the record tag).
    pub header: Vec<u8>,
}

impl EncryptedRecord {
    /// Stores the header inside the record under [`HEADER_ATTRIBUTE`].
    #[must_use]
    pub fn into_embedded(self) -> Record {
        let mut record = self.record;
        record.insert(HEADER_ATTRIBUTE.to_string(), AttributeValue::B(self.header));
        record
    }
}

/// A decrypted record and the verified header it was read with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRecord {
    /// Plaintext record, without beacon or header fields.
    pub record: Record,
    /// Verified header, for audit.
    pub parsed_header: ParsedHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    HeaderParsed,
    ContextBuilt,
    MaterialResolved,
    TagVerified,
    AttributesTransformed,
    HeaderAssembled,
    Done,
}

/// Tracks and traces the stage of one record operation.
struct Progress<'a> {
    op: &'static str,
    table: &'a str,
    stage: Stage,
}

impl<'a> Progress<'a> {
    fn start(op: &'static str, table: &'a str) -> Self {
        tracing::debug!(op, table, stage = ?Stage::Init, "record operation started");
        Self {
            op,
            table,
            stage: Stage::Init,
        }
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::debug!(op = self.op, table = self.table, stage = ?stage, "record stage");
    }

    fn fail(&self, err: &Error) {
        match err {
            Error::Integrity(_) | Error::EncryptionContextMismatch(_) => tracing::warn!(
                op = self.op,
                table = self.table,
                stage = ?self.stage,
                error = %err,
                "record failed verification"
            ),
            _ => tracing::debug!(
                op = self.op,
                table = self.table,
                stage = ?self.stage,
                error = %err,
                "record operation failed"
            ),
        }
    }
}

struct Inner<P> {
    config: TableConfig,
    actions: AttributeActionTable,
    provider: P,
    beacons: Option<BeaconGenerator>,
    beacon_locs: BTreeSet<String>,
}

/// Encrypts and decrypts records of one logical table.
///
/// Cloning is cheap; clones share the configuration, the provider and the
/// beacon key cache, and may be used from many threads at once.
///
/// # Example
///
/// ```ignore
/// use itemseal::prelude::*;
/// use itemseal_key_file::FileKeyring;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut config = TableConfig::new("orders", "pk");
/// config.attribute_actions.insert("card".into(), AttributeAction::EncryptAndSign);
///
/// let encryptor = RecordEncryptor::new(config, FileKeyring::open("./keys", "kek_v1")?, None)?;
///
/// let mut record = Record::new();
/// record.insert("pk".into(), AttributeValue::string("order#1"));
/// record.insert("card".into(), AttributeValue::string("4111 1111 1111 1111"));
///
/// let encrypted = encryptor.encrypt(&record)?;
/// let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header)?;
/// assert_eq!(decrypted.record, record);
/// # Ok(())
/// # }
/// ```
pub struct RecordEncryptor<P: MaterialProvider> {
    inner: Arc<Inner<P>>,
}

impl<P: MaterialProvider> Clone for RecordEncryptor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: MaterialProvider> fmt::Debug for RecordEncryptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordEncryptor")
            .field("table", &self.inner.config.logical_table_name)
            .field("suite", &self.inner.config.algorithm_suite)
            .field("beacons", &self.inner.beacons)
            .finish_non_exhaustive()
    }
}

impl<P: MaterialProvider> RecordEncryptor<P> {
    /// Validates `config` and creates an encryptor.
    ///
    /// # Arguments
    ///
    /// * `config` - Table configuration
    /// * `provider` - Source of record data keys
    /// * `beacon_key_source` - Beacon keys; required when beacons are configured
    ///
    /// # Errors
    ///
    /// - `Error::Configuration` for contradictory action rules, an
    ///   include-in-context attribute that is not `SIGN_ONLY`, a beacon over
    ///   an attribute that is not `ENCRYPT_AND_SIGN`, a beacon target field
    ///   that collides with a configured attribute, or beacons without a key
    ///   source
    /// - `Error::AttributeActionViolation` if a key attribute is configured
    ///   `ENCRYPT_AND_SIGN`
    pub fn new(
        config: TableConfig,
        provider: P,
        beacon_key_source: Option<BeaconKeySource>,
    ) -> Result<Self, Error> {
        let actions = AttributeActionTable::new(&config)?;

        for name in &config.include_in_context {
            if actions.action_for(name) != Some(AttributeAction::SignOnly) {
                return Err(Error::Configuration(format!(
                    "attribute {name} is included in the encryption context but is not SIGN_ONLY"
                )));
            }
        }

        let beacons = beacon_generator(&config, &actions, beacon_key_source)?;
        let beacon_locs = config.beacons.iter().map(|b| b.loc().to_string()).collect();

        tracing::debug!(
            table = %config.logical_table_name,
            suite = %config.algorithm_suite,
            beacons = config.beacons.len(),
            "record encryptor configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                actions,
                provider,
                beacons,
                beacon_locs,
            }),
        })
    }

    /// Table configuration.
    #[must_use]
    pub fn config(&self) -> &TableConfig {
        &self.inner.config
    }

    /// Computes the stored beacon for `value` under the beacon `beacon_name`,
    /// e.g. to turn a search term into a query value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no such beacon is configured, plus
    /// any error from [`BeaconGenerator::beacon_value`].
    pub fn beacon_value(&self, beacon_name: &str, value: &AttributeValue) -> Result<String, Error> {
        let unknown = || Error::Configuration(format!("no beacon named {beacon_name}"));
        let generator = self.inner.beacons.as_ref().ok_or_else(unknown)?;
        let beacon = generator.beacon(beacon_name).ok_or_else(unknown)?;
        generator.beacon_value(beacon, value)
    }

    /// Encrypts and signs `record`.
    ///
    /// # Errors
    ///
    /// - `Error::AttributeActionViolation` if the record carries a reserved
    ///   or beacon target attribute, or an attribute no rule covers
    /// - `Error::MissingKeyAttribute` if a key attribute is absent
    /// - `Error::KeyUnavailable` or `Error::MaterialProvider` if no data key
    ///   could be obtained
    /// - `Error::UnsupportedValue` for numbers that are not decimal text, or
    ///   lists and maps nested deeper than [`MAX_NESTING_DEPTH`]
    /// - `Error::MalformedValue` if the header cannot hold the record: an
    ///   attribute name or context value over 65535 bytes, or more than 65535
    ///   signed attributes
    ///
    /// [`MAX_NESTING_DEPTH`]: crate::value::MAX_NESTING_DEPTH
    pub fn encrypt(&self, record: &Record) -> Result<EncryptedRecord, Error> {
        self.traced("encrypt", |progress| self.encrypt_record(record, progress))
    }

    /// Verifies and decrypts `record` using its sealed `header`.
    ///
    /// Beacon target fields and [`HEADER_ATTRIBUTE`] are dropped from the
    /// result.
    ///
    /// # Errors
    ///
    /// - `Error::HeaderParse` or `Error::UnsupportedValue` for a bad header
    /// - `Error::EncryptionContextMismatch` if the record's context differs
    ///   from the stored one
    /// - `Error::KeyUnavailable` if no provider key unwraps the data key
    /// - `Error::Integrity` if a signed attribute is missing, added or altered
    /// - `Error::AttributeActionViolation` for an attribute no rule covers
    pub fn decrypt(&self, record: &Record, header: &[u8]) -> Result<DecryptedRecord, Error> {
        self.traced("decrypt", |progress| {
            self.decrypt_record(record, header, progress)
        })
    }

    /// Decrypts a record whose header is stored under [`HEADER_ATTRIBUTE`].
    ///
    /// # Errors
    ///
    /// Returns `Error::HeaderParse` if the header attribute is absent or not
    /// binary, plus any error from [`Self::decrypt`].
    pub fn decrypt_embedded(&self, record: &Record) -> Result<DecryptedRecord, Error> {
        match record.get(HEADER_ATTRIBUTE) {
            Some(AttributeValue::B(header)) => self.decrypt(record, header),
            Some(_) => Err(Error::HeaderParse(format!("{HEADER_ATTRIBUTE} is not binary"))),
            None => Err(Error::HeaderParse(format!("record has no {HEADER_ATTRIBUTE} attribute"))),
        }
    }

    fn traced<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Progress<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut progress = Progress::start(op, &self.inner.config.logical_table_name);
        let result = f(&mut progress);
        match &result {
            Ok(_) => progress.advance(Stage::Done),
            Err(err) => progress.fail(err),
        }
        result
    }

    fn encrypt_record(
        &self,
        record: &Record,
        progress: &mut Progress<'_>,
    ) -> Result<EncryptedRecord, Error> {
        let inner = &*self.inner;
        let suite = inner.config.algorithm_suite;

        let mut actions: BTreeMap<&str, AttributeAction> = BTreeMap::new();
        for name in record.keys() {
            if name.starts_with(RESERVED_PREFIX) || inner.beacon_locs.contains(name) {
                return Err(Error::AttributeActionViolation(format!(
                    "record contains reserved attribute {name}"
                )));
            }
            actions.insert(name, inner.actions.require_action(name)?);
        }

        let context = build_encryption_context(
            record,
            &inner.config.logical_table_name,
            &inner.actions,
            &inner.config.include_in_context,
        )?;
        progress.advance(Stage::ContextBuilt);

        let materials = resolve_encryption_materials(&inner.provider, &context, suite)?;
        progress.advance(Stage::MaterialResolved);

        let salt = generate_record_salt();
        let keys = RecordKeys::derive(materials.plaintext_data_key.expose_secret(), &salt, suite)?;

        // Only signed attributes are recorded in the header
        let signed = actions
            .iter()
            .filter(|(_, action)| action.is_signed())
            .map(|(name, action)| ((*name).to_string(), *action))
            .collect();
        let header = Header::new(suite, salt, signed, materials.encrypted_data_keys, context);
        let mut sealed = header.to_bytes()?;
        let mut tag = RecordTag::new(keys.mac_key(), &sealed)?;

        let mut output = Record::new();
        let mut counter = 0u64;
        for name in inner.actions.signing_order(actions.keys().copied()) {
            let value = &record[name];
            let action = actions[name];
            let stored = match action {
                AttributeAction::DoNothing => value.clone(),
                AttributeAction::SignOnly => {
                    tag.update(name, action, &value.to_canonical_bytes()?)?;
                    value.clone()
                }
                AttributeAction::EncryptAndSign => {
                    let blob = seal_attribute(suite, &keys, counter, name, value)?;
                    counter += 1;
                    tag.update(name, action, &blob)?;
                    AttributeValue::B(blob)
                }
            };
            output.insert(name.to_string(), stored);
        }

        if let Some(generator) = &inner.beacons {
            for beacon in generator.beacons() {
                if let Some(value) = record.get(beacon.name()) {
                    let hash = generator.beacon_value(beacon, value)?;
                    output.insert(beacon.loc().to_string(), AttributeValue::S(hash));
                }
            }
        }
        progress.advance(Stage::AttributesTransformed);

        sealed.extend_from_slice(&tag.finalize());
        progress.advance(Stage::HeaderAssembled);

        Ok(EncryptedRecord {
            record: output,
            header: sealed,
        })
    }

    fn decrypt_record(
        &self,
        record: &Record,
        sealed: &[u8],
        progress: &mut Progress<'_>,
    ) -> Result<DecryptedRecord, Error> {
        let inner = &*self.inner;

        let (header, body, expected_tag) = Header::from_sealed(sealed)?;
        progress.advance(Stage::HeaderParsed);

        let mut output: Record = record
            .iter()
            .filter(|(name, _)| *name != HEADER_ATTRIBUTE && !inner.beacon_locs.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let context = build_encryption_context(
            &output,
            &inner.config.logical_table_name,
            &inner.actions,
            &inner.config.include_in_context,
        )?;
        if context != *header.stored_context() {
            let keys = context.diff_keys(header.stored_context());
            return Err(Error::EncryptionContextMismatch(format!(
                "record does not match the stored context (keys: {})",
                keys.join(", ")
            )));
        }
        progress.advance(Stage::ContextBuilt);

        let suite = header.algorithm_suite();
        let materials = resolve_decryption_materials(
            &inner.provider,
            &context,
            suite,
            header.encrypted_data_keys(),
        )?;
        progress.advance(Stage::MaterialResolved);

        let signed = header.attribute_actions();
        if let Some(name) = signed.keys().find(|name| !output.contains_key(*name)) {
            return Err(Error::Integrity(format!("signed attribute {name} is missing")));
        }
        for name in output.keys().filter(|name| !signed.contains_key(*name)) {
            match inner.actions.require_action(name)? {
                AttributeAction::DoNothing => {}
                action => {
                    return Err(Error::Integrity(format!(
                        "attribute {name} is {action} but was not signed"
                    )));
                }
            }
        }

        let keys = RecordKeys::derive(
            materials.plaintext_data_key.expose_secret(),
            header.record_salt(),
            suite,
        )?;
        let mut tag = RecordTag::new(keys.mac_key(), body)?;
        for name in inner.actions.signing_order(signed.keys().map(String::as_str)) {
            let action = signed[name];
            match (&output[name], action) {
                (AttributeValue::B(blob), AttributeAction::EncryptAndSign) => {
                    tag.update(name, action, blob)?;
                }
                (_, AttributeAction::EncryptAndSign) => return Err(not_binary(name)),
                (value, _) => tag.update(name, action, &value.to_canonical_bytes()?)?,
            }
        }
        tag.verify(expected_tag)?;
        progress.advance(Stage::TagVerified);

        for (name, action) in signed {
            if *action != AttributeAction::EncryptAndSign {
                continue;
            }
            let plaintext = match output.get(name) {
                Some(AttributeValue::B(blob)) => open_attribute(suite, &keys, name, blob)?,
                _ => return Err(not_binary(name)),
            };
            output.insert(name.clone(), plaintext);
        }
        progress.advance(Stage::AttributesTransformed);

        Ok(DecryptedRecord {
            record: output,
            parsed_header: header.into_parsed(),
        })
    }
}

fn beacon_generator(
    config: &TableConfig,
    actions: &AttributeActionTable,
    source: Option<BeaconKeySource>,
) -> Result<Option<BeaconGenerator>, Error> {
    if config.beacons.is_empty() {
        return Ok(None);
    }
    let source = source.ok_or_else(|| {
        Error::Configuration("beacons are configured without a beacon key source".to_string())
    })?;

    for beacon in &config.beacons {
        if actions.action_for(beacon.name()) != Some(AttributeAction::EncryptAndSign) {
            return Err(Error::Configuration(format!(
                "beacon {} must be over an ENCRYPT_AND_SIGN attribute",
                beacon.name()
            )));
        }
        let loc = beacon.loc();
        let collides = actions.is_key(loc)
            || config.attribute_actions.contains_key(loc)
            || config.allowed_unauthenticated_attributes.contains(loc)
            || config.include_in_context.contains(loc)
            || config.beacons.iter().any(|other| other.name() == loc);
        if collides {
            return Err(Error::Configuration(format!(
                "beacon {} target field {loc} collides with a configured attribute",
                beacon.name()
            )));
        }
    }

    BeaconGenerator::new(config.beacons.clone(), source).map(Some)
}

/// `[nonce:12][aead ciphertext + tag]` over the value's canonical bytes, with
/// the attribute name as associated data.
fn seal_attribute(
    suite: AlgorithmSuiteId,
    keys: &RecordKeys,
    counter: u64,
    name: &str,
    value: &AttributeValue,
) -> Result<Vec<u8>, Error> {
    let nonce = keys.nonce(counter);
    let plaintext = Zeroizing::new(value.to_canonical_bytes()?);
    let ciphertext = suite.seal(keys.encryption_key(), &nonce, &plaintext, name.as_bytes())?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn not_binary(name: &str) -> Error {
    Error::Integrity(format!("encrypted attribute {name} is not binary"))
}

fn open_attribute(
    suite: AlgorithmSuiteId,
    keys: &RecordKeys,
    name: &str,
    blob: &[u8],
) -> Result<AttributeValue, Error> {
    if blob.len() < NONCE_SIZE + AEAD_TAG_SIZE {
        return Err(Error::Integrity(format!("encrypted attribute {name} is truncated")));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| Error::Integrity(format!("encrypted attribute {name} has a bad nonce")))?;

    let plaintext =
        Zeroizing::new(suite.open(keys.encryption_key(), &nonce, ciphertext, name.as_bytes())?);
    AttributeValue::from_canonical_bytes(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::StandardBeacon;
    use crate::material::tests::MockProvider;
    use crate::material::EncryptedDataKey;
    use secrecy::SecretVec;

    fn config() -> TableConfig {
        let mut config = TableConfig::new("orders", "partitionKey");
        config.attribute_actions.insert("partitionKey".into(), AttributeAction::DoNothing);
        config.attribute_actions.insert("secret".into(), AttributeAction::EncryptAndSign);
        config.attribute_actions.insert("note".into(), AttributeAction::SignOnly);
        config
    }

    fn record() -> Record {
        let mut record = Record::new();
        record.insert("partitionKey".into(), AttributeValue::string("pk1"));
        record.insert("secret".into(), AttributeValue::string("abc"));
        record.insert("note".into(), AttributeValue::string("x"));
        record
    }

    fn encryptor(config: TableConfig) -> RecordEncryptor<MockProvider> {
        RecordEncryptor::new(config, MockProvider::new(), None).unwrap()
    }

    fn beacon_config() -> TableConfig {
        let mut config = config();
        config.beacons.push(StandardBeacon::new("secret", 16, None).unwrap());
        config
    }

    fn beacon_encryptor() -> RecordEncryptor<MockProvider> {
        let source = BeaconKeySource::single(SecretVec::new(vec![7u8; 32]));
        RecordEncryptor::new(beacon_config(), MockProvider::new(), Some(source)).unwrap()
    }

    /// Rebuilds a sealed header with a modified body and the original tag.
    fn reseal(sealed: &[u8], edit: impl FnOnce(ParsedHeader) -> Header) -> Vec<u8> {
        let (header, _, tag) = Header::from_sealed(sealed).unwrap();
        let mut out = edit(header.into_parsed()).to_bytes().unwrap();
        out.extend_from_slice(tag);
        out
    }

    #[test]
    fn test_round_trip() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();

        assert_eq!(
            encrypted.record["partitionKey"],
            AttributeValue::string("pk1")
        );
        assert_eq!(encrypted.record["note"], AttributeValue::string("x"));
        assert!(matches!(
            &encrypted.record["secret"],
            AttributeValue::B(blob) if !blob.windows(3).any(|w| w == b"abc")
        ));

        let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();
        assert_eq!(decrypted.record, record());
    }

    #[test]
    fn test_round_trip_both_suites() {
        for suite in
            [AlgorithmSuiteId::ChaCha20Poly1305HkdfSha256, AlgorithmSuiteId::Aes256GcmHkdfSha256]
        {
            let mut config = config();
            config.algorithm_suite = suite;
            let encryptor = encryptor(config);

            let encrypted = encryptor.encrypt(&record()).unwrap();
            let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();

            assert_eq!(decrypted.record, record());
            assert_eq!(decrypted.parsed_header.algorithm_suite, suite);
        }
    }

    #[test]
    fn test_ciphertext_layout() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();
        let canonical_len = AttributeValue::string("abc").to_canonical_bytes().unwrap().len();

        let AttributeValue::B(blob) = &encrypted.record["secret"] else { panic!("not binary") };
        assert_eq!(blob.len(), NONCE_SIZE + canonical_len + AEAD_TAG_SIZE);
    }

    #[test]
    fn test_encryption_is_randomized() {
        let encryptor = encryptor(config());
        let a = encryptor.encrypt(&record()).unwrap();
        let b = encryptor.encrypt(&record()).unwrap();

        assert_ne!(a.record["secret"], b.record["secret"]);
        assert_ne!(a.header, b.header);
    }

    #[test]
    fn test_distinct_nonces_within_record() {
        let mut config = config();
        config.attribute_actions.insert("secret2".into(), AttributeAction::EncryptAndSign);
        let encryptor = encryptor(config);
        let mut record = record();
        record.insert("secret2".into(), AttributeValue::string("abc"));

        let encrypted = encryptor.encrypt(&record).unwrap();
        let (AttributeValue::B(a), AttributeValue::B(b)) =
            (&encrypted.record["secret"], &encrypted.record["secret2"])
        else {
            panic!("not binary")
        };
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_header_records_signed_attributes_only() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();
        let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();

        let actions = &decrypted.parsed_header.attribute_actions;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions["secret"], AttributeAction::EncryptAndSign);
        assert_eq!(actions["note"], AttributeAction::SignOnly);
        assert!(!actions.contains_key("partitionKey"));
    }

    #[test]
    fn test_do_nothing_attribute_may_change() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        let mut config = config();
        config.allowed_unauthenticated_attributes.insert("ttl".into());
        let lenient = RecordEncryptor::new(config, MockProvider::new(), None).unwrap();
        encrypted.record.insert("ttl".into(), AttributeValue::number(60));

        let decrypted = lenient.decrypt(&encrypted.record, &encrypted.header).unwrap();
        assert_eq!(decrypted.record["ttl"], AttributeValue::number(60));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        if let Some(AttributeValue::B(blob)) = encrypted.record.get_mut("secret") {
            let last = blob.len() - 1;
            blob[last] ^= 0x01;
        }

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_tampered_sign_only_value() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        encrypted.record.insert("note".into(), AttributeValue::string("y"));

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_tampered_partition_key_is_context_mismatch() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        encrypted.record.insert("partitionKey".into(), AttributeValue::string("pk2"));

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::EncryptionContextMismatch(_))));
    }

    #[test]
    fn test_tampered_record_tag() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        let last = encrypted.header.len() - 1;
        encrypted.header[last] ^= 0x80;

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_tampered_header_actions() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();

        // downgrade "secret" to SIGN_ONLY; the tag no longer matches
        let header = reseal(&encrypted.header, |parsed| {
            let mut actions = parsed.attribute_actions;
            actions.insert("secret".into(), AttributeAction::SignOnly);
            Header::new(
                parsed.algorithm_suite,
                [0u8; 16],
                actions,
                parsed.encrypted_data_keys,
                parsed.stored_context,
            )
        });
        let result = encryptor.decrypt(&encrypted.record, &header);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_tampered_header_context() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();

        let header = reseal(&encrypted.header, |parsed| {
            let (header, _, _) = Header::from_sealed(&encrypted.header).unwrap();
            Header::new(
                parsed.algorithm_suite,
                *header.record_salt(),
                parsed.attribute_actions,
                parsed.encrypted_data_keys,
                parsed.stored_context.with_entry("tenant", "evil"),
            )
        });
        let result = encryptor.decrypt(&encrypted.record, &header);
        assert!(matches!(
            result,
            Err(Error::EncryptionContextMismatch(msg)) if msg.contains("tenant")
        ));
    }

    #[test]
    fn test_unknown_edk_is_key_unavailable() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();

        let header = reseal(&encrypted.header, |parsed| {
            let (header, _, _) = Header::from_sealed(&encrypted.header).unwrap();
            Header::new(
                parsed.algorithm_suite,
                *header.record_salt(),
                parsed.attribute_actions,
                vec![EncryptedDataKey::new("other", "kek_v9", vec![0u8; 32])],
                parsed.stored_context,
            )
        });
        let result = encryptor.decrypt(&encrypted.record, &header);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_wrong_wrapping_key_fails_integrity() {
        let encrypted = encryptor(config()).encrypt(&record()).unwrap();
        let mut provider = MockProvider::new();
        provider.kek = vec![43u8; 32];
        let other = RecordEncryptor::new(config(), provider, None).unwrap();

        let result = other.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    #[test]
    fn test_missing_signed_attribute() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        encrypted.record.remove("note");

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(msg)) if msg.contains("note")));
    }

    #[test]
    fn test_extra_signed_attribute() {
        let mut config = config();
        config.default_action = Some(AttributeAction::SignOnly);
        let encryptor = encryptor(config);
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        encrypted.record.insert("extra".into(), AttributeValue::Bool(true));

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(result, Err(Error::Integrity(msg)) if msg.contains("extra")));
    }

    #[test]
    fn test_uncovered_attribute_on_decrypt() {
        let encryptor = encryptor(config());
        let mut encrypted = encryptor.encrypt(&record()).unwrap();
        encrypted.record.insert("unknown".into(), AttributeValue::Null);

        let result = encryptor.decrypt(&encrypted.record, &encrypted.header);
        assert!(matches!(
            result,
            Err(Error::AttributeActionViolation(msg)) if msg.contains("unknown")
        ));
    }

    #[test]
    fn test_exhaustive_mode_rejects_unknown_attribute() {
        let encryptor = encryptor(config());
        let mut record = record();
        record.insert("unknown".into(), AttributeValue::Null);

        let result = encryptor.encrypt(&record);
        assert!(matches!(
            result,
            Err(Error::AttributeActionViolation(msg)) if msg.contains("unknown")
        ));
    }

    #[test]
    fn test_default_action_covers_unknown_attribute() {
        let mut config = config();
        config.default_action = Some(AttributeAction::EncryptAndSign);
        let encryptor = encryptor(config);
        let mut record = record();
        record.insert(
            "unknown".into(),
            AttributeValue::L(vec![AttributeValue::Null]),
        );

        let encrypted = encryptor.encrypt(&record).unwrap();
        assert!(matches!(encrypted.record["unknown"], AttributeValue::B(_)));
        assert_eq!(
            encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap().record,
            record
        );
    }

    #[test]
    fn test_reserved_attribute_in_record() {
        let encryptor = encryptor(config());
        let mut record = record();
        record.insert("seal_x".into(), AttributeValue::Null);

        assert!(matches!(
            encryptor.encrypt(&record),
            Err(Error::AttributeActionViolation(_))
        ));
    }

    #[test]
    fn test_missing_partition_key() {
        let encryptor = encryptor(config());
        let mut record = record();
        record.remove("partitionKey");

        assert!(matches!(
            encryptor.encrypt(&record),
            Err(Error::MissingKeyAttribute(name)) if name == "partitionKey"
        ));
    }

    #[test]
    fn test_invalid_partition_key_number() {
        let encryptor = encryptor(config());
        let mut record = record();
        record.insert("partitionKey".into(), AttributeValue::N("12abc".into()));

        assert!(matches!(encryptor.encrypt(&record), Err(Error::UnsupportedValue(_))));
    }

    #[test]
    fn test_attribute_name_too_long_for_header() {
        let mut config = config();
        config.default_action = Some(AttributeAction::SignOnly);
        let encryptor = encryptor(config);
        let mut record = record();
        record.insert("x".repeat(70_000), AttributeValue::string("v"));

        assert!(matches!(
            encryptor.encrypt(&record),
            Err(Error::MalformedValue(msg)) if msg.contains("attribute name too long")
        ));
    }

    #[test]
    fn test_too_deeply_nested_value() {
        let mut value = AttributeValue::Null;
        for _ in 0..=crate::value::MAX_NESTING_DEPTH {
            value = AttributeValue::L(vec![value]);
        }
        let mut record = record();
        record.insert("secret".into(), value);

        let encryptor = encryptor(config());
        assert!(matches!(encryptor.encrypt(&record), Err(Error::UnsupportedValue(_))));
    }

    #[test]
    fn test_sort_key_round_trip() {
        let mut config = config();
        config.sort_key_name = Some("sk".into());
        let encryptor = encryptor(config);
        let mut record = record();
        record.insert("sk".into(), AttributeValue::number("1.50"));

        let encrypted = encryptor.encrypt(&record).unwrap();
        let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();
        assert_eq!(decrypted.record, record);
        assert_eq!(
            decrypted.parsed_header.stored_context.get("seal-sort-value"),
            Some("N:1.5E0")
        );
    }

    #[test]
    fn test_include_in_context() {
        let mut config = config();
        config.include_in_context.insert("note".into());
        let encryptor = encryptor(config);
        let encrypted = encryptor.encrypt(&record()).unwrap();

        let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();
        assert_eq!(
            decrypted.parsed_header.stored_context.get("seal-attr.note"),
            Some("S:x")
        );

        let mut tampered = encrypted.record;
        tampered.insert("note".into(), AttributeValue::string("y"));
        assert!(matches!(
            encryptor.decrypt(&tampered, &encrypted.header),
            Err(Error::EncryptionContextMismatch(_))
        ));
    }

    #[test]
    fn test_include_in_context_must_be_sign_only() {
        let mut config = config();
        config.include_in_context.insert("secret".into());
        let result = RecordEncryptor::new(config, MockProvider::new(), None);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_key_attribute_cannot_be_encrypted() {
        let mut config = config();
        config.attribute_actions.insert("partitionKey".into(), AttributeAction::EncryptAndSign);
        let result = RecordEncryptor::new(config, MockProvider::new(), None);
        assert!(matches!(result, Err(Error::AttributeActionViolation(_))));
    }

    #[test]
    fn test_embedded_header_round_trip() {
        let encryptor = encryptor(config());
        let stored = encryptor.encrypt(&record()).unwrap().into_embedded();
        assert!(matches!(stored.get(HEADER_ATTRIBUTE), Some(AttributeValue::B(_))));

        let decrypted = encryptor.decrypt_embedded(&stored).unwrap();
        assert_eq!(decrypted.record, record());
    }

    #[test]
    fn test_embedded_header_missing() {
        let encryptor = encryptor(config());
        let stored = encryptor.encrypt(&record()).unwrap().record;
        assert!(matches!(
            encryptor.decrypt_embedded(&stored),
            Err(Error::HeaderParse(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let encryptor = encryptor(config());
        let encrypted = encryptor.encrypt(&record()).unwrap();
        let result = encryptor.decrypt(&encrypted.record, &encrypted.header[..10]);
        assert!(matches!(result, Err(Error::HeaderParse(_))));
    }

    #[test]
    fn test_provider_failure_passes_through() {
        let mut provider = MockProvider::new();
        provider.fail_generate = true;
        let encryptor = RecordEncryptor::new(config(), provider, None).unwrap();
        assert!(matches!(
            encryptor.encrypt(&record()),
            Err(Error::MaterialProvider(_))
        ));
    }

    #[test]
    fn test_beacon_written_and_stripped() {
        let encryptor = beacon_encryptor();
        let encrypted = encryptor.encrypt(&record()).unwrap();

        let expected = encryptor.beacon_value("secret", &AttributeValue::string("abc")).unwrap();
        assert_eq!(
            encrypted.record["seal_b_secret"],
            AttributeValue::S(expected.clone())
        );
        assert_eq!(expected.len(), 4);

        let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap();
        assert_eq!(decrypted.record, record());
    }

    #[test]
    fn test_beacon_target_in_input_record() {
        let encryptor = beacon_encryptor();
        let mut record = record();
        record.insert("seal_b_secret".into(), AttributeValue::string("ffff"));
        assert!(matches!(
            encryptor.encrypt(&record),
            Err(Error::AttributeActionViolation(_))
        ));

        let mut config = beacon_config();
        config.beacons =
            vec![StandardBeacon::new("secret", 16, Some("secret_idx".into())).unwrap()];
        let source = BeaconKeySource::single(SecretVec::new(vec![7u8; 32]));
        let custom = RecordEncryptor::new(config, MockProvider::new(), Some(source)).unwrap();
        let mut record = self::record();
        record.insert("secret_idx".into(), AttributeValue::string("ffff"));
        assert!(matches!(
            custom.encrypt(&record),
            Err(Error::AttributeActionViolation(_))
        ));
    }

    #[test]
    fn test_beacon_configuration_errors() {
        let source = || Some(BeaconKeySource::single(SecretVec::new(vec![7u8; 32])));

        // no key source
        assert!(matches!(
            RecordEncryptor::new(beacon_config(), MockProvider::new(), None),
            Err(Error::Configuration(_))
        ));

        // source attribute not encrypted
        let mut config = self::config();
        config.beacons.push(StandardBeacon::new("note", 16, None).unwrap());
        assert!(matches!(
            RecordEncryptor::new(config, MockProvider::new(), source()),
            Err(Error::Configuration(_))
        ));

        // target collides with a configured attribute
        let mut config = self::config();
        config.beacons.push(StandardBeacon::new("secret", 16, Some("note".into())).unwrap());
        assert!(matches!(
            RecordEncryptor::new(config, MockProvider::new(), source()),
            Err(Error::Configuration(_))
        ));

        // target collides with the partition key
        let mut config = self::config();
        config
            .beacons
            .push(StandardBeacon::new("secret", 16, Some("partitionKey".into())).unwrap());
        assert!(matches!(
            RecordEncryptor::new(config, MockProvider::new(), source()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_beacon_name() {
        let encryptor = beacon_encryptor();
        assert!(matches!(
            encryptor.beacon_value("note", &AttributeValue::string("x")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_encryptor_is_send_sync_and_shared() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RecordEncryptor<MockProvider>>();

        let encryptor = encryptor(config());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let encryptor = encryptor.clone();
                std::thread::spawn(move || {
                    let encrypted = encryptor.encrypt(&record()).unwrap();
                    encryptor.decrypt(&encrypted.record, &encrypted.header).unwrap().record
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), record());
        }
    }
}
