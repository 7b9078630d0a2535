//! Encryption context: authenticated metadata bound to every record.

use crate::action::{AttributeAction, AttributeActionTable};
use crate::error::Error;
use crate::value::Record;
use std::collections::BTreeMap;
use std::fmt;

/// Context key binding the logical table name.
pub const TABLE_NAME_KEY: &str = "seal-table-name";
/// Context key binding the partition key name.
pub const PARTITION_NAME_KEY: &str = "seal-partition-name";
/// Context key binding the partition key value.
pub const PARTITION_VALUE_KEY: &str = "seal-partition-value";
/// Context key binding the sort key name.
pub const SORT_NAME_KEY: &str = "seal-sort-name";
/// Context key binding the sort key value.
pub const SORT_VALUE_KEY: &str = "seal-sort-value";
/// Prefix of context keys carrying included attribute values.
pub const ATTRIBUTE_KEY_PREFIX: &str = "seal-attr.";

/// Name → value mapping bound into every record.
///
/// Entries are kept sorted, so equality is order-independent and
/// [`Self::to_canonical_bytes`] is stable.
///
/// # Example
///
/// ```
/// use itemseal::context::EncryptionContext;
///
/// let ctx = EncryptionContext::new()
///     .with_entry("seal-table-name", "orders")
///     .with_entry("tenant", "acme");
/// assert_eq!(ctx.get("tenant"), Some("acme"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionContext {
    entries: BTreeMap<String, String>,
}

impl EncryptionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing any previous value for `key`.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Inserts an entry, returning the previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical serialization used as AEAD associated data by keyrings:
    /// `[count:8]` then `[key_len:8][key][value_len:8][value]` per entry in
    /// sorted order, all big-endian.
    #[must_use]
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        fn put(out: &mut Vec<u8>, bytes: &[u8]) {
            out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
            out.extend_from_slice(bytes);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u64).to_be_bytes());
        for (key, value) in &self.entries {
            put(&mut out, key.as_bytes());
            put(&mut out, value.as_bytes());
        }
        out
    }

    /// Lists the keys whose values differ between `self` and `other`.
    #[must_use]
    pub fn diff_keys(&self, other: &Self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, v)| other.entries.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            other.entries.keys().filter(|k| !self.entries.contains_key(*k)).cloned(),
        );
        keys.sort();
        keys
    }
}

impl fmt::Display for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for EncryptionContext {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Builds the encryption context for `record`.
///
/// Always binds the table name and the key attributes. Each name in
/// `include_in_context` that is present in the record and resolves to
/// `SIGN_ONLY` adds a `seal-attr.<name>` entry holding the value's canonical
/// string. Only plaintext-visible attributes contribute, so the same function
/// runs unchanged on the encrypted record at decrypt time.
///
/// # Errors
///
/// - `Error::MissingKeyAttribute` if the partition (or configured sort) key
///   is absent
/// - `Error::UnsupportedValue` if a contributing number is not valid decimal
///   text
pub fn build_encryption_context<'a, I>(
    record: &Record,
    logical_table_name: &str,
    actions: &AttributeActionTable,
    include_in_context: I,
) -> Result<EncryptionContext, Error>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut ctx = EncryptionContext::new().with_entry(TABLE_NAME_KEY, logical_table_name);

    let partition = actions.partition_key_name();
    let partition_value = record
        .get(partition)
        .ok_or_else(|| Error::MissingKeyAttribute(partition.to_string()))?;
    ctx.insert(PARTITION_NAME_KEY, partition);
    ctx.insert(PARTITION_VALUE_KEY, partition_value.canonical_string()?);

    if let Some(sort) = actions.sort_key_name() {
        let sort_value =
            record.get(sort).ok_or_else(|| Error::MissingKeyAttribute(sort.to_string()))?;
        ctx.insert(SORT_NAME_KEY, sort);
        ctx.insert(SORT_VALUE_KEY, sort_value.canonical_string()?);
    }

    for name in include_in_context {
        if actions.action_for(name) != Some(AttributeAction::SignOnly) {
            continue;
        }
        if let Some(value) = record.get(name) {
            ctx.insert(
                format!("{ATTRIBUTE_KEY_PREFIX}{name}"),
                value.canonical_string()?,
            );
        }
    }

    Ok(ctx)
}
