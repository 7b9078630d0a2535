//! Attribute actions and the per-table action table.

use crate::beacon::StandardBeacon;
use crate::error::Error;
use crate::suite::AlgorithmSuiteId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute names starting with this prefix are reserved for `itemseal`.
pub const RESERVED_PREFIX: &str = "seal_";

/// What happens to an attribute when a record is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeAction {
    /// Stored as-is and not authenticated.
    DoNothing,
    /// Stored as-is and covered by the record tag.
    SignOnly,
    /// Replaced by ciphertext and covered by the record tag.
    EncryptAndSign,
}

impl AttributeAction {
    /// Header wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::DoNothing => 0x00,
            Self::SignOnly => 0x01,
            Self::EncryptAndSign => 0x02,
        }
    }

    /// Parses a header wire tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Self::DoNothing),
            0x01 => Some(Self::SignOnly),
            0x02 => Some(Self::EncryptAndSign),
            _ => None,
        }
    }

    /// Returns `true` for actions covered by the record tag.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        !matches!(self, Self::DoNothing)
    }
}

impl fmt::Display for AttributeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DoNothing => "DO_NOTHING",
            Self::SignOnly => "SIGN_ONLY",
            Self::EncryptAndSign => "ENCRYPT_AND_SIGN",
        })
    }
}

/// Configuration of one logical table.
///
/// This is a plain description; it is validated once when it is turned into
/// an [`AttributeActionTable`] (or a [`RecordEncryptor`]).
///
/// [`RecordEncryptor`]: crate::encryptor::RecordEncryptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableConfig {
    /// Logical table name bound into every encryption context.
    pub logical_table_name: String,
    /// Partition key attribute name.
    pub partition_key_name: String,
    /// Optional sort key attribute name.
    pub sort_key_name: Option<String>,
    /// Explicit per-attribute actions.
    pub attribute_actions: BTreeMap<String, AttributeAction>,
    /// Attributes that may stay unauthenticated without an explicit action.
    pub allowed_unauthenticated_attributes: BTreeSet<String>,
    /// Name prefix of attributes that may stay unauthenticated.
    pub allowed_unauthenticated_attribute_prefix: Option<String>,
    /// Action for attributes nothing else matches. `None` means every
    /// attribute must be covered by some rule.
    pub default_action: Option<AttributeAction>,
    /// Sign-only attributes whose value is also bound into the encryption
    /// context.
    pub include_in_context: BTreeSet<String>,
    /// Algorithm suite for new records.
    pub algorithm_suite: AlgorithmSuiteId,
    /// Standard beacons computed on encrypt.
    pub beacons: Vec<StandardBeacon>,
}

impl TableConfig {
    /// Creates a configuration with only the table identity set.
    #[must_use]
    pub fn new(
        logical_table_name: impl Into<String>,
        partition_key_name: impl Into<String>,
    ) -> Self {
        Self {
            logical_table_name: logical_table_name.into(),
            partition_key_name: partition_key_name.into(),
            ..Self::default()
        }
    }
}

/// Resolved, immutable mapping from attribute name to action.
#[derive(Debug, Clone)]
pub struct AttributeActionTable {
    partition_key_name: String,
    sort_key_name: Option<String>,
    overrides: BTreeMap<String, AttributeAction>,
    unauthenticated: BTreeSet<String>,
    unauthenticated_prefix: Option<String>,
    default_action: Option<AttributeAction>,
}

impl AttributeActionTable {
    /// Validates the action rules of `config`.
    ///
    /// # Errors
    ///
    /// - `Error::AttributeActionViolation` if a key attribute is configured
    ///   `ENCRYPT_AND_SIGN`
    /// - `Error::Configuration` if the table identity is incomplete, a
    ///   signed attribute is also matched by an unauthenticated rule, or a
    ///   configured name is reserved
    pub fn new(config: &TableConfig) -> Result<Self, Error> {
        if config.logical_table_name.is_empty() {
            return Err(Error::Configuration("logical table name is empty".to_string()));
        }
        if config.partition_key_name.is_empty() {
            return Err(Error::Configuration("partition key name is empty".to_string()));
        }
        if let Some(sort) = &config.sort_key_name {
            if sort.is_empty() || *sort == config.partition_key_name {
                return Err(Error::Configuration(format!("invalid sort key name: {sort:?}")));
            }
        }
        if config.allowed_unauthenticated_attribute_prefix.as_deref() == Some("") {
            return Err(Error::Configuration(
                "unauthenticated attribute prefix is empty".to_string(),
            ));
        }

        let table = Self {
            partition_key_name: config.partition_key_name.clone(),
            sort_key_name: config.sort_key_name.clone(),
            overrides: config.attribute_actions.clone(),
            unauthenticated: config.allowed_unauthenticated_attributes.clone(),
            unauthenticated_prefix: config.allowed_unauthenticated_attribute_prefix.clone(),
            default_action: config.default_action,
        };

        let configured = config
            .attribute_actions
            .keys()
            .chain(&config.allowed_unauthenticated_attributes)
            .chain(std::iter::once(&config.partition_key_name))
            .chain(config.sort_key_name.iter());
        for name in configured {
            if name.starts_with(RESERVED_PREFIX) {
                return Err(Error::Configuration(format!(
                    "attribute {name} uses the reserved prefix {RESERVED_PREFIX}"
                )));
            }
        }

        for key in table.key_names() {
            if table.overrides.get(key) == Some(&AttributeAction::EncryptAndSign) {
                return Err(Error::AttributeActionViolation(format!(
                    "key attribute {key} cannot be ENCRYPT_AND_SIGN"
                )));
            }
        }

        for (name, action) in &table.overrides {
            if action.is_signed() && table.is_unauthenticated(name) {
                return Err(Error::Configuration(format!(
                    "attribute {name} is configured {action} but is also allowed unauthenticated"
                )));
            }
        }
        for key in table.key_names() {
            if !table.overrides.contains_key(key) && table.is_unauthenticated(key) {
                return Err(Error::Configuration(format!(
                    "key attribute {key} is matched by an unauthenticated rule \
                     without an explicit action"
                )));
            }
        }

        Ok(table)
    }

    /// Returns the action for `name`, or `None` if no rule covers it.
    ///
    /// Resolution order: explicit override, key attribute (`SIGN_ONLY`),
    /// unauthenticated prefix, unauthenticated allow-list, default action.
    #[must_use]
    pub fn action_for(&self, name: &str) -> Option<AttributeAction> {
        if let Some(action) = self.overrides.get(name) {
            return Some(*action);
        }
        if self.is_key(name) {
            return Some(AttributeAction::SignOnly);
        }
        if self.matches_prefix(name) || self.unauthenticated.contains(name) {
            return Some(AttributeAction::DoNothing);
        }
        self.default_action
    }

    /// Like [`Self::action_for`] but fails for uncovered attributes.
    ///
    /// # Errors
    ///
    /// Returns `Error::AttributeActionViolation` if no rule covers `name`.
    pub fn require_action(&self, name: &str) -> Result<AttributeAction, Error> {
        self.action_for(name).ok_or_else(|| {
            Error::AttributeActionViolation(format!("no action configured for attribute {name}"))
        })
    }

    /// Partition key name.
    #[must_use]
    pub fn partition_key_name(&self) -> &str {
        &self.partition_key_name
    }

    /// Sort key name, if configured.
    #[must_use]
    pub fn sort_key_name(&self) -> Option<&str> {
        self.sort_key_name.as_deref()
    }

    /// Returns `true` if `name` is the partition or sort key.
    #[must_use]
    pub fn is_key(&self, name: &str) -> bool {
        name == self.partition_key_name || self.sort_key_name.as_deref() == Some(name)
    }

    /// Orders attribute names for signing: partition key, sort key, then the
    /// rest in name order.
    pub fn signing_order<'a, I>(&self, names: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut keys: Vec<&str> = Vec::with_capacity(2);
        let mut rest: Vec<&str> = Vec::new();
        for name in names {
            if self.is_key(name) {
                keys.push(name);
            } else {
                rest.push(name);
            }
        }
        keys.sort_by_key(|name| *name != self.partition_key_name);
        rest.sort_unstable();
        keys.extend(rest);
        keys
    }

    fn key_names(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.partition_key_name).chain(self.sort_key_name.iter())
    }

    fn matches_prefix(&self, name: &str) -> bool {
        self.unauthenticated_prefix.as_deref().is_some_and(|prefix| name.starts_with(prefix))
    }

    fn is_unauthenticated(&self, name: &str) -> bool {
        self.matches_prefix(name) || self.unauthenticated.contains(name)
    }
}
