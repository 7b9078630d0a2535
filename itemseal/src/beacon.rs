//! Standard beacons for searchable encryption.
//!
//! A beacon is a truncated HMAC of an attribute's plaintext, stored next to
//! the ciphertext so equality queries can run without decryption:
//!
//! `HMAC-SHA256(beacon_key(name), canonical_string(value))`, first 8 bytes
//! big-endian, masked to `length` bits, written as lowercase hex.
//!
//! Shorter beacons mean fewer distinct index values (more false positives
//! per query) and therefore leak less about the plaintext; a collision
//! between two distinct values happens with probability about `2^-length`.

use crate::action::RESERVED_PREFIX;
use crate::error::{Error, MaterialProviderError};
use crate::kdf::derive_subkey;
use crate::value::AttributeValue;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Smallest allowed beacon length in bits.
pub const MIN_BEACON_LENGTH: u8 = 1;
/// Largest allowed beacon length in bits.
pub const MAX_BEACON_LENGTH: u8 = 63;
/// Prefix of the default beacon target field.
pub const DEFAULT_BEACON_PREFIX: &str = "seal_b_";

/// A standard beacon over the attribute `name`.
///
/// # Example
///
/// ```
/// use itemseal::beacon::StandardBeacon;
///
/// let beacon = StandardBeacon::new("email", 16, None).unwrap();
/// assert_eq!(beacon.loc(), "seal_b_email");
/// assert!(StandardBeacon::new("email", 64, None).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStandardBeacon", into = "RawStandardBeacon")]
pub struct StandardBeacon {
    name: String,
    length: u8,
    loc: String,
}

impl StandardBeacon {
    /// Creates a beacon definition.
    ///
    /// `loc` names the field the beacon is written to; it defaults to
    /// `seal_b_<name>`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `name` is empty, `length` is outside
    /// `1..=63`, or `loc` is given but empty.
    pub fn new(name: impl Into<String>, length: u32, loc: Option<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Configuration("beacon name is empty".to_string()));
        }
        let length = u8::try_from(length)
            .ok()
            .filter(|l| (MIN_BEACON_LENGTH..=MAX_BEACON_LENGTH).contains(l))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "beacon {name} length {length} outside \
                     {MIN_BEACON_LENGTH}..={MAX_BEACON_LENGTH}"
                ))
            })?;
        let loc = match loc {
            Some(loc) if loc.is_empty() => {
                return Err(Error::Configuration(format!("beacon {name} has an empty loc")));
            }
            Some(loc) => loc,
            None => format!("{DEFAULT_BEACON_PREFIX}{name}"),
        };
        Ok(Self { name, length, loc })
    }

    /// Source attribute name (also the beacon's name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in bits.
    #[must_use]
    pub const fn length(&self) -> u8 {
        self.length
    }

    /// Target field name.
    #[must_use]
    pub fn loc(&self) -> &str {
        &self.loc
    }

    /// Number of hex digits in the stored beacon.
    #[must_use]
    pub const fn hex_width(&self) -> usize {
        (self.length as usize + 3) / 4
    }
}

#[derive(Serialize, Deserialize)]
struct RawStandardBeacon {
    name: String,
    length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loc: Option<String>,
}

impl TryFrom<RawStandardBeacon> for StandardBeacon {
    type Error = Error;

    fn try_from(raw: RawStandardBeacon) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.length, raw.loc)
    }
}

impl From<StandardBeacon> for RawStandardBeacon {
    fn from(beacon: StandardBeacon) -> Self {
        Self {
            name: beacon.name,
            length: u32::from(beacon.length),
            loc: Some(beacon.loc),
        }
    }
}

/// External store of per-beacon keys.
pub trait BeaconKeyStore: Send + Sync {
    /// Returns the key for `beacon_name`, or `None` if the store has none.
    ///
    /// # Errors
    ///
    /// Returns a provider error if the store itself fails.
    fn get_key(&self, beacon_name: &str) -> Result<Option<SecretVec<u8>>, MaterialProviderError>;
}

/// Where beacon keys come from. Exactly one source per table.
#[derive(Clone)]
pub enum BeaconKeySource {
    /// One key shared by every beacon; per-beacon keys are derived from it.
    Single(Arc<SecretVec<u8>>),
    /// Per-beacon keys looked up by beacon name.
    Multi(Arc<dyn BeaconKeyStore>),
}

impl BeaconKeySource {
    /// Creates a single-key source.
    #[must_use]
    pub fn single(key: SecretVec<u8>) -> Self {
        Self::Single(Arc::new(key))
    }

    /// Creates a multi-key source backed by `store`.
    pub fn multi(store: impl BeaconKeyStore + 'static) -> Self {
        Self::Multi(Arc::new(store))
    }
}

impl fmt::Debug for BeaconKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(_) => f.write_str("BeaconKeySource::Single(..)"),
            Self::Multi(_) => f.write_str("BeaconKeySource::Multi(..)"),
        }
    }
}

/// Computes beacons for a table.
///
/// Per-beacon keys are derived once and cached; the cache is shared by all
/// clones and safe to use from many threads.
#[derive(Clone)]
pub struct BeaconGenerator {
    beacons: Arc<[StandardBeacon]>,
    source: BeaconKeySource,
    cache: Arc<RwLock<HashMap<String, Arc<Zeroizing<[u8; 32]>>>>>,
}

impl BeaconGenerator {
    /// Creates a generator for `beacons`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if two beacons share a name or a
    /// target field, or a target field uses the reserved prefix without
    /// being the default one.
    pub fn new(beacons: Vec<StandardBeacon>, source: BeaconKeySource) -> Result<Self, Error> {
        let mut names = HashSet::new();
        let mut locs = HashSet::new();
        for beacon in &beacons {
            if !names.insert(beacon.name()) {
                return Err(Error::Configuration(format!("duplicate beacon {}", beacon.name())));
            }
            if !locs.insert(beacon.loc()) {
                return Err(Error::Configuration(format!(
                    "beacon target field {} is used twice",
                    beacon.loc()
                )));
            }
            if beacon.loc().starts_with(RESERVED_PREFIX)
                && !beacon.loc().starts_with(DEFAULT_BEACON_PREFIX)
            {
                return Err(Error::Configuration(format!(
                    "beacon target field {} uses the reserved prefix",
                    beacon.loc()
                )));
            }
        }
        Ok(Self {
            beacons: beacons.into(),
            source,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Configured beacons.
    #[must_use]
    pub fn beacons(&self) -> &[StandardBeacon] {
        &self.beacons
    }

    /// Looks up a beacon by name.
    #[must_use]
    pub fn beacon(&self, name: &str) -> Option<&StandardBeacon> {
        self.beacons.iter().find(|b| b.name() == name)
    }

    /// Computes the beacon string for `value`.
    ///
    /// Public so a query layer can turn a search term into the stored form.
    ///
    /// # Errors
    ///
    /// - `Error::KeyUnavailable` if a multi-key store has no key for the
    ///   beacon
    /// - `Error::UnsupportedValue` if `value` is an invalid number
    pub fn beacon_value(
        &self,
        beacon: &StandardBeacon,
        value: &AttributeValue,
    ) -> Result<String, Error> {
        let key = self.beacon_key(beacon.name())?;
        let plaintext = value.canonical_string()?;

        let mut mac = HmacSha256::new_from_slice(&key[..])
            .map_err(|e| Error::Crypto(format!("invalid beacon key: {e}")))?;
        mac.update(plaintext.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let truncated = u64::from_be_bytes(head) & ((1u64 << beacon.length()) - 1);

        Ok(format!("{truncated:0width$x}", width = beacon.hex_width()))
    }

    fn beacon_key(&self, name: &str) -> Result<Arc<Zeroizing<[u8; 32]>>, Error> {
        if let Some(key) = self.cache.read().get(name) {
            return Ok(Arc::clone(key));
        }

        let info = format!("itemseal-beacon:{name}");
        let key = match &self.source {
            BeaconKeySource::Single(shared) => {
                derive_subkey(shared.expose_secret(), info.as_bytes())?
            }
            BeaconKeySource::Multi(store) => {
                let stored = store
                    .get_key(name)
                    .map_err(|e| {
                        if e.is_key_unavailable() {
                            Error::KeyUnavailable(e.to_string())
                        } else {
                            Error::MaterialProvider(e)
                        }
                    })?
                    .ok_or_else(|| {
                        Error::KeyUnavailable(format!("no beacon key for {name} in key store"))
                    })?;
                derive_subkey(stored.expose_secret(), info.as_bytes())?
            }
        };

        let key = Arc::new(key);
        self.cache.write().insert(name.to_string(), Arc::clone(&key));
        tracing::debug!(beacon = name, "cached beacon key");
        Ok(key)
    }
}

impl fmt::Debug for BeaconGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconGenerator")
            .field("beacons", &self.beacons)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
