//! # `itemseal`
//!
//! Client-side, attribute-level encryption of structured records before they
//! are written to an untrusted wide-column store.
//!
//! ## Features
//!
//! - Per-attribute actions: pass through, sign only, or encrypt and sign
//! - AEAD encryption (ChaCha20-Poly1305, AES-256-GCM) under per-record keys
//! - Whole-record authentication tag bound to a sealed header
//! - Encryption context binding the table and key attributes
//! - Envelope encryption through a pluggable material provider
//! - Truncated-HMAC beacons for equality search over encrypted attributes
//!
//! ## Example
//!
//! ```rust,ignore
//! use itemseal::prelude::*;
//!
//! let mut config = TableConfig::new("orders", "pk");
//! config.attribute_actions.insert("card".into(), AttributeAction::EncryptAndSign);
//!
//! let encryptor = RecordEncryptor::new(config, keyring, None)?;
//! let encrypted = encryptor.encrypt(&record)?;
//! let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod beacon;
pub mod context;
pub mod encryptor;
pub mod error;
pub mod header;
pub mod kdf;
pub mod material;
pub mod signature;
pub mod suite;
pub mod value;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::action::{AttributeAction, TableConfig};
    pub use crate::beacon::{BeaconKeySource, BeaconKeyStore, StandardBeacon};
    pub use crate::context::EncryptionContext;
    pub use crate::encryptor::{DecryptedRecord, EncryptedRecord, RecordEncryptor};
    pub use crate::error::{Error, MaterialProviderError};
    pub use crate::header::ParsedHeader;
    pub use crate::material::{
        DecryptionMaterials, EncryptedDataKey, EncryptionMaterials, MaterialProvider,
    };
    pub use crate::suite::AlgorithmSuiteId;
    pub use crate::value::{AttributeValue, Record};
}
