//! Basic usage example for `itemseal`.

use itemseal::prelude::*;
use itemseal_key_file::{FileBeaconKeyStore, FileKeyring};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("itemseal Basic Usage Example");
    println!("============================\n");

    // Setup: a directory holding the wrapping key and beacon keys
    let key_dir = PathBuf::from("./example_keys");

    // Initialize the key directory if it doesn't exist
    if !key_dir.exists() {
        println!("Initializing key directory at {}...", key_dir.display());
        FileKeyring::generate(&key_dir, "kek_v1")?;
        FileBeaconKeyStore::new(&key_dir)?.generate("email")?;
        println!("✓ Key directory initialized\n");
    }

    // Describe the table
    let mut config = TableConfig::new("users", "user_id");
    config.attribute_actions.insert("email".into(), AttributeAction::EncryptAndSign);
    config.attribute_actions.insert("ssn".into(), AttributeAction::EncryptAndSign);
    config.attribute_actions.insert("plan".into(), AttributeAction::SignOnly);
    config.allowed_unauthenticated_attribute_prefix = Some("tmp_".into());
    config.beacons.push(StandardBeacon::new("email", 16, None)?);

    let keyring = FileKeyring::open(&key_dir, "kek_v1")?;
    println!(
        "✓ Loaded wrapping keys: {:?}",
        keyring.key_names().collect::<Vec<_>>()
    );

    let encryptor = RecordEncryptor::new(
        config,
        keyring,
        Some(BeaconKeySource::multi(FileBeaconKeyStore::new(&key_dir)?)),
    )?;
    println!("✓ RecordEncryptor created ({encryptor:?})\n");

    // Example record
    let mut record = Record::new();
    record.insert("user_id".into(), AttributeValue::string("user#1001"));
    record.insert("email".into(), AttributeValue::string("alice@example.com"));
    record.insert("ssn".into(), AttributeValue::string("123-45-6789"));
    record.insert("plan".into(), AttributeValue::string("pro"));
    record.insert(
        "tmp_last_seen".into(),
        AttributeValue::number(1_700_000_000),
    );

    // Encrypt the record
    let encrypted = encryptor.encrypt(&record)?;
    println!("✓ Encrypted record:");
    for (name, value) in &encrypted.record {
        match value {
            AttributeValue::B(bytes) => println!("  - {name}: <{} bytes>", bytes.len()),
            other => println!("  - {name}: {other:?}"),
        }
    }
    println!("  header: {} bytes\n", encrypted.header.len());

    // Decrypt the record
    let decrypted = encryptor.decrypt(&encrypted.record, &encrypted.header)?;
    assert_eq!(decrypted.record, record);
    println!("✓ Round-trip verification successful");
    println!("  context: {}\n", decrypted.parsed_header.stored_context);

    // Search: turn a query term into the stored beacon
    let term = encryptor.beacon_value("email", &AttributeValue::string("alice@example.com"))?;
    assert_eq!(
        encrypted.record["seal_b_email"],
        AttributeValue::S(term.clone())
    );
    println!("✓ Beacon for alice@example.com: {term}\n");

    // Tampering is detected
    let mut tampered = encrypted.record.clone();
    tampered.insert("plan".into(), AttributeValue::string("enterprise"));
    match encryptor.decrypt(&tampered, &encrypted.header) {
        Err(err) => println!("✓ Tampered record rejected: {err}\n"),
        Ok(_) => return Err("tampered record was accepted".into()),
    }

    println!("============================");
    println!("All operations successful!");

    // Cleanup
    println!(
        "\nNote: Key directory at {} can be deleted manually",
        key_dir.display()
    );

    Ok(())
}
