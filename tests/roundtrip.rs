//! End-to-end sealing, reopening, and session behavior over the software
//! transport.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use letsconfide::{
    parse, wire, ConfigHeaders, DeviceFactory, Error, SoftTpm, TpmDeviceFactory,
};
use tempfile::TempDir;

fn soft_factory() -> Arc<TpmDeviceFactory> {
    Arc::new(TpmDeviceFactory::new(Box::new(SoftTpm::new())))
}

fn write_config(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("confide.yml");
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn seal_single_secret_with_default_headers() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: \"ub,KbVsh/XUj~=~F#\" }\n");

    let manager = parse(&path, soft_factory()).unwrap();
    assert_eq!(manager.headers(), ConfigHeaders::default());

    let session = manager.start_data_access_session().unwrap();
    let secret = session.decrypt("pwd1").unwrap();
    assert_eq!(secret.as_str(), "ub,KbVsh/XUj~=~F#");
    assert_eq!(secret.chars().count(), 17);

    // The rewritten file holds only ciphertext.
    let on_disk = fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains("data:"));
    assert!(on_disk.contains("encryptedData:"));
    assert!(!on_disk.contains("ub,KbVsh"));
}

#[test]
fn unknown_secret_fails_uniformly() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: secret }\n");

    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    let err = session.decrypt("foobar").unwrap_err();
    assert_eq!(err.to_string(), "Key not found");
    assert!(!err.to_string().contains("foobar"));
}

#[test]
fn reopen_sealed_file_in_a_fresh_process() {
    let dir = TempDir::new().unwrap();
    let text = "data:\n  db-password: \"p@ss\"\n  api-key: \"0123456789abcdef0123456789abcdef\"\n  empty: \"\"\n  \"\": \"empty name\"\n";
    let path = write_config(&dir, text);

    let first = parse(&path, soft_factory()).unwrap();
    drop(first);

    // A fresh factory over a fresh transport models a process restart on
    // the same machine.
    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    assert_eq!(session.decrypt("db-password").unwrap().as_str(), "p@ss");
    assert_eq!(
        session.decrypt("api-key").unwrap().as_str(),
        "0123456789abcdef0123456789abcdef"
    );
    assert_eq!(session.decrypt("empty").unwrap().as_str(), "");
    assert_eq!(session.decrypt("").unwrap().as_str(), "empty name");
}

#[test]
fn block_aligned_values_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut text = String::from("data:\n");
    for len in [32usize, 64, 96, 128] {
        text.push_str(&format!("  v{}: \"{}\"\n", len, "x".repeat(len)));
    }
    let path = write_config(&dir, &text);

    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    for len in [32usize, 64, 96, 128] {
        assert_eq!(session.decrypt(&format!("v{}", len)).unwrap().as_str(), "x".repeat(len));
    }
}

#[test]
fn unicode_values_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data:\n  greeting: \"grüß gott ✓\"\n");

    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    assert_eq!(session.decrypt("greeting").unwrap().as_str(), "grüß gott ✓");
}

#[test]
fn resealing_a_sealed_file_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: secret }\n");

    let first = parse(&path, soft_factory()).unwrap();
    let sealed_once = fs::read_to_string(&path).unwrap();

    let second = parse(&path, soft_factory()).unwrap();
    let sealed_twice = fs::read_to_string(&path).unwrap();

    assert_eq!(sealed_once, sealed_twice);
    assert_eq!(first.encrypted_data(), second.encrypted_data());
}

#[test]
fn corrupting_cipher_data_breaks_decryption() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: secret }\n");
    parse(&path, soft_factory()).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let start = text.find("cipherData:\n").unwrap();
    let chunk_start = text[start..].find("  - ").unwrap() + start + 4;
    let mut corrupted = text.clone();
    // Swap the first Base64 character of the first chunk for another one.
    let original = corrupted.as_bytes()[chunk_start];
    let replacement = if original == b'A' { b'B' } else { b'A' };
    corrupted.replace_range(chunk_start..chunk_start + 1, &(replacement as char).to_string());
    fs::write(&path, corrupted).unwrap();

    let err = parse(&path, soft_factory()).unwrap_err();
    assert!(matches!(err, Error::Crypto | Error::Device(_)));
}

#[test]
fn sealed_file_does_not_open_on_a_different_chip() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: secret }\n");
    parse(&path, soft_factory()).unwrap();

    let tpm = SoftTpm::with_owner_seed([9u8; 32]);
    let stats = tpm.stats();
    let foreign = Arc::new(TpmDeviceFactory::new(Box::new(tpm)));
    assert!(parse(&path, foreign).is_err());

    // Even the failed open releases every handle it acquired.
    assert_eq!(stats.outstanding_objects(), 0);
    assert_eq!(stats.outstanding_sessions(), 0);
}

#[test]
fn sealed_file_does_not_open_under_different_pcr_state() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data: { pwd1: secret }\n");
    parse(&path, soft_factory()).unwrap();

    let tpm = SoftTpm::with_pcr_digest([7u8; 32]);
    let stats = tpm.stats();
    let drifted = Arc::new(TpmDeviceFactory::new(Box::new(tpm)));
    assert!(parse(&path, drifted).is_err());

    assert_eq!(stats.outstanding_objects(), 0);
    assert_eq!(stats.outstanding_sessions(), 0);
}

#[test]
fn sessions_and_handles_never_leak() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "data:\n  a: one\n  b: two\n");

    let tpm = SoftTpm::new();
    let stats = tpm.stats();
    let factory = Arc::new(TpmDeviceFactory::new(Box::new(tpm)));

    let manager = parse(&path, factory).unwrap();
    {
        let session = manager.start_data_access_session().unwrap();
        session.decrypt("a").unwrap();
        session.decrypt("b").unwrap();
    }
    drop(manager);

    assert!(stats.sessions_started.load(Ordering::SeqCst) > 0);
    assert!(stats.objects_loaded.load(Ordering::SeqCst) > 0);
    assert_eq!(stats.outstanding_sessions(), 0);
    assert_eq!(stats.outstanding_objects(), 0);
}

// ---------------------------------------------------------------------------
// Device-level wrap protocol
// ---------------------------------------------------------------------------

#[test]
fn cfb_wrap_output_is_framed_iv_and_body() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();
    let dek = [0x42u8; 32];

    for wrapped in [
        opened.device.wrap_persistent(&dek).unwrap(),
        opened.device.wrap_ephemeral(&dek).unwrap(),
    ] {
        let parts = wire::decode(&wrapped).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 16);
        assert!(parts[0].iter().any(|&b| b != 0));
        assert_eq!(parts[1].len(), 64);
    }

    assert_eq!(opened.device.unwrap_persistent(&opened.device.wrap_persistent(&dek).unwrap()).unwrap().as_slice(), &dek);
    assert_eq!(opened.device.unwrap_ephemeral(&opened.device.wrap_ephemeral(&dek).unwrap()).unwrap().as_slice(), &dek);
}

#[test]
fn ephemeral_wraps_reuse_the_token_iv() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();
    let dek = [0x42u8; 32];

    let first = wire::decode(&opened.device.wrap_ephemeral(&dek).unwrap()).unwrap();
    let second = wire::decode(&opened.device.wrap_ephemeral(&dek).unwrap()).unwrap();
    assert_eq!(first[0], second[0]);
    // The padding is fresh per wrap, so the bodies differ.
    assert_ne!(first[1], second[1]);
}

#[test]
fn storage_wraps_draw_a_fresh_iv() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();
    let dek = [0x42u8; 32];

    let first = wire::decode(&opened.device.wrap_persistent(&dek).unwrap()).unwrap();
    let second = wire::decode(&opened.device.wrap_persistent(&dek).unwrap()).unwrap();
    assert_ne!(first[0], second[0]);
}

#[test]
fn wrong_size_dek_is_rejected() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();
    assert!(matches!(
        opened.device.wrap_persistent(&[0u8; 31]),
        Err(Error::InvalidKeyLength { expected: 32, actual: 31 })
    ));
    assert!(matches!(
        opened.device.wrap_ephemeral(&[0u8; 33]),
        Err(Error::InvalidKeyLength { expected: 32, actual: 33 })
    ));
}

#[test]
fn malformed_framed_bytes_fail_unwrap_with_cause() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();

    // A 32-byte buffer whose first two bytes claim a 33-byte segment.
    let mut buf = vec![0u8; 32];
    buf[0] = 0;
    buf[1] = 33;

    let err = opened.device.unwrap_persistent(&buf).unwrap_err();
    assert_eq!(err.to_string(), "Encrypted key format is invalid");
    let cause = std::error::Error::source(&err).expect("decoder cause");
    assert_eq!(
        cause.to_string(),
        "Invalid sized byte array, byte segment size 33 at index 2 is too large"
    );
}

#[test]
fn wrong_part_count_fails_unwrap_without_cause() {
    let factory = TpmDeviceFactory::new(Box::new(SoftTpm::new()));
    let opened = factory.open(&ConfigHeaders::default(), None).unwrap();

    let framed = wire::encode(&[&[1u8; 16][..]]).unwrap();
    let err = opened.device.unwrap_persistent(&framed).unwrap_err();
    assert_eq!(err.to_string(), "Encrypted key format is invalid");
    assert!(std::error::Error::source(&err).is_none());
}

// ---------------------------------------------------------------------------
// RSA key types
// ---------------------------------------------------------------------------

#[test]
fn rsa_storage_and_ephemeral_keys_round_trip() {
    let dir = TempDir::new().unwrap();
    let text = "headers:\n  primaryKeyType: RSA1024\n  storageKeyType: RSA1024\n  ephemeralKeyType: RSA1024\ndata:\n  pwd1: \"rsa secret\"\n";
    let path = write_config(&dir, text);

    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    assert_eq!(session.decrypt("pwd1").unwrap().as_str(), "rsa secret");

    // Reopen under a fresh transport.
    let manager = parse(&path, soft_factory()).unwrap();
    let session = manager.start_data_access_session().unwrap();
    assert_eq!(session.decrypt("pwd1").unwrap().as_str(), "rsa secret");
}
