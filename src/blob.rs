//! On-disk sealed representation.
//!
//! A sealed file is YAML with two top-level mappings: the five `headers`
//! scalars and `encryptedData` holding four byte-array fields. Byte arrays
//! serialize as sequences of Base64 chunks of 32 input bytes (the last
//! chunk may be shorter); `deviceTokens` passes through the sized-byte-array
//! framing first to keep the token order.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use yaml_rust2::parser::Event;

use crate::config::{self, Cursor};
use crate::error::{Error, Result};
use crate::headers::ConfigHeaders;
use crate::wire;

pub(crate) const FIELD_SEED: &str = "seed";
pub(crate) const FIELD_ENCRYPTED_KEY: &str = "encryptedKey";
pub(crate) const FIELD_CIPHER_DATA: &str = "cipherData";
pub(crate) const FIELD_DEVICE_TOKENS: &str = "deviceTokens";

/// Input bytes per Base64 chunk.
pub const CHUNK_BYTES: usize = 32;

/// The persisted form of a sealed configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// 64-byte seed of the persistent DEK.
    pub seed: Vec<u8>,
    /// Device-wrapped persistent DEK.
    pub encrypted_key: Vec<u8>,
    /// AES-GCM ciphertext of the serialized secret list, MAC included.
    pub cipher_data: Vec<u8>,
    /// Ordered storage-KEK blobs: private, then public.
    pub device_tokens: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse the `encryptedData` mapping; the cursor stands just past its key.
pub(crate) fn parse_encrypted_data(cur: &mut Cursor) -> Result<EncryptedBlob> {
    config::expect_mapping_start(cur)?;

    let mut seed = None;
    let mut encrypted_key = None;
    let mut cipher_data = None;
    let mut raw_tokens = None;
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let (event, marker) = cur.next()?;
        match event {
            Event::MappingEnd => break,
            Event::Alias(..) => return Err(config::alias_not_permitted(marker)),
            Event::Scalar(key, ..) => {
                if !seen.insert(key.clone()) {
                    return Err(config::duplicate_key(marker));
                }
                match key.as_str() {
                    FIELD_SEED => seed = Some(parse_chunked_bytes(cur)?),
                    FIELD_ENCRYPTED_KEY => encrypted_key = Some(parse_chunked_bytes(cur)?),
                    FIELD_CIPHER_DATA => cipher_data = Some(parse_chunked_bytes(cur)?),
                    FIELD_DEVICE_TOKENS => raw_tokens = Some(parse_chunked_bytes(cur)?),
                    _ => return Err(config::unexpected_entry(marker)),
                }
            }
            _ => return Err(config::unexpected_entry(marker)),
        }
    }

    let seed = seed.ok_or_else(|| Error::FieldNotDefined(FIELD_SEED.into()))?;
    let encrypted_key =
        encrypted_key.ok_or_else(|| Error::FieldNotDefined(FIELD_ENCRYPTED_KEY.into()))?;
    let cipher_data =
        cipher_data.ok_or_else(|| Error::FieldNotDefined(FIELD_CIPHER_DATA.into()))?;
    let raw_tokens =
        raw_tokens.ok_or_else(|| Error::FieldNotDefined(FIELD_DEVICE_TOKENS.into()))?;

    let device_tokens = wire::decode(&raw_tokens)?;
    Ok(EncryptedBlob { seed, encrypted_key, cipher_data, device_tokens })
}

fn parse_chunked_bytes(cur: &mut Cursor) -> Result<Vec<u8>> {
    let (event, marker) = cur.next()?;
    match event {
        Event::SequenceStart(..) => {}
        Event::Alias(..) => return Err(config::alias_not_permitted(marker)),
        _ => return Err(config::unexpected_entry(marker)),
    }

    let mut out = Vec::new();
    loop {
        let (event, marker) = cur.next()?;
        match event {
            Event::SequenceEnd => break,
            Event::Scalar(chunk, ..) => {
                let decoded = BASE64.decode(chunk.as_bytes()).map_err(|_| {
                    Error::Yaml(format!("Invalid Base64 data at line {}", marker.line()))
                })?;
                out.extend_from_slice(&decoded);
            }
            Event::Alias(..) => return Err(config::alias_not_permitted(marker)),
            _ => return Err(config::unexpected_entry(marker)),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the sealed document. The output is deterministic for a given
/// headers/blob pair.
pub(crate) fn render_sealed(headers: &ConfigHeaders, blob: &EncryptedBlob) -> Result<String> {
    let mut out = String::new();
    out.push_str("headers:\n");
    let _ = writeln!(out, "  {}: {}", config::FIELD_PRIMARY_KEY_TYPE, headers.primary_key_type.name());
    let _ = writeln!(out, "  {}: {}", config::FIELD_STORAGE_KEY_TYPE, headers.storage_key_type.name());
    let _ = writeln!(out, "  {}: {}", config::FIELD_EPHEMERAL_KEY_TYPE, headers.ephemeral_key_type.name());
    let _ = writeln!(out, "  {}: {}", config::FIELD_PCR_SELECTION, headers.pcr_selection);
    let _ = writeln!(out, "  {}: {}", config::FIELD_PCR_HASH, headers.pcr_hash.name());

    out.push_str("encryptedData:\n");
    push_chunked(&mut out, FIELD_SEED, &blob.seed);
    push_chunked(&mut out, FIELD_ENCRYPTED_KEY, &blob.encrypted_key);
    push_chunked(&mut out, FIELD_CIPHER_DATA, &blob.cipher_data);

    let token_refs: Vec<&[u8]> = blob.device_tokens.iter().map(|t| t.as_slice()).collect();
    let framed_tokens = wire::encode(&token_refs)?;
    push_chunked(&mut out, FIELD_DEVICE_TOKENS, &framed_tokens);
    Ok(out)
}

fn push_chunked(out: &mut String, name: &str, bytes: &[u8]) {
    if bytes.is_empty() {
        let _ = writeln!(out, "  {}: []", name);
        return;
    }
    let _ = writeln!(out, "  {}:", name);
    for chunk in bytes.chunks(CHUNK_BYTES) {
        let _ = writeln!(out, "  - {}", BASE64.encode(chunk));
    }
}

/// Overwrite `path` with the sealed document (truncate-write).
pub(crate) fn write_sealed(path: &Path, headers: &ConfigHeaders, blob: &EncryptedBlob) -> Result<()> {
    let text = render_sealed(headers, blob)?;
    fs::write(path, text).map_err(|e| Error::Io(format!("write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, ParsedConfig};

    fn sample_blob() -> EncryptedBlob {
        EncryptedBlob {
            seed: (0..64).collect(),
            encrypted_key: vec![0xAA; 100],
            cipher_data: vec![0xBB; 33],
            device_tokens: vec![vec![1, 2, 3], vec![4, 5]],
        }
    }

    #[test]
    fn render_then_parse_round_trips() {
        let headers = ConfigHeaders::default();
        let blob = sample_blob();
        let text = render_sealed(&headers, &blob).unwrap();
        assert!(!text.contains("data:") || text.contains("encryptedData:"));

        match parse_config(&text).unwrap() {
            ParsedConfig::Sealed { headers: parsed_headers, blob: parsed } => {
                assert_eq!(parsed_headers, headers);
                assert_eq!(parsed, blob);
            }
            ParsedConfig::Plaintext { .. } => panic!("expected sealed"),
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let headers = ConfigHeaders::default();
        let blob = sample_blob();
        assert_eq!(
            render_sealed(&headers, &blob).unwrap(),
            render_sealed(&headers, &blob).unwrap()
        );
    }

    #[test]
    fn chunks_are_32_input_bytes() {
        let headers = ConfigHeaders::default();
        let blob = sample_blob();
        let text = render_sealed(&headers, &blob).unwrap();
        // 100 bytes of encryptedKey: three full chunks and one 4-byte tail.
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.iter().position(|l| l.trim() == "encryptedKey:").unwrap();
        let chunks: Vec<&str> = lines[start + 1..]
            .iter()
            .take_while(|l| l.starts_with("  - "))
            .copied()
            .collect();
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let headers = ConfigHeaders::default();
        let blob = sample_blob();
        let text = render_sealed(&headers, &blob).unwrap();
        let without_seed: String = text
            .lines()
            .scan(false, |skipping, line| {
                if line.trim() == "seed:" {
                    *skipping = true;
                    return Some(None);
                }
                if *skipping && line.starts_with("  - ") {
                    return Some(None);
                }
                *skipping = false;
                Some(Some(format!("{}\n", line)))
            })
            .flatten()
            .collect();

        let err = parse_config(&without_seed).unwrap_err();
        assert_eq!(err.to_string(), "Field seed is not defined");
    }

    #[test]
    fn tampered_token_framing_is_rejected() {
        let headers = ConfigHeaders::default();
        let mut blob = sample_blob();
        blob.device_tokens = vec![vec![0u8; 10]];
        let mut text = render_sealed(&headers, &blob).unwrap();
        // Corrupt the framed token length by rewriting its first chunk.
        let bad = BASE64.encode([0x00u8, 0xFF, 1, 2, 3]);
        let start = text.find("deviceTokens:\n").unwrap();
        let line_start = text[start..].find("  - ").unwrap() + start;
        let line_end = text[line_start..].find('\n').unwrap() + line_start;
        text.replace_range(line_start..line_end, &format!("  - {}", bad));

        assert!(matches!(parse_config(&text), Err(Error::SegmentTooLarge { .. })));
    }
}
