//! Configuration reading: the bounded stream and the event-level YAML walk.
//!
//! Parsing works on the marked event stream rather than a loaded document
//! tree so duplicate keys, unknown headers, and misplaced nodes can be
//! reported with their 1-based line numbers, and so aliases can be rejected
//! outright.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::Marker;
use zeroize::{Zeroize, Zeroizing};

use crate::blob::{self, EncryptedBlob};
use crate::error::{Error, Result};
use crate::headers::{ConfigHeaders, KeyType, PcrHash, PCR_SELECTION_MAX};

/// Upper bound of a configuration stream.
pub const MAX_CONFIG_BYTES: usize = 256 * 1024;

pub(crate) const FIELD_HEADERS: &str = "headers";
pub(crate) const FIELD_DATA: &str = "data";
pub(crate) const FIELD_ENCRYPTED_DATA: &str = "encryptedData";
pub(crate) const FIELD_PRIMARY_KEY_TYPE: &str = "primaryKeyType";
pub(crate) const FIELD_STORAGE_KEY_TYPE: &str = "storageKeyType";
pub(crate) const FIELD_EPHEMERAL_KEY_TYPE: &str = "ephemeralKeyType";
pub(crate) const FIELD_PCR_SELECTION: &str = "pcrSelection";
pub(crate) const FIELD_PCR_HASH: &str = "pcrHash";

/// Outcome of parsing a configuration file.
#[derive(Debug)]
pub(crate) enum ParsedConfig {
    /// Plaintext input that still needs sealing.
    Plaintext {
        headers: ConfigHeaders,
        entries: Vec<(String, Zeroizing<String>)>,
    },
    /// An already-sealed file.
    Sealed { headers: ConfigHeaders, blob: EncryptedBlob },
}

// ---------------------------------------------------------------------------
// Bounded reading
// ---------------------------------------------------------------------------

/// Read `path`, failing once the stream exceeds [`MAX_CONFIG_BYTES`].
pub(crate) fn read_bounded(path: &Path) -> Result<Zeroizing<String>> {
    let file =
        File::open(path).map_err(|e| Error::Io(format!("open {}: {}", path.display(), e)))?;
    let mut text = Zeroizing::new(String::new());
    file.take(MAX_CONFIG_BYTES as u64 + 1)
        .read_to_string(&mut text)
        .map_err(|e| Error::Io(format!("read {}: {}", path.display(), e)))?;
    if text.len() > MAX_CONFIG_BYTES {
        return Err(Error::ConfigTooLarge);
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// Event cursor
// ---------------------------------------------------------------------------

struct EventCollector {
    events: Vec<(Event, Marker)>,
}

impl MarkedEventReceiver for EventCollector {
    fn on_event(&mut self, event: Event, marker: Marker) {
        self.events.push((event, marker));
    }
}

/// Forward-only walk over the collected events. Scalar payloads are zeroed
/// when the cursor goes out of scope; plaintext secrets pass through here.
pub(crate) struct Cursor {
    events: Vec<(Event, Marker)>,
    pos: usize,
}

impl Cursor {
    fn collect(text: &str) -> Result<Self> {
        let mut parser = Parser::new(text.chars());
        let mut collector = EventCollector { events: Vec::new() };
        parser
            .load(&mut collector, false)
            .map_err(|e| Error::Yaml(e.to_string()))?;
        Ok(Self { events: collector.events, pos: 0 })
    }

    fn peek(&self) -> Option<&(Event, Marker)> {
        self.events.get(self.pos)
    }

    pub(crate) fn next(&mut self) -> Result<(Event, Marker)> {
        let entry = self
            .events
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::Yaml("Unexpected end of configuration".into()))?;
        self.pos += 1;
        Ok(entry)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        for (event, _) in self.events.iter_mut() {
            if let Event::Scalar(value, ..) = event {
                value.zeroize();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

pub(crate) fn duplicate_key(marker: Marker) -> Error {
    Error::Yaml(format!("Duplicate key at line {}", marker.line()))
}

pub(crate) fn unexpected_entry(marker: Marker) -> Error {
    Error::Yaml(format!("Unexpected entry at line {}", marker.line()))
}

fn invalid_header(marker: Marker) -> Error {
    Error::Yaml(format!("Invalid config header at line {}", marker.line()))
}

fn invalid_header_value(marker: Marker) -> Error {
    Error::Yaml(format!("Invalid config header value at line {}", marker.line()))
}

pub(crate) fn alias_not_permitted(marker: Marker) -> Error {
    Error::Yaml(format!("Alias at line {} is not permitted", marker.line()))
}

/// Consume the next event, requiring a scalar.
pub(crate) fn expect_scalar(cur: &mut Cursor) -> Result<(String, Marker)> {
    let (event, marker) = cur.next()?;
    match event {
        Event::Scalar(value, ..) => Ok((value, marker)),
        Event::Alias(..) => Err(alias_not_permitted(marker)),
        _ => Err(unexpected_entry(marker)),
    }
}

/// Consume the next event, requiring the start of a mapping.
pub(crate) fn expect_mapping_start(cur: &mut Cursor) -> Result<()> {
    let (event, marker) = cur.next()?;
    match event {
        Event::MappingStart(..) => Ok(()),
        Event::Alias(..) => Err(alias_not_permitted(marker)),
        _ => Err(unexpected_entry(marker)),
    }
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

/// Parse a configuration document (plaintext or sealed).
pub(crate) fn parse_config(text: &str) -> Result<ParsedConfig> {
    let mut cur = Cursor::collect(text)?;

    while matches!(cur.peek(), Some((Event::StreamStart | Event::DocumentStart, _))) {
        let _ = cur.next();
    }

    let (event, marker) = cur.next()?;
    match event {
        Event::MappingStart(..) => {}
        Event::StreamEnd => {
            return Err(Error::Yaml("A data or encryptedData mapping is required".into()))
        }
        _ => return Err(unexpected_entry(marker)),
    }

    let mut headers: Option<ConfigHeaders> = None;
    let mut plaintext: Option<Vec<(String, Zeroizing<String>)>> = None;
    let mut sealed: Option<EncryptedBlob> = None;
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let (event, marker) = cur.next()?;
        match event {
            Event::MappingEnd => break,
            Event::Alias(..) => return Err(alias_not_permitted(marker)),
            Event::Scalar(key, ..) => {
                if !seen.insert(key.clone()) {
                    return Err(duplicate_key(marker));
                }
                match key.as_str() {
                    FIELD_HEADERS => headers = Some(parse_headers(&mut cur)?),
                    FIELD_DATA => {
                        if sealed.is_some() {
                            return Err(unexpected_entry(marker));
                        }
                        plaintext = Some(parse_data(&mut cur)?);
                    }
                    FIELD_ENCRYPTED_DATA => {
                        if plaintext.is_some() {
                            return Err(unexpected_entry(marker));
                        }
                        sealed = Some(blob::parse_encrypted_data(&mut cur)?);
                    }
                    _ => return Err(unexpected_entry(marker)),
                }
            }
            _ => return Err(unexpected_entry(marker)),
        }
    }

    let headers = headers.unwrap_or_default();
    headers.validate()?;

    if let Some(blob) = sealed {
        return Ok(ParsedConfig::Sealed { headers, blob });
    }
    if let Some(entries) = plaintext {
        return Ok(ParsedConfig::Plaintext { headers, entries });
    }
    Err(Error::Yaml("A data or encryptedData mapping is required".into()))
}

fn parse_headers(cur: &mut Cursor) -> Result<ConfigHeaders> {
    expect_mapping_start(cur)?;
    let mut out = ConfigHeaders::default();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let (event, marker) = cur.next()?;
        match event {
            Event::MappingEnd => break,
            Event::Alias(..) => return Err(alias_not_permitted(marker)),
            Event::Scalar(key, ..) => {
                if !seen.insert(key.clone()) {
                    return Err(duplicate_key(marker));
                }
                let (value, value_marker) = expect_scalar(cur)?;
                match key.as_str() {
                    FIELD_PRIMARY_KEY_TYPE => {
                        out.primary_key_type = parse_key_type(&value, value_marker)?
                    }
                    FIELD_STORAGE_KEY_TYPE => {
                        out.storage_key_type = parse_key_type(&value, value_marker)?
                    }
                    FIELD_EPHEMERAL_KEY_TYPE => {
                        out.ephemeral_key_type = parse_key_type(&value, value_marker)?
                    }
                    FIELD_PCR_SELECTION => {
                        out.pcr_selection = parse_pcr_selection(&value, value_marker)?
                    }
                    FIELD_PCR_HASH => out.pcr_hash = parse_pcr_hash(&value, value_marker)?,
                    _ => return Err(invalid_header(marker)),
                }
            }
            _ => return Err(unexpected_entry(marker)),
        }
    }
    Ok(out)
}

fn parse_data(cur: &mut Cursor) -> Result<Vec<(String, Zeroizing<String>)>> {
    expect_mapping_start(cur)?;
    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let (event, marker) = cur.next()?;
        match event {
            Event::MappingEnd => break,
            Event::Alias(..) => return Err(alias_not_permitted(marker)),
            Event::Scalar(name, ..) => {
                if !seen.insert(name.clone()) {
                    return Err(duplicate_key(marker));
                }
                let (value, _) = expect_scalar(cur)?;
                entries.push((name, Zeroizing::new(value)));
            }
            _ => return Err(unexpected_entry(marker)),
        }
    }
    Ok(entries)
}

fn parse_key_type(value: &str, marker: Marker) -> Result<KeyType> {
    KeyType::from_name(value).ok_or_else(|| invalid_header_value(marker))
}

fn parse_pcr_hash(value: &str, marker: Marker) -> Result<PcrHash> {
    PcrHash::from_name(value).ok_or_else(|| invalid_header_value(marker))
}

fn parse_pcr_selection(value: &str, marker: Marker) -> Result<u32> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    let selection = parsed.map_err(|_| invalid_header_value(marker))?;
    if selection == 0 || selection > PCR_SELECTION_MAX {
        return Err(Error::InvalidPcrSelection(selection));
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plaintext(text: &str) -> (ConfigHeaders, Vec<(String, Zeroizing<String>)>) {
        match parse_config(text).unwrap() {
            ParsedConfig::Plaintext { headers, entries } => (headers, entries),
            ParsedConfig::Sealed { .. } => panic!("expected plaintext"),
        }
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (headers, entries) = plaintext("data: { pwd1: \"ub,KbVsh/XUj~=~F#\" }\n");
        assert_eq!(headers, ConfigHeaders::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "pwd1");
        assert_eq!(entries[0].1.as_str(), "ub,KbVsh/XUj~=~F#");
    }

    #[test]
    fn partial_headers_fall_back_to_defaults() {
        let text = "headers:\n  primaryKeyType: AES128\n  storageKeyType: RSA2048\n  ephemeralKeyType: AES256\n  pcrSelection: 3\ndata:\n  a: b\n";
        let (headers, _) = plaintext(text);
        assert_eq!(headers.primary_key_type, KeyType::Aes128);
        assert_eq!(headers.storage_key_type, KeyType::Rsa2048);
        assert_eq!(headers.pcr_selection, 3);
        assert_eq!(headers.pcr_hash, PcrHash::Sha256);
    }

    #[test]
    fn duplicate_header_reports_second_line() {
        let text = "headers:\n  storageKeyType: AES256\n  storageKeyType: AES128\ndata:\n  a: b\n";
        let err = parse_config(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error parsing YAML file: Duplicate key at line 3"
        );
    }

    #[test]
    fn unknown_header_is_rejected_with_its_line() {
        let text = "headers:\n  storageKeyType2: AES256\ndata:\n  a: b\n";
        let err = parse_config(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error parsing YAML file: Invalid config header at line 2"
        );
    }

    #[test]
    fn duplicate_data_key_is_rejected() {
        let text = "data:\n  a: x\n  b: y\n  a: z\n";
        let err = parse_config(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error parsing YAML file: Duplicate key at line 4"
        );
    }

    #[test]
    fn scalar_where_mapping_required() {
        let err = parse_config("data: just-a-string\n").unwrap_err();
        assert!(err.to_string().starts_with("Error parsing YAML file: Unexpected entry at line"));
    }

    #[test]
    fn scalar_document_is_unexpected() {
        let err = parse_config("just-a-string\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn missing_data_fails() {
        let err = parse_config("headers:\n  pcrHash: SHA1\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error parsing YAML file: A data or encryptedData mapping is required"
        );
    }

    #[test]
    fn aliases_are_rejected() {
        let text = "data:\n  a: &anchor secret\n  b: *anchor\n";
        let err = parse_config(text).unwrap_err();
        assert!(err.to_string().contains("Alias"));
    }

    #[test]
    fn pcr_selection_range_is_enforced_at_parse() {
        let text = "headers:\n  pcrSelection: 0\ndata:\n  a: b\n";
        assert!(matches!(parse_config(text), Err(Error::InvalidPcrSelection(0))));

        let text = "headers:\n  pcrSelection: 16777216\ndata:\n  a: b\n";
        assert!(matches!(parse_config(text), Err(Error::InvalidPcrSelection(_))));
    }

    #[test]
    fn hex_pcr_selection_is_accepted() {
        let text = "headers:\n  pcrSelection: 0x10000\ndata:\n  a: b\n";
        let (headers, _) = plaintext(text);
        assert_eq!(headers.pcr_selection, 0x10000);
    }

    #[test]
    fn empty_name_and_value_are_accepted() {
        let (_, entries) = plaintext("data:\n  \"\": \"\"\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "");
        assert_eq!(entries[0].1.as_str(), "");
    }

    #[test]
    fn invalid_key_type_value_is_rejected() {
        let text = "headers:\n  storageKeyType: AES512\ndata:\n  a: b\n";
        let err = parse_config(text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error parsing YAML file: Invalid config header value at line 2"
        );
    }
}
