//! Unified error type for letsconfide.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure surfaced by this crate.
///
/// Cryptographic failures are deliberately opaque: their messages never echo
/// key bytes, plaintext, or the name that was queried.
#[derive(Debug)]
pub enum Error {
    /// Malformed YAML, duplicate keys, unknown headers. Carries the detail
    /// (with a 1-based line number when available).
    Yaml(String),
    /// The configuration stream exceeded the 256 KiB bound.
    ConfigTooLarge,
    /// A required field of the sealed representation is missing.
    FieldNotDefined(String),
    /// A sized-byte-array segment overruns its buffer during decode.
    SegmentTooLarge { size: usize, index: usize },
    /// A sized-byte-array length prefix is cut short during decode.
    TruncatedSegment { index: usize },
    /// A segment handed to the encoder does not fit a u16 length prefix.
    SegmentOverflow { len: usize },
    /// A wrapped key failed to decode into its framed parts.
    InvalidKeyFormat { cause: Option<Box<Error>> },
    /// Opaque cryptographic failure (tag mismatch, wrong unwrap length).
    Crypto,
    /// PKCS#7 verification failed.
    InvalidPadding,
    /// Decrypted data is not valid UTF-8.
    Utf8,
    /// The requested secret does not exist.
    KeyNotFound,
    /// The decrypted secret list does not hold name/value pairs.
    UnevenSecretList,
    /// TPM transport or command failure, with a context string.
    Device(String),
    /// File system failure while reading or writing the configuration.
    Io(String),
    /// PCR selection outside the 24-bit range.
    InvalidPcrSelection(u32),
    /// Key material of the wrong length reached a wrap or unwrap call.
    InvalidKeyLength { expected: usize, actual: usize },
    /// A seed of the wrong length reached a DEK derivation.
    InvalidSeedLength(usize),
    /// A device token list of the wrong arity.
    InvalidTokenCount { expected: usize, actual: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yaml(detail) => write!(f, "Error parsing YAML file: {}", detail),
            Self::ConfigTooLarge => write!(f, "The config is too large."),
            Self::FieldNotDefined(name) => write!(f, "Field {} is not defined", name),
            Self::SegmentTooLarge { size, index } => write!(
                f,
                "Invalid sized byte array, byte segment size {} at index {} is too large",
                size, index
            ),
            Self::TruncatedSegment { index } => write!(
                f,
                "Invalid sized byte array, truncated length prefix at index {}",
                index
            ),
            Self::SegmentOverflow { len } => {
                write!(f, "Byte segment of {} bytes exceeds the 65535 byte limit", len)
            }
            Self::InvalidKeyFormat { .. } => write!(f, "Encrypted key format is invalid"),
            Self::Crypto => write!(f, "Cryptographic operation failed"),
            Self::InvalidPadding => write!(f, "Invalid padding"),
            Self::Utf8 => write!(f, "Decrypted data is not valid UTF-8"),
            Self::KeyNotFound => write!(f, "Key not found"),
            Self::UnevenSecretList => {
                write!(f, "Decrypted secret list has an odd number of entries")
            }
            Self::Device(context) => write!(f, "TPM device error: {}", context),
            Self::Io(detail) => write!(f, "I/O error: {}", detail),
            Self::InvalidPcrSelection(value) => {
                write!(f, "PCR selection {:#x} is outside the 24-bit range", value)
            }
            Self::InvalidKeyLength { expected, actual } => {
                write!(f, "Key material must be {} bytes, got {}", expected, actual)
            }
            Self::InvalidSeedLength(actual) => {
                write!(f, "Seed must be 64 bytes, got {}", actual)
            }
            Self::InvalidTokenCount { expected, actual } => {
                write!(f, "Expected {} device tokens, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidKeyFormat { cause: Some(cause) } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
