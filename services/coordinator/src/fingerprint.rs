use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the canonical string encoding (32 bytes, url-safe base64, no padding).
pub const ENCODED_LEN: usize = 43;

/// Errors from computing or parsing a fingerprint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("cannot fingerprint an empty byte buffer")]
    EmptyInput,

    #[error("invalid fingerprint encoding: {0}")]
    InvalidEncoding(String),
}

/// Content-derived identity of a photo: SHA-256 over the raw image bytes.
///
/// The fingerprint is the primary key everywhere in the coordinator — ledger
/// entries, metadata records, queue items, and object keys are all addressed
/// by it. Two byte-identical uploads always produce the same fingerprint no
/// matter which client or network path they arrive through.
///
/// The canonical string form is url-safe unpadded base64 (43 characters),
/// which is stable across callers and safe to use directly as an S3 object key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of raw image bytes.
    ///
    /// Pure and deterministic; the only failure mode is an empty input.
    pub fn digest(data: &[u8]) -> Result<Self, FingerprintError> {
        if data.is_empty() {
            return Err(FingerprintError::EmptyInput);
        }
        let mut hasher = Sha256::new();
        hasher.update(data);
        Ok(Self(hasher.finalize().into()))
    }

    /// Create a fingerprint from raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical string encoding (url-safe base64, no padding).
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Lowercase hex encoding, used for logging.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(FingerprintError::InvalidEncoding(format!(
                "expected {} characters, got {}",
                ENCODED_LEN,
                s.len()
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| FingerprintError::InvalidEncoding(e.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            FingerprintError::InvalidEncoding("decoded to wrong byte length".to_string())
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
