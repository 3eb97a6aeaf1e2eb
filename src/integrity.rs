//! Integrity gate: the upstream package must hash to the pinned digest
//! before any patch touches it.

use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("package sha256 mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("pinned sha256 {value:?} is not 64 hex characters")]
    InvalidExpected { value: String },
}

/// A SHA-256 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Digest(Sha256::digest(bytes).into())
    }

    /// Parse a pinned hex digest, ignoring surrounding whitespace and case.
    pub fn parse(value: &str) -> Result<Self, IntegrityError> {
        let invalid = || IntegrityError::InvalidExpected {
            value: value.to_string(),
        };
        let mut raw = [0u8; 32];
        hex::decode_to_slice(value.trim(), &mut raw).map_err(|_| invalid())?;
        Ok(Digest(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Lowercase hex SHA-256 of `raw`.
pub fn digest(raw: &[u8]) -> String {
    Digest::of(raw).to_hex()
}

/// Check `raw` against the pinned digest.
pub fn verify(raw: &[u8], expected: &str) -> Result<Digest, IntegrityError> {
    let expected = Digest::parse(expected)?;
    let actual = Digest::of(raw);
    if actual != expected {
        return Err(IntegrityError::Mismatch {
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(actual)
}
