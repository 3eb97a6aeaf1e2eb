//! Exact, occurrence-counted substring replacement.
//!
//! Every replacement carries the number of times its pattern must occur. A
//! different count means the upstream file drifted away from what the patch
//! was written against, and the replacement refuses to run.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Longest pattern excerpt shown in error messages.
const PREVIEW_LEN: usize = 80;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplaceError {
    #[error("pattern {pattern:?} occurs {actual} time(s), expected {expected}")]
    CountMismatch {
        pattern: String,
        expected: usize,
        actual: usize,
    },

    #[error("replacement pattern is empty")]
    EmptyPattern,
}

/// A single replacement with its occurrence contract.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplacementSpec {
    #[serde(deserialize_with = "text_bytes")]
    pub old: Vec<u8>,
    #[serde(deserialize_with = "text_bytes")]
    pub new: Vec<u8>,
    /// Exact number of occurrences of `old`.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Must be set for `count = 0`, which then asserts `old` is absent.
    #[serde(default)]
    pub optional: bool,
}

fn default_count() -> usize {
    1
}

pub(crate) fn text_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(String::into_bytes)
}

impl ReplacementSpec {
    pub fn new(old: impl Into<Vec<u8>>, new: impl Into<Vec<u8>>, count: usize) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
            count,
            optional: false,
        }
    }

    /// Assert that `old` does not occur at all.
    pub fn absent(old: impl Into<Vec<u8>>) -> Self {
        Self {
            old: old.into(),
            new: Vec::new(),
            count: 0,
            optional: true,
        }
    }

    /// Configuration problems, reported before any session runs.
    pub fn validate(&self) -> Result<(), String> {
        if self.old.is_empty() {
            return Err("replacement pattern is empty".to_string());
        }
        if self.count == 0 && !self.optional {
            return Err(format!(
                "replacement of {:?} has count 0 but is not marked optional",
                preview(&self.old)
            ));
        }
        Ok(())
    }

    pub fn apply(&self, buffer: &[u8]) -> Result<Vec<u8>, ReplaceError> {
        replace(buffer, &self.old, &self.new, self.count)
    }
}

/// Replace every occurrence of `old` with `new`, requiring exactly `expected`
/// non-overlapping occurrences scanned left to right.
///
/// The input is never modified; on success a new buffer is returned.
///
/// ```
/// use extension_patcher::replace::{replace, ReplaceError};
///
/// let out = replace(b"a-b-c", b"-", b"+", 2).unwrap();
/// assert_eq!(out, b"a+b+c");
///
/// let err = replace(b"a-b-c", b"-", b"+", 3).unwrap_err();
/// assert!(matches!(err, ReplaceError::CountMismatch { expected: 3, actual: 2, .. }));
/// ```
pub fn replace(
    buffer: &[u8],
    old: &[u8],
    new: &[u8],
    expected: usize,
) -> Result<Vec<u8>, ReplaceError> {
    if old.is_empty() {
        return Err(ReplaceError::EmptyPattern);
    }

    let positions = find_all(buffer, old);
    if positions.len() != expected {
        return Err(ReplaceError::CountMismatch {
            pattern: preview(old),
            expected,
            actual: positions.len(),
        });
    }

    Ok(splice_at(buffer, &positions, old.len(), new))
}

/// Number of non-overlapping occurrences of `pattern`. Zero for an empty pattern.
pub fn count_occurrences(buffer: &[u8], pattern: &[u8]) -> usize {
    if pattern.is_empty() {
        return 0;
    }
    find_all(buffer, pattern).len()
}

/// Start offsets of non-overlapping occurrences of a non-empty `pattern`.
pub(crate) fn find_all(buffer: &[u8], pattern: &[u8]) -> Vec<usize> {
    debug_assert!(!pattern.is_empty());

    let mut positions = Vec::new();
    let mut cursor = 0;
    while cursor + pattern.len() <= buffer.len() {
        match buffer[cursor..]
            .windows(pattern.len())
            .position(|window| window == pattern)
        {
            Some(offset) => {
                positions.push(cursor + offset);
                cursor += offset + pattern.len();
            }
            None => break,
        }
    }
    positions
}

/// Rebuild `buffer` with the `span`-byte region at each position swapped for
/// `new`. Positions must be ascending and non-overlapping.
pub(crate) fn splice_at(buffer: &[u8], positions: &[usize], span: usize, new: &[u8]) -> Vec<u8> {
    let grown = positions.len() * new.len();
    let shrunk = positions.len() * span;
    let mut out = Vec::with_capacity((buffer.len() + grown).saturating_sub(shrunk));

    let mut last = 0;
    for &start in positions {
        out.extend_from_slice(&buffer[last..start]);
        out.extend_from_slice(new);
        last = start + span;
    }
    out.extend_from_slice(&buffer[last..]);
    out
}

/// Lossy, truncated rendering of a pattern for diagnostics.
pub(crate) fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= PREVIEW_LEN {
        return text.into_owned();
    }
    let mut short: String = text.chars().take(PREVIEW_LEN).collect();
    short.push_str("...");
    short
}
