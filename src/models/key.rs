//! Primary keys and key ranges.
//!
//! Keys are opaque byte strings owned by the Batch Source. The engine never orders or
//! interprets them; it only stores the end of the last completed batch and hands it back as
//! the next cursor.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<u8>);

impl PrimaryKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Lossy UTF-8 rendering for logs and error messages.
    pub fn utf8(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for PrimaryKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.utf8())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.utf8())
    }
}

/// Half-open `[start, end)` range. A missing bound is open-ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<PrimaryKey>,
    pub end: Option<PrimaryKey>,
}

impl KeyRange {
    pub fn new(start: impl Into<PrimaryKey>, end: impl Into<PrimaryKey>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |key: &Option<PrimaryKey>| key.as_ref().map(PrimaryKey::utf8);
        write!(
            f,
            "[{}, {})",
            bound(&self.start).unwrap_or_else(|| "-inf".to_string()),
            bound(&self.end).unwrap_or_else(|| "+inf".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_display() {
        assert_eq!(KeyRange::new("0", "1000").to_string(), "[0, 1000)");
        assert_eq!(KeyRange::unbounded().to_string(), "[-inf, +inf)");
    }

    #[test]
    fn test_primary_key_round_trips_bytes() {
        let key = PrimaryKey::from("abc");
        assert_eq!(key.as_bytes(), b"abc");
        assert_eq!(format!("{key:?}"), "\"abc\"");
        assert_eq!(key.into_bytes(), b"abc".to_vec());
    }
}
