//! Revision identifiers
//!
//! A revision is `(generation, hash)` and travels as `"<generation>-<hash>"`.

use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters kept from a revision fingerprint.
const REV_HASH_LEN: usize = 32;

/// Unique identifier of one revision of a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevId {
    pub generation: u64,
    pub hash: String,
}

impl RevId {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    /// Fingerprint a new revision from its parent and content.
    ///
    /// Fails when the parent generation has no successor.
    pub fn fingerprint(parent: Option<&RevId>, deleted: bool, content: &[u8]) -> Result<Self, Error> {
        let generation = match parent {
            Some(p) => p.generation.checked_add(1).ok_or_else(|| {
                Error::MalformedDocument(format!("Revision generation overflows: {}", p))
            })?,
            None => 1,
        };
        let mut hasher = Sha256::new();
        if let Some(p) = parent {
            hasher.update(p.to_string().as_bytes());
        }
        hasher.update([0u8, deleted as u8]);
        hasher.update(content);
        let mut hash = hex::encode(hasher.finalize());
        hash.truncate(REV_HASH_LEN);
        Ok(Self { generation, hash })
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::MalformedDocument(format!("Invalid rev format: {:?}", s));
        let (prefix, hash) = s.split_once('-').ok_or_else(invalid)?;
        let generation: u64 = prefix.parse().map_err(|_| invalid())?;
        if hash.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(generation, hash))
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let rev: RevId = "3-abc".parse().unwrap();
        assert_eq!(rev.generation, 3);
        assert_eq!(rev.hash, "abc");
        assert_eq!(rev.to_string(), "3-abc");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("abc".parse::<RevId>().is_err());
        assert!("x-abc".parse::<RevId>().is_err());
        assert!("2-".parse::<RevId>().is_err());
    }

    #[test]
    fn test_fingerprint_generation() {
        let first = RevId::fingerprint(None, false, b"{}").unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(first.hash.len(), 32);
        let second = RevId::fingerprint(Some(&first), false, b"{}").unwrap();
        assert_eq!(second.generation, 2);
        assert_ne!(first.hash, second.hash);
        assert_eq!(second, RevId::fingerprint(Some(&first), false, b"{}").unwrap());
    }

    #[test]
    fn test_fingerprint_rejects_last_generation() {
        let parent = RevId::new(u64::MAX, "x");
        assert!(matches!(
            RevId::fingerprint(Some(&parent), false, b"{}"),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_ordering_by_generation_then_hash() {
        let a: RevId = "2-a".parse().unwrap();
        let b: RevId = "2-b".parse().unwrap();
        let c: RevId = "10-a".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
