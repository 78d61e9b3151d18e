//! Core types for the update graph.

use std::fmt;
use std::str::FromStr;

use infocalypse_keys::Chk;

use crate::error::UpdateError;

/// Index of a vertex in the update graph.
pub type IndexId = i64;

/// Length of a changeset id in bytes.
pub const CHANGESET_ID_LEN: usize = 20;

/// A 20-byte changeset id, written as 40 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChangesetId(pub [u8; CHANGESET_ID_LEN]);

/// The parent of a root changeset.
pub const NULL_REV: ChangesetId = ChangesetId([0u8; CHANGESET_ID_LEN]);

impl ChangesetId {
    pub fn from_bytes(bytes: [u8; CHANGESET_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHANGESET_ID_LEN] {
        &self.0
    }

    /// Parse 40 hex digits.
    pub fn from_hex(hex_str: &str) -> Result<Self, UpdateError> {
        let invalid = || UpdateError::InvalidChangeset {
            value: hex_str.to_string(),
        };
        let bytes = hex::decode(hex_str).map_err(|_| invalid())?;
        let bytes: [u8; CHANGESET_ID_LEN] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_REV
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangesetId({})", self.short())
    }
}

impl FromStr for ChangesetId {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// The `(from, to)` span of an edge.
///
/// The bundle for a pair holds the changesets of indices `from+1..=to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexPair {
    pub from: IndexId,
    pub to: IndexId,
}

impl IndexPair {
    pub fn new(from: IndexId, to: IndexId) -> Self {
        Self { from, to }
    }

    /// Number of graph indices the edge advances.
    pub fn span(&self) -> i64 {
        self.to - self.from
    }

    /// True if applying this edge covers index `index`.
    pub fn contains(&self, index: IndexId) -> bool {
        self.from < index && index <= self.to
    }

    pub fn triple(&self, ordinal: u8) -> EdgeTriple {
        EdgeTriple {
            from: self.from,
            to: self.to,
            ordinal,
        }
    }
}

impl fmt::Display for IndexPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.from, self.to)
    }
}

/// One edge: a pair plus which redundant copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeTriple {
    pub from: IndexId,
    pub to: IndexId,
    pub ordinal: u8,
}

impl EdgeTriple {
    pub fn new(from: IndexId, to: IndexId, ordinal: u8) -> Self {
        Self { from, to, ordinal }
    }

    pub fn pair(&self) -> IndexPair {
        IndexPair::new(self.from, self.to)
    }
}

impl fmt::Display for EdgeTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.from, self.to, self.ordinal)
    }
}

/// CHK slot of an edge: a real key or a placeholder awaiting insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChkSlot {
    /// Normal insert pending.
    Pending,
    /// Redundant insert pending; inserted padded or salted.
    PendingAlt,
    Chk(Chk),
}

impl ChkSlot {
    pub fn is_pending(&self) -> bool {
        !matches!(self, ChkSlot::Chk(_))
    }

    pub fn chk(&self) -> Option<&Chk> {
        match self {
            ChkSlot::Chk(chk) => Some(chk),
            _ => None,
        }
    }
}

/// How an edge's bundle gets inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertType {
    /// Plain insert of the bundle.
    Normal,
    /// Bundle plus one pad byte, giving a distinct key.
    Padded,
    /// Re-insert of the primary's metadata block with the mime marker
    /// flipped, aliasing the primary's data blocks.
    SaltedMetadata,
    /// Too large to salt; a padded full re-insert.
    Huge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changeset_hex_round_trip() {
        let hex_str = "1c66b0b1b6f6d82e34e3d5c0b8f0a9e0a7c4d3e2";
        let id = ChangesetId::from_hex(hex_str).expect("valid id");
        assert_eq!(id.to_string(), hex_str);
        assert_eq!(id.short(), "1c66b0b1b6f6");
    }

    #[test]
    fn test_changeset_rejects_bad_input() {
        assert!(ChangesetId::from_hex("abc").is_err());
        assert!(ChangesetId::from_hex(&"g".repeat(40)).is_err());
        assert!(ChangesetId::from_hex(&"a".repeat(42)).is_err());
    }

    #[test]
    fn test_null_rev() {
        assert!(NULL_REV.is_null());
        assert_eq!(NULL_REV.to_hex(), "0".repeat(40));
    }

    #[test]
    fn test_pair_contains() {
        let pair = IndexPair::new(2, 4);
        assert!(!pair.contains(2));
        assert!(pair.contains(3));
        assert!(pair.contains(4));
        assert!(!pair.contains(5));
        assert_eq!(pair.span(), 2);
    }
}
