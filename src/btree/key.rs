//! B-tree keys: rowids for table trees, raw bytes for index trees.

use std::cmp::Ordering;

use super::balancer::compare_keys;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    RowId(i64),
    Bytes(Vec<u8>),
}

impl Key {
    pub fn as_rowid(&self) -> Option<i64> {
        match self {
            Key::RowId(r) => Some(*r),
            Key::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Key::Bytes(b) => Some(b),
            Key::RowId(_) => None,
        }
    }

    pub fn is_rowid(&self) -> bool {
        matches!(self, Key::RowId(_))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::RowId(a), Key::RowId(b)) => a.cmp(b),
            (Key::Bytes(a), Key::Bytes(b)) => compare_keys(a, b),
            (Key::RowId(_), Key::Bytes(_)) => Ordering::Less,
            (Key::Bytes(_), Key::RowId(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Key {
    fn from(rowid: i64) -> Self {
        Key::RowId(rowid)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Bytes(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Bytes(s.as_bytes().to_vec())
    }
}
