//! Object identifiers.

use std::fmt;

use minicbor::{Decode, Encode};
use thiserror::Error;

/// The CRDT variant an object id is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
#[cbor(index_only)]
pub enum CrdtKind {
    #[n(0)]
    Counter,
    #[n(1)]
    Register,
    #[n(2)]
    Set,
    #[n(3)]
    Directory,
}

impl CrdtKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CrdtKind::Counter => "counter",
            CrdtKind::Register => "register",
            CrdtKind::Set => "set",
            CrdtKind::Directory => "directory",
        }
    }
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one replicated object: (table, key, kind). Equality is
/// structural; the kind is part of the identity so a key can never silently
/// change shape.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct CrdtId {
    #[n(0)]
    table: String,
    #[n(1)]
    key: String,
    #[n(2)]
    kind: CrdtKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("object id `{table}/{key}` is invalid: {reason}")]
pub struct InvalidCrdtId {
    pub table: String,
    pub key: String,
    pub reason: &'static str,
}

impl CrdtId {
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        kind: CrdtKind,
    ) -> Result<Self, InvalidCrdtId> {
        let table = table.into();
        let key = key.into();
        if table.is_empty() || key.is_empty() {
            return Err(InvalidCrdtId {
                table,
                key,
                reason: "table and key must be non-empty",
            });
        }
        Ok(Self { table, key, kind })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> CrdtKind {
        self.kind
    }
}

impl fmt::Debug for CrdtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.table, self.key, self.kind)
    }
}

impl fmt::Display for CrdtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.table, self.key, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_components() {
        assert!(CrdtId::new("", "k", CrdtKind::Counter).is_err());
        assert!(CrdtId::new("t", "", CrdtKind::Counter).is_err());
    }

    #[test]
    fn kind_is_part_of_identity() {
        let a = CrdtId::new("t", "k", CrdtKind::Counter).unwrap();
        let b = CrdtId::new("t", "k", CrdtKind::Set).unwrap();
        assert_ne!(a, b);
    }
}
