//! Update operations and per-object operation groups.

use minicbor::{Decode, Encode};
use std::collections::BTreeSet;

use super::clock::VersionClock;
use super::id::{CrdtId, CrdtKind};
use super::timestamp::{Timestamp, TimestampMapping};

/// Uniquely identifies one update within a transaction: the transaction's
/// client timestamp plus a per-transaction sequence number. Tags arbitrate
/// last-writer-wins registers and anchor add-wins set membership.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode)]
pub struct UpdateTag {
    #[n(0)]
    pub ts: Timestamp,
    #[n(1)]
    pub seq: u32,
}

impl UpdateTag {
    pub fn new(ts: Timestamp, seq: u32) -> Self {
        Self { ts, seq }
    }
}

/// One update operation against a single object.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum CrdtOp {
    #[n(0)]
    CounterAdd {
        #[n(0)]
        delta: i64,
    },
    #[n(1)]
    RegisterWrite {
        #[n(0)]
        tag: UpdateTag,
        #[n(1)]
        value: String,
    },
    #[n(2)]
    SetAdd {
        #[n(0)]
        element: String,
        #[n(1)]
        tag: UpdateTag,
    },
    /// Removes the listed tags only; adds concurrent with the remove survive.
    #[n(3)]
    SetRemove {
        #[n(0)]
        element: String,
        #[n(1)]
        tags: BTreeSet<UpdateTag>,
    },
    #[n(4)]
    DirectoryPut {
        #[n(0)]
        key: String,
        #[n(1)]
        tag: UpdateTag,
        #[n(2)]
        value: String,
    },
    #[n(5)]
    DirectoryRemove {
        #[n(0)]
        key: String,
        #[n(1)]
        tag: UpdateTag,
    },
}

impl CrdtOp {
    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtOp::CounterAdd { .. } => CrdtKind::Counter,
            CrdtOp::RegisterWrite { .. } => CrdtKind::Register,
            CrdtOp::SetAdd { .. } | CrdtOp::SetRemove { .. } => CrdtKind::Set,
            CrdtOp::DirectoryPut { .. } | CrdtOp::DirectoryRemove { .. } => CrdtKind::Directory,
        }
    }
}

/// All updates a single transaction made to one object, shipped and applied
/// as a unit.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpsGroup {
    #[n(0)]
    pub target: CrdtId,
    #[n(1)]
    pub mapping: TimestampMapping,
    #[n(2)]
    pub dependency: VersionClock,
    #[n(3)]
    pub ops: Vec<CrdtOp>,
    /// Set when this transaction brought the object into existence; the store
    /// registers the object before applying the ops.
    #[n(4)]
    pub creates: bool,
}

impl OpsGroup {
    pub fn new(target: CrdtId, mapping: TimestampMapping) -> Self {
        Self {
            target,
            mapping,
            dependency: VersionClock::new(),
            ops: Vec::new(),
            creates: false,
        }
    }

    pub fn client_timestamp(&self) -> &Timestamp {
        self.mapping.client()
    }

    /// Replace the dependency clock, e.g. with a batch-shared
    /// over-approximation before shipping.
    pub fn with_dependency(&self, dependency: VersionClock) -> Self {
        let mut group = self.clone();
        group.dependency = dependency;
        group
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && !self.creates
    }
}
