//! Transaction handles.
//!
//! A handle is a thin façade over a transaction record owned by the scout
//! core; it carries only ids, never references into the cache. Commit and
//! rollback consume the handle, so a finished transaction cannot be touched
//! again by construction, and the status machine rejects anything that slips
//! through via a stale serial.

use std::sync::Arc;

use thiserror::Error;

use crate::core::{CrdtId, CrdtKind, CrdtValue, Timestamp, UpdateTag, VersionClock};
use super::cache::TxnSerial;
use super::core::ScoutInner;
use super::notifications::UpdateListener;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    SnapshotIsolation,
    RepeatableReads,
    ReadCommitted,
    ReadUncommitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve from the cache when possible.
    Cached,
    /// Refresh the store clock estimate at begin; fall back to the cache when
    /// the store is unreachable.
    MostRecent,
    /// Refresh the store clock estimate at begin; fail with NETWORK when the
    /// store is unreachable.
    StrictlyMostRecent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    CommittedLocal,
    CommittedGlobal,
    Cancelled,
}

/// Session-facing error kinds.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TxnError {
    #[error("object {id}: kind does not match requested {requested}")]
    WrongType { id: CrdtId, requested: CrdtKind },
    #[error("object {id} does not exist in the store")]
    NoSuchObject { id: CrdtId },
    #[error("object {id}: requested version not available: {reason}")]
    VersionNotFound { id: CrdtId, reason: String },
    #[error("network: {reason}")]
    Network { reason: String },
    #[error("unsupported: {reason}")]
    Unsupported { reason: String },
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },
}

impl TxnError {
    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        TxnError::IllegalState {
            reason: reason.into(),
        }
    }

    pub(crate) fn network(reason: impl Into<String>) -> Self {
        TxnError::Network {
            reason: reason.into(),
        }
    }
}

/// Immutable view of one object version, as seen by a transaction.
#[derive(Clone, Debug)]
pub struct CrdtSnapshot {
    id: CrdtId,
    value: CrdtValue,
    version: VersionClock,
}

impl CrdtSnapshot {
    pub(crate) fn new(id: CrdtId, value: CrdtValue, version: VersionClock) -> Self {
        Self { id, value, version }
    }

    pub fn id(&self) -> &CrdtId {
        &self.id
    }

    pub fn kind(&self) -> CrdtKind {
        self.value.kind()
    }

    pub fn version(&self) -> &VersionClock {
        &self.version
    }

    /// Raw value behind the typed accessors.
    pub fn value(&self) -> &CrdtValue {
        &self.value
    }

    pub fn counter(&self) -> Result<i64, TxnError> {
        self.value.counter_value().ok_or_else(|| self.wrong_type(CrdtKind::Counter))
    }

    pub fn register(&self) -> Result<Option<&str>, TxnError> {
        self.value
            .register_value()
            .ok_or_else(|| self.wrong_type(CrdtKind::Register))
    }

    pub fn set_contains(&self, element: &str) -> Result<bool, TxnError> {
        match &self.value {
            CrdtValue::Set(_) => Ok(self.value.set_tags(element).is_some()),
            _ => Err(self.wrong_type(CrdtKind::Set)),
        }
    }

    pub fn set_elements(&self) -> Result<Vec<&str>, TxnError> {
        self.value
            .set_elements()
            .map(Iterator::collect)
            .ok_or_else(|| self.wrong_type(CrdtKind::Set))
    }

    pub fn directory_get(&self, key: &str) -> Result<Option<&str>, TxnError> {
        self.value
            .directory_get(key)
            .ok_or_else(|| self.wrong_type(CrdtKind::Directory))
    }

    pub fn directory_keys(&self) -> Result<Vec<&str>, TxnError> {
        self.value
            .directory_keys()
            .map(Iterator::collect)
            .ok_or_else(|| self.wrong_type(CrdtKind::Directory))
    }

    fn wrong_type(&self, requested: CrdtKind) -> TxnError {
        TxnError::WrongType {
            id: self.id.clone(),
            requested,
        }
    }
}

/// An update as issued by the application; the handle stamps it with the
/// transaction's timestamp and a per-transaction sequence to form the wire
/// operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    CounterAdd(i64),
    RegisterWrite(String),
    SetAdd(String),
    SetRemove(String),
    DirectoryPut(String, String),
    DirectoryRemove(String),
}

impl UpdateOp {
    pub fn kind(&self) -> CrdtKind {
        match self {
            UpdateOp::CounterAdd(_) => CrdtKind::Counter,
            UpdateOp::RegisterWrite(_) => CrdtKind::Register,
            UpdateOp::SetAdd(_) | UpdateOp::SetRemove(_) => CrdtKind::Set,
            UpdateOp::DirectoryPut(_, _) | UpdateOp::DirectoryRemove(_) => CrdtKind::Directory,
        }
    }
}

pub struct TxnHandle {
    pub(crate) inner: Arc<ScoutInner>,
    pub(crate) serial: TxnSerial,
    pub(crate) session_id: String,
    pub(crate) read_only: bool,
}

impl std::fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnHandle")
            .field("serial", &self.serial)
            .field("session_id", &self.session_id)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl TxnHandle {
    /// Read an object. With `version = None` the read follows the handle's
    /// isolation level (snapshot clock for SI, first-access freeze for RR);
    /// an explicit version must equal the SI snapshot.
    pub fn get(
        &self,
        id: &CrdtId,
        create_if_missing: bool,
        version: Option<&VersionClock>,
        listener: Option<Arc<dyn UpdateListener>>,
    ) -> Result<CrdtSnapshot, TxnError> {
        self.inner
            .txn_get(self.serial, id, create_if_missing, version, listener)
    }

    /// Buffer an update. Removals require the object to have been read in
    /// this transaction: a remove covers exactly the membership the
    /// transaction observed.
    pub fn put(&self, id: &CrdtId, op: UpdateOp) -> Result<(), TxnError> {
        self.inner.txn_put(self.serial, id, op)
    }

    /// Commit locally and enqueue for asynchronous global commit. Blocks only
    /// when the commit queue is full (backpressure).
    pub fn commit(self) -> Result<(), TxnError> {
        self.inner.txn_commit(self.serial)
    }

    /// Abandon the transaction. An update transaction that already buffered
    /// operations still commits a timestamp-only record globally, so other
    /// scouts never observe a hole in this scout's timestamp sequence.
    pub fn rollback(self) -> Result<(), TxnError> {
        self.inner.txn_rollback(self.serial)
    }

    pub fn status(&self) -> TxnStatus {
        self.inner.txn_status(self.serial)
    }

    /// Client timestamp, present on update transactions.
    pub fn client_timestamp(&self) -> Option<Timestamp> {
        self.inner.txn_client_timestamp(self.serial)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        // A handle dropped while still pending is rolled back, keeping the
        // timestamp bookkeeping hole-free.
        self.inner.txn_rollback_if_pending(self.serial);
    }
}

/// Build the wire operation for a stamped update.
pub(crate) fn stamped_op(
    op: &UpdateOp,
    tag: UpdateTag,
    observed: Option<&CrdtValue>,
) -> Result<crate::core::CrdtOp, TxnError> {
    use crate::core::CrdtOp;
    Ok(match op {
        UpdateOp::CounterAdd(delta) => CrdtOp::CounterAdd { delta: *delta },
        UpdateOp::RegisterWrite(value) => CrdtOp::RegisterWrite {
            tag,
            value: value.clone(),
        },
        UpdateOp::SetAdd(element) => CrdtOp::SetAdd {
            element: element.clone(),
            tag,
        },
        UpdateOp::SetRemove(element) => {
            let observed = observed.and_then(|value| value.set_tags(element));
            CrdtOp::SetRemove {
                element: element.clone(),
                tags: observed.cloned().unwrap_or_default(),
            }
        }
        UpdateOp::DirectoryPut(key, value) => CrdtOp::DirectoryPut {
            key: key.clone(),
            tag,
            value: value.clone(),
        },
        UpdateOp::DirectoryRemove(key) => CrdtOp::DirectoryRemove {
            key: key.clone(),
            tag,
        },
    })
}
