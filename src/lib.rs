#![forbid(unsafe_code)]

//! Client-side scout for a geo-replicated CRDT store.
//!
//! The scout mediates between application sessions and remote data-center
//! surrogates: it caches replicated objects locally, runs snapshot-isolation
//! transactions with read-your-writes and monotonic reads, commits them to
//! the store asynchronously, and keeps the cache consistent through
//! server-pushed update notifications or periodic refresh.

pub mod config;
pub mod core;
pub mod error;
pub mod proto;
pub mod scout;
pub mod telemetry;

pub use error::ScoutError;
pub type Result<T> = std::result::Result<T, ScoutError>;

// Re-export the public surface at the crate root for convenience.
pub use crate::config::{CacheUpdateProtocol, LoggingConfig, ScoutConfig};
pub use crate::core::{
    ClockOrd, CrdtError, CrdtId, CrdtKind, CrdtOp, CrdtValue, DependencyPolicy, ManagedCrdt,
    OpsGroup, SourceId, Timestamp, TimestampMapping, UpdateTag, VersionClock,
};
pub use crate::proto::{
    BatchCommitUpdatesReply, BatchCommitUpdatesRequest, BatchFetchObjectVersionReply,
    BatchFetchObjectVersionRequest, BatchUpdatesNotification, CommitStatus, CommitUpdatesReply,
    CommitUpdatesRequest, FetchStatus, LatestKnownClockReply, LatestKnownClockRequest,
    NotificationReceiver, NotificationSender, ObjectUpdates, RpcError, Surrogate,
    notification_channel,
};
pub use crate::scout::{
    CachePolicy, CacheStats, CommitLog, CrdtSnapshot, DiskLog, IsolationLevel, LoggedTxn, NoopLog,
    Scout, ScoutSession, TxnError, TxnHandle, TxnStatus, UpdateListener, UpdateOp,
};
