//! The scout: cache, transactions, committer, subscriptions.

pub mod cache;
pub mod commit_log;
mod committer;
mod core;
mod fetch;
pub mod handle;
mod notifications;
mod session;

pub use cache::{CacheStats, ObjectCache, TxnSerial};
pub use commit_log::{CommitLog, CommitLogError, DiskLog, LoggedTxn, NoopLog};
pub use self::core::Scout;
pub use handle::{
    CachePolicy, CrdtSnapshot, IsolationLevel, TxnError, TxnHandle, TxnStatus, UpdateOp,
};
pub use notifications::UpdateListener;
pub use session::ScoutSession;
