//! Application-facing sessions.

use std::sync::Arc;

use super::core::ScoutInner;
use super::handle::{CachePolicy, IsolationLevel, TxnError, TxnHandle};

/// One application session on a shared scout. Sessions are cheap; a scout
/// serves one or many concurrently. Session guarantees (monotonic reads,
/// read-your-writes) span all transactions begun through the same scout.
pub struct ScoutSession {
    inner: Arc<ScoutInner>,
    session_id: String,
}

impl ScoutSession {
    pub(crate) fn new(inner: Arc<ScoutInner>, session_id: String) -> Self {
        Self { inner, session_id }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Begin a transaction. Only snapshot isolation and repeatable reads are
    /// supported; unless concurrent open transactions are enabled, at most
    /// one transaction may be pending per scout.
    pub fn begin_txn(
        &self,
        isolation: IsolationLevel,
        cache_policy: CachePolicy,
        read_only: bool,
    ) -> Result<TxnHandle, TxnError> {
        let serial = self
            .inner
            .begin_txn(&self.session_id, isolation, cache_policy, read_only)?;
        Ok(TxnHandle {
            inner: Arc::clone(&self.inner),
            serial,
            session_id: self.session_id.clone(),
            read_only,
        })
    }
}
