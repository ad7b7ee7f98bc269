//! Scout core: transaction manager, cache owner, causal bookkeeping.
//!
//! One coarse mutex protects all shared mutable state (clocks, cache,
//! subscription maps, queues); the condvar doubles as committer wakeup,
//! commit-queue backpressure, and the cache-refresh barrier. RPCs issued by
//! background workers release the lock across the network call.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ScoutConfig;
use crate::core::{
    ClockOrd, CrdtId, CrdtValue, DependencyPolicy, ManagedCrdt, OpsGroup, SourceId, Timestamp,
    TimestampMapping, TimestampSource, VersionClock,
};
use crate::proto::endpoint::{NotificationReceiver, Surrogate, notification_channel};
use crate::proto::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::proto::messages::{
    BatchFetchObjectVersionRequest, BatchUpdatesNotification, FetchStatus,
    LatestKnownClockRequest,
};
use crate::error::ScoutError;

use super::cache::{CacheStats, ObjectCache, TxnSerial};
use super::commit_log::{CommitLog, DiskLog, LoggedTxn, NoopLog};
use super::committer::run_committer;
use super::fetch::{FetchFailure, FetchParams, FetchPipeline};
use super::handle::{
    CachePolicy, CrdtSnapshot, IsolationLevel, TxnError, TxnStatus, UpdateOp, stamped_op,
};
use super::notifications::{
    ListenerExecutor, PendingNotifications, SubscriptionRegistry, SubscriptionWithListener,
    UpdateListener, listener_task,
};
use super::session::ScoutSession;

const EXECUTOR_THREADS: usize = 4;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of installing one fetch reply into the cache.
pub(crate) enum InstallOutcome {
    Done,
    /// VERSION_MISSING or an eviction race; retry until the deadline.
    Retry,
    Failed(FetchFailure),
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct StopState {
    pub requested: bool,
    pub graceful: bool,
}

/// Mutable per-transaction record, owned by the scout state. Handles refer
/// to it by serial only.
pub(crate) struct TxnRecord {
    pub serial: TxnSerial,
    pub session_id: String,
    pub isolation: IsolationLevel,
    pub cache_policy: CachePolicy,
    pub read_only: bool,
    pub mapping: Option<TimestampMapping>,
    /// Frozen at begin for snapshot isolation.
    pub snapshot: VersionClock,
    /// Per-object frozen versions for repeatable reads.
    pub rr_versions: HashMap<CrdtId, VersionClock>,
    /// Values as last observed by this transaction (own updates applied);
    /// removals cover exactly this observed state.
    pub read_views: HashMap<CrdtId, CrdtValue>,
    pub created: HashSet<CrdtId>,
    /// Transitive causal antecedents of the write set; grows with each read.
    pub dependency: VersionClock,
    pub ops: BTreeMap<CrdtId, OpsGroup>,
    pub next_tag_seq: u32,
    pub status: TxnStatus,
}

/// A locally committed transaction awaiting (or past) global commit.
#[derive(Clone)]
pub(crate) struct CommittedTxn {
    pub serial: TxnSerial,
    pub mapping: TimestampMapping,
    pub dependency: VersionClock,
    pub ops: BTreeMap<CrdtId, OpsGroup>,
}

pub(crate) struct ScoutState {
    pub stop: StopState,
    /// Clock known committed at some surrogate.
    pub committed_version: VersionClock,
    /// Clock known committed and geo-replicated.
    pub committed_disaster_durable: VersionClock,
    /// Union of dependency clocks + own timestamps of all locally committed
    /// transactions.
    pub last_locally_committed: VersionClock,
    /// Snapshot baseline for new transactions; advanced only when the cache
    /// is known consistent with it.
    pub next_available_snapshot: VersionClock,
    pub timestamps: TimestampSource,
    pub next_serial: TxnSerial,
    pub cache: ObjectCache,
    pub pending: BTreeMap<TxnSerial, TxnRecord>,
    /// Ordered by client timestamp; the first entry is the next global
    /// commit candidate.
    pub locally_committed: BTreeMap<Timestamp, CommittedTxn>,
    /// Globally committed but possibly not yet disaster-durable, FIFO.
    pub globally_committed_unstable: VecDeque<CommittedTxn>,
    /// Clocks of outstanding fetches; pruning never crosses a live fetch.
    pub fetch_versions_in_progress: Vec<VersionClock>,
    pub subscriptions: SubscriptionRegistry,
    pub pending_notifications: PendingNotifications,
    pub cache_refresh_ready: bool,
    pub log: Box<dyn CommitLog>,
}

pub(crate) struct ScoutInner {
    pub scout_id: SourceId,
    pub config: ScoutConfig,
    pub surrogate: Arc<dyn Surrogate>,
    pub state: Mutex<ScoutState>,
    pub wakeup: Condvar,
    pub executor: ListenerExecutor,
    pub fetches: FetchPipeline,
    pub stopped: AtomicBool,
    evicted: Arc<Mutex<Vec<CrdtId>>>,
}

enum CacheMiss {
    NoObject,
    WrongVersion(String),
    WrongType,
}

impl ScoutInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ScoutState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn assert_running(state: &ScoutState) -> Result<(), TxnError> {
        if state.stop.requested {
            return Err(TxnError::illegal("scout is stopped"));
        }
        Ok(())
    }

    fn global_committed<'a>(&self, state: &'a ScoutState) -> &'a VersionClock {
        if self.config.disaster_safe {
            &state.committed_disaster_durable
        } else {
            &state.committed_version
        }
    }

    pub(crate) fn next_txn_snapshot(&self, state: &ScoutState) -> VersionClock {
        if self.config.cache_update_protocol.is_uncoordinated() {
            self.global_committed(state).clone()
        } else {
            state.next_available_snapshot.clone()
        }
    }

    fn set_next_available_snapshot(&self, state: &mut ScoutState, clock: VersionClock) {
        if clock.has_source(&self.scout_id) {
            tracing::warn!(scout = %self.scout_id, "next snapshot clock includes scout timestamps");
        }
        tracing::debug!(snapshot = %clock, "advanced next available snapshot");
        state.next_available_snapshot = clock;
    }

    /// Invariant: the result never exceeds the next transaction snapshot, any
    /// open transaction's dependencies, or any in-flight fetch.
    pub(crate) fn next_read_lower_bound(&self, state: &ScoutState) -> VersionClock {
        let mut lower = state.committed_disaster_durable.clone();
        lower.intersect(&self.next_txn_snapshot(state));
        for record in state.pending.values() {
            lower.intersect(&record.dependency);
        }
        for clock in &state.fetch_versions_in_progress {
            lower.intersect(clock);
        }
        lower.drop_source(&self.scout_id);
        lower.trim();
        lower
    }

    pub(crate) fn try_prune(&self, state: &mut ScoutState, ids: &[CrdtId]) {
        let point = self.next_read_lower_bound(state);
        for id in ids {
            if let Some(crdt) = state.cache.get_without_touch_mut(id)
                && let Err(err) = crdt.prune(&point, true)
            {
                tracing::debug!(object = %id, %err, "skipping prune");
            }
        }
    }

    /// Merge store-side clock knowledge, clean up stable transactions, and
    /// fire deferred notifications that became committed. Returns a copy of
    /// the global committed clock.
    pub(crate) fn update_committed_versions(
        &self,
        state: &mut ScoutState,
        new_committed: Option<&VersionClock>,
        new_disaster_durable: Option<&VersionClock>,
    ) -> VersionClock {
        let mut changed = false;
        if let Some(clock) = new_committed {
            changed |= matches!(
                state.committed_version.merge(clock),
                ClockOrd::Dominated | ClockOrd::Concurrent
            );
        }
        if let Some(clock) = new_disaster_durable {
            changed |= matches!(
                state.committed_disaster_durable.merge(clock),
                ClockOrd::Dominated | ClockOrd::Concurrent
            );
        }
        if !changed {
            return self.global_committed(state).clone();
        }
        tracing::debug!(
            committed = %state.committed_version,
            disaster_durable = %state.committed_disaster_durable,
            "updated committed vectors"
        );

        // Discard the stable prefix of globally committed transactions whose
        // system timestamps fell below the read lower bound.
        let pruning_point = self.next_read_lower_bound(state);
        let mut stable_prefix = 0;
        for (index, txn) in state.globally_committed_unstable.iter().enumerate() {
            if txn.mapping.has_system_timestamp() {
                if txn.mapping.all_system_timestamps_included(&pruning_point) {
                    stable_prefix = index + 1;
                } else {
                    break;
                }
            }
            // Unknown system timestamp (concurrent-open): rely on subsequent
            // transactions to determine removal.
        }
        for _ in 0..stable_prefix {
            state.globally_committed_unstable.pop_front();
        }

        // Deferred listeners whose update is now globally committed.
        let global = self.global_committed(state).clone();
        let due = state.pending_notifications.drain_included(&global);
        for (_, ids) in due {
            for id in ids {
                for session in state.subscriptions.sessions_with_listeners(&id) {
                    if let Some(subscription) = state.subscriptions.take_listener(&id, &session) {
                        self.executor.execute(listener_task(subscription, id.clone()));
                    }
                }
            }
        }
        global
    }

    /// Ask the store for its latest committed clocks. Returns the global
    /// committed clock copy on success.
    pub(crate) fn force_clock_estimate(&self) -> Option<VersionClock> {
        let request = LatestKnownClockRequest {
            scout_id: self.scout_id.clone(),
            disaster_safe: self.config.disaster_safe,
        };
        let deadline = Duration::from_millis(self.config.deadline_millis);
        match self.surrogate.latest_known_clock(request, deadline) {
            Ok(mut reply) => {
                reply.disaster_durable_clock.intersect(&reply.clock);
                let mut state = self.lock_state();
                Some(self.update_committed_versions(
                    &mut state,
                    Some(&reply.clock),
                    Some(&reply.disaster_durable_clock),
                ))
            }
            Err(err) => {
                tracing::warn!(%err, "could not refresh store clock estimate");
                None
            }
        }
    }

    fn drain_evictions(&self, state: &mut ScoutState) {
        let evicted: Vec<CrdtId> = {
            let mut evicted = self
                .evicted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            evicted.drain(..).collect()
        };
        for id in evicted {
            state.subscriptions.remove_object(&id);
        }
    }

    // ----- transaction lifecycle -------------------------------------------

    pub(crate) fn begin_txn(
        &self,
        session_id: &str,
        isolation: IsolationLevel,
        cache_policy: CachePolicy,
        read_only: bool,
    ) -> Result<TxnSerial, TxnError> {
        match isolation {
            IsolationLevel::SnapshotIsolation | IsolationLevel::RepeatableReads => {}
            other => {
                return Err(TxnError::Unsupported {
                    reason: format!("isolation level {other:?} unsupported"),
                });
            }
        }

        let mut state = self.lock_state();
        Self::assert_running(&state)?;
        if !self.config.concurrent_open_transactions && !state.pending.is_empty() {
            return Err(TxnError::illegal(
                "only one transaction can be open at a time",
            ));
        }

        // Wait while a finished cache refresh is ready to install.
        while state.cache_refresh_ready {
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Self::assert_running(&state)?;
        }

        if matches!(
            cache_policy,
            CachePolicy::MostRecent | CachePolicy::StrictlyMostRecent
        ) {
            // Refresh the committed-clock estimate before taking the
            // snapshot. The lock is held across the call, like every
            // foreground operation of the scout.
            let request = LatestKnownClockRequest {
                scout_id: self.scout_id.clone(),
                disaster_safe: self.config.disaster_safe,
            };
            let deadline = Duration::from_millis(self.config.deadline_millis);
            match self.surrogate.latest_known_clock(request, deadline) {
                Ok(mut reply) => {
                    reply.disaster_durable_clock.intersect(&reply.clock);
                    let next = self.update_committed_versions(
                        &mut state,
                        Some(&reply.clock),
                        Some(&reply.disaster_durable_clock),
                    );
                    self.set_next_available_snapshot(&mut state, next);
                }
                Err(err) => {
                    if cache_policy == CachePolicy::StrictlyMostRecent {
                        return Err(TxnError::network(format!(
                            "timed out to get transaction snapshot point: {err}"
                        )));
                    }
                    tracing::warn!(%err, "proceeding with cached snapshot estimate");
                }
            }
        }

        let snapshot = match isolation {
            IsolationLevel::SnapshotIsolation => {
                // Snapshot dominates every previous transaction's snapshot
                // (monotonic reads) and contains prior local commits
                // (read-your-writes).
                let mut snapshot = self.next_txn_snapshot(&state);
                snapshot.merge(&state.last_locally_committed);
                snapshot
            }
            _ => VersionClock::new(),
        };

        let mapping = if read_only {
            None
        } else {
            Some(TimestampMapping::new(state.timestamps.generate_next()))
        };

        state.next_serial += 1;
        let serial = state.next_serial;
        let dependency = snapshot.clone();
        let record = TxnRecord {
            serial,
            session_id: session_id.to_string(),
            isolation,
            cache_policy,
            read_only,
            mapping,
            snapshot,
            rr_versions: HashMap::new(),
            read_views: HashMap::new(),
            created: HashSet::new(),
            dependency,
            ops: BTreeMap::new(),
            next_tag_seq: 0,
            status: TxnStatus::Pending,
        };
        tracing::info!(
            session = session_id,
            serial,
            ?isolation,
            snapshot = %record.snapshot,
            "transaction started"
        );
        state.pending.insert(serial, record);
        Ok(serial)
    }

    pub(crate) fn txn_get(
        self: &Arc<Self>,
        serial: TxnSerial,
        id: &CrdtId,
        create: bool,
        version: Option<&VersionClock>,
        listener: Option<Arc<dyn UpdateListener>>,
    ) -> Result<CrdtSnapshot, TxnError> {
        let overall_deadline = Duration::from_millis(self.config.deadline_millis.saturating_mul(2));
        let started = Instant::now();
        let mut just_fetched = false;
        let mut fetch_error: Option<TxnError> = None;

        loop {
            // Try the cache first.
            let (strict_required, fetch_version) = {
                let mut state = self.lock_state();
                Self::assert_running(&state)?;
                let record = state
                    .pending
                    .get(&serial)
                    .ok_or_else(|| TxnError::illegal("transaction is not pending"))?;
                if record.status != TxnStatus::Pending {
                    return Err(TxnError::illegal("transaction handle already finished"));
                }
                let cache_policy = record.cache_policy;
                let isolation = record.isolation;
                if let Some(version) = version
                    && isolation == IsolationLevel::SnapshotIsolation
                    && *version != record.snapshot
                {
                    return Err(TxnError::Unsupported {
                        reason: "snapshot isolation reads only at the transaction snapshot".into(),
                    });
                }

                match self.cached_view(&mut state, serial, id, version, listener.as_ref(), just_fetched) {
                    Ok(snapshot) => {
                        state.cache.note_hit();
                        self.drain_evictions(&mut state);
                        return Ok(snapshot);
                    }
                    Err(CacheMiss::WrongType) => {
                        return Err(TxnError::WrongType {
                            id: id.clone(),
                            requested: id.kind(),
                        });
                    }
                    Err(CacheMiss::NoObject) => state.cache.note_miss_no_object(),
                    Err(CacheMiss::WrongVersion(reason)) => {
                        tracing::debug!(object = %id, reason, "no suitable version cached");
                        state.cache.note_miss_wrong_version();
                    }
                }

                // The version to request: the explicit/snapshot version for
                // precise reads, the freshest known clock for latest reads.
                let fetch_version = match (version, isolation) {
                    (Some(version), _) => version.clone(),
                    (None, IsolationLevel::SnapshotIsolation) => {
                        let record = state.pending.get(&serial).expect("checked above");
                        record.snapshot.clone()
                    }
                    (None, _) => self.next_txn_snapshot(&state),
                };
                let strict_required = version.is_some()
                    || cache_policy == CachePolicy::StrictlyMostRecent
                    || !state.cache.contains(id);
                (strict_required, fetch_version)
            };

            if let Some(err) = fetch_error.take() {
                // A fetch already failed and the cache still cannot serve the
                // read: give up with the fetch error.
                return Err(err);
            }
            if started.elapsed() > overall_deadline {
                return Err(TxnError::network(
                    "deadline exceeded reading object through the cache",
                ));
            }

            let wants_updates = listener.is_some();
            let params = FetchParams {
                id: id.clone(),
                serial: Some(serial),
                create,
                requested_version: fetch_version,
                send_more_recent_updates: wants_updates,
                subscribe_updates: wants_updates,
                touch: true,
            };
            match self.fetches.fetch(self, params) {
                Ok(()) => just_fetched = true,
                Err(err) => {
                    if strict_required {
                        return Err(err);
                    }
                    just_fetched = false;
                    fetch_error = Some(err);
                }
            }
        }
    }

    /// Serve a read from the cache, or say precisely why it cannot be served.
    fn cached_view(
        self: &Arc<Self>,
        state: &mut ScoutState,
        serial: TxnSerial,
        id: &CrdtId,
        version: Option<&VersionClock>,
        listener: Option<&Arc<dyn UpdateListener>>,
        just_fetched: bool,
    ) -> Result<CrdtSnapshot, CacheMiss> {
        let record = state.pending.get(&serial).expect("pending record");
        let isolation = record.isolation;
        let read_only = record.read_only;
        let session_id = record.session_id.clone();
        let client_ts = record.mapping.as_ref().map(|m| m.client().clone());
        let snapshot = record.snapshot.clone();
        let rr_frozen = record.rr_versions.get(id).cloned();
        let latest_base = {
            let mut base = self.next_txn_snapshot(state);
            base.merge(&state.last_locally_committed);
            base
        };

        let Some(crdt) = state.cache.get_and_touch(id) else {
            return Err(CacheMiss::NoObject);
        };
        if crdt.kind() != id.kind() {
            return Err(CacheMiss::WrongType);
        }

        let query = match version {
            Some(version) => version.clone(),
            None => match isolation {
                IsolationLevel::SnapshotIsolation => snapshot,
                _ => match rr_frozen {
                    Some(frozen) => frozen,
                    None => {
                        let mut query = latest_base;
                        if self.config.concurrent_open_transactions
                            && !read_only
                            && let Some(client_ts) = &client_ts
                        {
                            // Only smaller timestamps may enter the snapshot:
                            // timestamp order induces the commit order, so
                            // this cannot create dependency cycles.
                            query.drop_source(&self.scout_id);
                            query.record_all_until(client_ts);
                        }
                        query.intersect(crdt.clock());
                        query
                    }
                },
            },
        };

        let mut value = match crdt.get_version(&query) {
            Ok(value) => value,
            Err(err) => return Err(CacheMiss::WrongVersion(err.to_string())),
        };
        let registered = crdt.is_registered_in_store();
        let recent_mappings = match crdt.updates_since(&query) {
            Ok(mappings) => mappings,
            Err(_) => Vec::new(),
        };

        state.cache.protect(id, serial);
        let record = state.pending.get_mut(&serial).expect("pending record");
        record.dependency.merge(&query);
        if record.isolation == IsolationLevel::RepeatableReads && version.is_none() {
            record
                .rr_versions
                .entry(id.clone())
                .or_insert_with(|| query.clone());
        }
        if let Some(group) = record.ops.get(id) {
            for op in &group.ops {
                if let Err(err) = value.apply(op) {
                    return Err(CacheMiss::WrongVersion(err.to_string()));
                }
            }
        }
        record.read_views.insert(id.clone(), value.clone());

        if let Some(listener) = listener {
            if !self.config.cache_update_protocol.is_notifications() {
                tracing::warn!(
                    protocol = ?self.config.cache_update_protocol,
                    "update listeners are unreliable outside the notifications protocol"
                );
            }
            let newly_subscribed = state.subscriptions.ensure_subscribed(id);
            if newly_subscribed && !just_fetched && registered {
                // The cache satisfied the read, so no subscribing fetch went
                // out; issue one so the store starts pushing updates.
                self.async_fetch_and_subscribe(id.clone());
            }
            let subscription = SubscriptionWithListener {
                serial,
                listener: Arc::clone(listener),
                read_version: query.clone(),
                view: value.clone(),
                fired: Arc::new(AtomicBool::new(false)),
            };
            state.subscriptions.add_listener(id, &session_id, subscription);
            if read_only && !registered {
                tracing::warn!(
                    object = %id,
                    "read-only transaction cannot await updates on an object absent from the store"
                );
            }
            // Fire immediately when newer committed updates are already known.
            self.try_notify_mappings(state, id, &session_id, &recent_mappings);
        }

        Ok(CrdtSnapshot::new(id.clone(), value, query))
    }

    pub(crate) fn txn_put(&self, serial: TxnSerial, id: &CrdtId, op: UpdateOp) -> Result<(), TxnError> {
        let mut state = self.lock_state();
        Self::assert_running(&state)?;
        let record = state
            .pending
            .get_mut(&serial)
            .ok_or_else(|| TxnError::illegal("transaction is not pending"))?;
        if record.status != TxnStatus::Pending {
            return Err(TxnError::illegal("transaction handle already finished"));
        }
        if record.read_only {
            return Err(TxnError::illegal(
                "updates are not allowed in a read-only transaction",
            ));
        }
        if op.kind() != id.kind() {
            return Err(TxnError::WrongType {
                id: id.clone(),
                requested: op.kind(),
            });
        }
        let mapping = record
            .mapping
            .clone()
            .ok_or_else(|| TxnError::illegal("update transaction without a timestamp"))?;

        if matches!(op, UpdateOp::SetRemove(_) | UpdateOp::DirectoryRemove(_))
            && !record.read_views.contains_key(id)
        {
            return Err(TxnError::illegal(
                "object must be read in this transaction before removing from it",
            ));
        }

        let tag = crate::core::UpdateTag::new(mapping.client().clone(), record.next_tag_seq);
        record.next_tag_seq += 1;
        let observed = record.read_views.get(id);
        let wire_op = stamped_op(&op, tag, observed)?;

        let group = record
            .ops
            .entry(id.clone())
            .or_insert_with(|| OpsGroup::new(id.clone(), mapping));
        group.ops.push(wire_op.clone());

        // Keep the observed view current so later removals in this
        // transaction see earlier buffered updates.
        if let Some(view) = record.read_views.get_mut(id) {
            let _ = view.apply(&wire_op);
        }
        Ok(())
    }

    pub(crate) fn txn_commit(&self, serial: TxnSerial) -> Result<(), TxnError> {
        let mut state = self.lock_state();
        Self::assert_running(&state)?;
        let Some(mut record) = state.pending.remove(&serial) else {
            return Err(TxnError::illegal("transaction is not pending"));
        };
        record.status = TxnStatus::CommittedLocal;
        tracing::info!(serial, session = %record.session_id, "transaction committed locally");

        let requires_global = !record.read_only
            && (!record.ops.is_empty() || self.config.concurrent_open_transactions);
        if !requires_global {
            if let Some(mapping) = &record.mapping {
                state.timestamps.return_last(mapping.client());
            }
            state.cache.remove_protection(serial);
            self.drain_evictions(&mut state);
            self.wakeup.notify_all();
            tracing::debug!(serial, "read-only transaction will not commit globally");
            return Ok(());
        }

        let mapping = record
            .mapping
            .clone()
            .ok_or_else(|| TxnError::illegal("update transaction without a timestamp"))?;
        let client = mapping.client().clone();

        state.last_locally_committed.record(&client);
        let mut ops = record.ops;
        for (id, group) in &mut ops {
            group.dependency = record.dependency.clone();
            group.creates = record.created.contains(id);
        }
        let committed = CommittedTxn {
            serial,
            mapping,
            dependency: record.dependency.clone(),
            ops,
        };

        // Apply the write set to the cache and wake interested listeners.
        let group_list: Vec<(CrdtId, OpsGroup)> = committed
            .ops
            .iter()
            .map(|(id, group)| (id.clone(), group.clone()))
            .collect();
        for (id, group) in &group_list {
            if let Some(crdt) = state.cache.get_without_touch_mut(id) {
                if let Err(err) = crdt.execute(group, DependencyPolicy::Ignore) {
                    tracing::warn!(object = %id, %err, "could not apply local commit to cache");
                }
            }
            // A listener this transaction itself installed must not fire for
            // the transaction's own updates.
            if let Some(subscription) = state.subscriptions.listener_mut(id, &record.session_id)
                && subscription.serial == serial
            {
                subscription.read_version.record(&client);
            }
            for session in state.subscriptions.sessions_with_listeners(id) {
                self.try_notify_mappings(
                    &mut state,
                    id,
                    &session,
                    std::slice::from_ref(&group.mapping),
                );
            }
        }
        state.cache.augment_all_with_scout_timestamp(&client);
        let dependency = committed.dependency.clone();
        state.last_locally_committed.merge(&dependency);

        let logged = LoggedTxn {
            client_timestamp: client.clone(),
            dependency,
            groups: committed.ops.values().cloned().collect(),
        };
        if let Err(err) = state.log.append(&logged) {
            tracing::error!(%err, "could not append transaction to the durable log");
        }

        let state = self.enqueue_locally_committed(state, committed)?;
        drop(state);
        Ok(())
    }

    /// Queue a locally committed transaction for the committer, blocking on
    /// backpressure unless this transaction is itself the next candidate.
    fn enqueue_locally_committed<'a>(
        &self,
        mut state: MutexGuard<'a, ScoutState>,
        committed: CommittedTxn,
    ) -> Result<MutexGuard<'a, ScoutState>, TxnError> {
        let client = committed.mapping.client().clone();
        while state.locally_committed.len() >= self.config.max_async_transactions_queued
            && state
                .locally_committed
                .keys()
                .next()
                .is_some_and(|first| *first < client)
        {
            tracing::warn!("asynchronous commit queue is full, blocking the transaction commit");
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.stop.requested && !state.stop.graceful {
                return Err(TxnError::network(
                    "scout stopped in non-graceful manner, transaction not committed",
                ));
            }
        }
        state.locally_committed.insert(client, committed);
        self.wakeup.notify_all();
        Ok(state)
    }

    pub(crate) fn txn_rollback(&self, serial: TxnSerial) -> Result<(), TxnError> {
        let mut state = self.lock_state();
        let Some(mut record) = state.pending.remove(&serial) else {
            return Err(TxnError::illegal("transaction is not pending"));
        };
        record.status = TxnStatus::Cancelled;
        self.wakeup.notify_all();
        tracing::info!(serial, session = %record.session_id, "transaction rolled back");

        let requires_global = !record.read_only
            && record.mapping.is_some()
            && (!record.ops.is_empty() || self.config.concurrent_open_transactions);
        if !requires_global {
            if let Some(mapping) = &record.mapping {
                state.timestamps.return_last(mapping.client());
            }
            state.cache.remove_protection(serial);
            self.drain_evictions(&mut state);
            return Ok(());
        }

        // The timestamp was observed by buffered updates, so it cannot be
        // reused: commit a timestamp-only record globally so other scouts
        // never see a hole in this scout's sequence.
        let mapping = record.mapping.clone().expect("checked above");
        let client = mapping.client().clone();
        state.last_locally_committed.record(&client);
        state.cache.augment_all_with_scout_timestamp(&client);
        let dummy = CommittedTxn {
            serial,
            mapping,
            dependency: record.dependency.clone(),
            ops: BTreeMap::new(),
        };
        let logged = LoggedTxn {
            client_timestamp: client,
            dependency: record.dependency.clone(),
            groups: Vec::new(),
        };
        if let Err(err) = state.log.append(&logged) {
            tracing::error!(%err, "could not append discard record to the durable log");
        }
        let state = self.enqueue_locally_committed(state, dummy)?;
        drop(state);
        Ok(())
    }

    pub(crate) fn txn_rollback_if_pending(&self, serial: TxnSerial) {
        let pending = {
            let state = self.lock_state();
            state.pending.contains_key(&serial)
        };
        if pending && let Err(err) = self.txn_rollback(serial) {
            tracing::warn!(serial, %err, "implicit rollback failed");
        }
    }

    pub(crate) fn txn_status(&self, serial: TxnSerial) -> TxnStatus {
        let state = self.lock_state();
        if let Some(record) = state.pending.get(&serial) {
            return record.status;
        }
        if state
            .locally_committed
            .values()
            .any(|txn| txn.serial == serial)
        {
            return TxnStatus::CommittedLocal;
        }
        TxnStatus::CommittedGlobal
    }

    pub(crate) fn txn_client_timestamp(&self, serial: TxnSerial) -> Option<Timestamp> {
        let state = self.lock_state();
        state
            .pending
            .get(&serial)
            .and_then(|record| record.mapping.as_ref().map(|m| m.client().clone()))
    }

    // ----- notifications ---------------------------------------------------

    pub(crate) fn handle_notification(self: &Arc<Self>, batch: BatchUpdatesNotification) {
        let mut state = self.lock_state();
        if state.stop.requested {
            tracing::debug!("notification received after stop, ignoring");
            return;
        }
        tracing::debug!(
            version = %batch.new_version,
            objects = batch.updates.len(),
            "received update notification"
        );

        for entry in &batch.updates {
            self.apply_object_updates(&mut state, &entry.id, &entry.groups);
        }

        let (new_committed, new_durable) = if batch.is_disaster_safe {
            (None, Some(&batch.new_version))
        } else {
            (Some(&batch.new_version), None)
        };
        let next = self.update_committed_versions(&mut state, new_committed, new_durable);
        if self.config.cache_update_protocol.is_notifications() {
            state.cache.augment_all_with_store_clock(&batch.new_version);
            self.set_next_available_snapshot(&mut state, next);
        }

        let ids: Vec<CrdtId> = batch.ids().cloned().collect();
        self.try_prune(&mut state, &ids);
        self.drain_evictions(&mut state);
    }

    fn apply_object_updates(
        self: &Arc<Self>,
        state: &mut ScoutState,
        id: &CrdtId,
        groups: &[OpsGroup],
    ) {
        if state.cache.get_without_touch(id).is_none() {
            // Evicted since subscribing.
            if state.subscriptions.has_listeners(id) {
                if !groups.is_empty() {
                    tracing::debug!(object = %id, "evicted object has a waiting listener, re-fetching");
                    self.async_fetch_and_subscribe(id.clone());
                }
            } else {
                state.subscriptions.remove_object(id);
            }
            return;
        }

        let mut new_mappings = Vec::new();
        if let Some(crdt) = state.cache.get_without_touch_mut(id) {
            for group in groups {
                let origin = group.client_timestamp().source.clone();
                match crdt.execute(group, DependencyPolicy::Ignore) {
                    Ok(new_update) => {
                        if origin != self.scout_id {
                            crdt.discard_scout_clock(&origin);
                        }
                        if new_update {
                            new_mappings.push(group.mapping.clone());
                        } else {
                            tracing::debug!(
                                update = %group.client_timestamp(),
                                object = %id,
                                "update already included in object state"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(object = %id, %err, "could not apply pushed update");
                    }
                }
            }
        }
        if new_mappings.is_empty() {
            return;
        }
        for session in state.subscriptions.sessions_with_listeners(id) {
            self.try_notify_mappings(state, id, &session, &new_mappings);
        }
    }

    /// Fire or defer a session's listener for the given update mappings.
    fn try_notify_mappings(
        &self,
        state: &mut ScoutState,
        id: &CrdtId,
        session: &str,
        mappings: &[TimestampMapping],
    ) {
        if state.stop.requested {
            return;
        }
        let Some(subscription) = state.subscriptions.listener(id, session) else {
            return;
        };
        let read_version = subscription.read_version.clone();

        let mut deferred: Vec<&TimestampMapping> = Vec::new();
        for mapping in mappings {
            if mapping.any_timestamp_included(&read_version) {
                continue;
            }
            let visible = mapping.any_timestamp_included(&self.next_txn_snapshot(state))
                || mapping.any_timestamp_included(&state.last_locally_committed);
            if visible {
                if let Some(subscription) = state.subscriptions.take_listener(id, session) {
                    self.executor.execute(listener_task(subscription, id.clone()));
                }
                return;
            }
            deferred.push(mapping);
        }
        for mapping in deferred {
            tracing::debug!(
                object = %id,
                update = %mapping.client(),
                "update visible but not committed, delaying notification"
            );
            state.pending_notifications.add(mapping, id);
        }
    }

    pub(crate) fn async_fetch_and_subscribe(self: &Arc<Self>, id: CrdtId) {
        if self.is_stopping() {
            return;
        }
        let inner = Arc::clone(self);
        self.executor.execute(Box::new(move || {
            if inner.is_stopping() {
                return;
            }
            let requested = {
                let state = inner.lock_state();
                if !state.subscriptions.is_subscribed(&id) {
                    return;
                }
                let mut requested = inner.next_read_lower_bound(&state);
                requested.merge(&state.last_locally_committed);
                requested
            };
            let params = FetchParams {
                id: id.clone(),
                serial: None,
                create: false,
                requested_version: requested,
                send_more_recent_updates: true,
                subscribe_updates: true,
                touch: false,
            };
            if let Err(err) = inner.fetches.fetch(&inner, params) {
                tracing::warn!(
                    object = %id,
                    %err,
                    "could not fetch the latest object version for notification purposes"
                );
            }
        }));
    }

    // ----- fetch installation ----------------------------------------------

    pub(crate) fn install_fetch_reply(
        &self,
        params: &FetchParams,
        status: FetchStatus,
        object: Option<ManagedCrdt>,
        requested: &VersionClock,
        requested_scout_ts: Option<&Timestamp>,
        estimated_committed: Option<&VersionClock>,
        estimated_disaster_durable: Option<&VersionClock>,
    ) -> InstallOutcome {
        let mut state = self.lock_state();
        let outcome = self.install_reply_locked(
            &mut state,
            params,
            status,
            object,
            requested,
            requested_scout_ts,
            estimated_committed,
            estimated_disaster_durable,
        );
        self.drain_evictions(&mut state);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn install_reply_locked(
        &self,
        state: &mut ScoutState,
        params: &FetchParams,
        status: FetchStatus,
        object: Option<ManagedCrdt>,
        requested: &VersionClock,
        requested_scout_ts: Option<&Timestamp>,
        estimated_committed: Option<&VersionClock>,
        estimated_disaster_durable: Option<&VersionClock>,
    ) -> InstallOutcome {
        let incoming = match status {
            FetchStatus::ObjectNotFound => {
                if !params.create {
                    return InstallOutcome::Failed(FetchFailure::NoSuchObject);
                }
                // Instantiate an empty object whose clock covers everything
                // the store told us about, plus this scout's own prefix.
                let mut clock = requested.clone();
                if let Some(estimate) = estimated_disaster_durable {
                    clock.merge(estimate);
                }
                if let Some(estimate) = estimated_committed {
                    clock.merge(estimate);
                }
                if let Some(ts) = requested_scout_ts {
                    clock.record_all_until(ts);
                }
                if let Some(serial) = params.serial
                    && let Some(record) = state.pending.get_mut(&serial)
                {
                    record.created.insert(params.id.clone());
                }
                Some(ManagedCrdt::new(
                    params.id.clone(),
                    CrdtValue::new(params.id.kind()),
                    clock,
                    false,
                ))
            }
            FetchStatus::UpToDate => None,
            FetchStatus::Ok | FetchStatus::VersionMissing | FetchStatus::VersionPruned => {
                match object {
                    Some(object) => Some(object),
                    None => {
                        return InstallOutcome::Failed(FetchFailure::Network(
                            "fetch reply carries no object state".into(),
                        ));
                    }
                }
            }
        };

        if let Some(incoming) = &incoming
            && incoming.kind() != params.id.kind()
        {
            return InstallOutcome::Failed(FetchFailure::WrongType);
        }

        self.update_committed_versions(state, estimated_committed, estimated_disaster_durable);

        let cached = if params.touch {
            state.cache.get_and_touch(&params.id).is_some()
        } else {
            state.cache.get_without_touch(&params.id).is_some()
        };

        match (cached, incoming) {
            (false, Some(incoming)) => {
                state.cache.add(incoming, params.serial);
                // Re-apply queued local transactions the received version may
                // not include yet.
                let queued: Vec<CommittedTxn> = state
                    .globally_committed_unstable
                    .iter()
                    .cloned()
                    .chain(state.locally_committed.values().cloned())
                    .collect();
                if let Some(crdt) = state.cache.get_without_touch_mut(&params.id) {
                    for txn in &queued {
                        apply_local_updates(crdt, txn);
                    }
                }
            }
            (false, None) => {
                tracing::warn!(object = %params.id, "object evicted from the cache during fetch");
                return InstallOutcome::Retry;
            }
            (true, Some(incoming)) => {
                let crdt = state
                    .cache
                    .get_without_touch_mut(&params.id)
                    .expect("cached entry present");
                if let Err(err) = crdt.merge(&incoming) {
                    tracing::warn!(
                        object = %params.id,
                        %err,
                        "merging fetched version into cache failed, dropping cached version"
                    );
                    state.cache.remove(&params.id);
                    state.cache.add(incoming, params.serial);
                }
            }
            (true, None) => {
                let crdt = state
                    .cache
                    .get_without_touch_mut(&params.id)
                    .expect("cached entry present");
                crdt.augment_with_store_clock(requested);
            }
        }

        // Anybody waiting on fresher versions of this object?
        for session in state.subscriptions.sessions_with_listeners(&params.id) {
            let mappings = {
                let Some(subscription) = state.subscriptions.listener(&params.id, &session) else {
                    continue;
                };
                let read_version = subscription.read_version.clone();
                match state
                    .cache
                    .get_without_touch(&params.id)
                    .map(|crdt| crdt.updates_since(&read_version))
                {
                    Some(Ok(mappings)) => mappings,
                    _ => continue,
                }
            };
            self.try_notify_mappings(state, &params.id, &session, &mappings);
        }

        let ids = [params.id.clone()];
        self.try_prune(state, &ids);

        match status {
            FetchStatus::VersionPruned => {
                tracing::warn!(
                    object = %params.id,
                    requested = %requested,
                    "requested version pruned at the store"
                );
                InstallOutcome::Failed(FetchFailure::VersionNotFound(
                    "requested version pruned at the store".into(),
                ))
            }
            FetchStatus::VersionMissing => {
                tracing::warn!(
                    object = %params.id,
                    requested = %requested,
                    "requested version not yet replicated at the store"
                );
                InstallOutcome::Retry
            }
            _ => InstallOutcome::Done,
        }
    }

    // ----- cache refresh ---------------------------------------------------

    /// Periodic-refresh protocol: fetch every cached object at the freshest
    /// known version and advance the snapshot baseline once no transaction
    /// is open.
    pub(crate) fn refresh_cache(self: &Arc<Self>) {
        let needs_estimate = {
            let state = self.lock_state();
            let mut candidate = self.global_committed(&state).clone();
            candidate.merge(&state.last_locally_committed);
            candidate.drop_source(&self.scout_id);
            candidate.compare(&self.next_txn_snapshot(&state)) == ClockOrd::Equal
        };
        if needs_estimate {
            let _ = self.force_clock_estimate();
        }

        let (version, requested_scout_ts, known_lower_bound, ids) = {
            let mut state = self.lock_state();
            let mut version = self.global_committed(&state).clone();
            version.merge(&state.last_locally_committed);
            let requested_scout_ts = version.latest(&self.scout_id);
            version.drop_source(&self.scout_id);

            let ids = state.cache.ids();
            let mut known_lower_bound: Option<VersionClock> = None;
            for id in &ids {
                if let Some(crdt) = state.cache.get_without_touch(id) {
                    match &mut known_lower_bound {
                        Some(bound) => bound.intersect(crdt.clock()),
                        None => known_lower_bound = Some(crdt.clock().clone()),
                    }
                }
            }
            if let Some(bound) = &mut known_lower_bound {
                bound.trim();
            }
            state.fetch_versions_in_progress.push(version.clone());
            (version, requested_scout_ts, known_lower_bound, ids)
        };

        if ids.is_empty() {
            self.unregister_fetch_version(&version);
            tracing::debug!("cache empty, periodic refresh not needed");
            return;
        }
        tracing::debug!(objects = ids.len(), version = %version, "refreshing cache");

        let request = BatchFetchObjectVersionRequest {
            scout_id: self.scout_id.clone(),
            disaster_safe: self.config.disaster_safe,
            known_version: known_lower_bound,
            requested_version: version.clone(),
            send_more_recent_updates: false,
            subscribe_updates: false,
            light_mode: false,
            ids: ids.clone(),
        };
        let deadline = Duration::from_millis(self.config.deadline_millis);
        let reply = match self.surrogate.fetch_object_versions(request, deadline) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(%err, "refreshing cached objects timed out");
                self.unregister_fetch_version(&version);
                return;
            }
        };

        let mut state = self.lock_state();
        // Barrier: wait until no transaction executes, so installing the
        // refreshed versions cannot shift a live snapshot.
        state.cache_refresh_ready = true;
        self.wakeup.notify_all();
        while !state.pending.is_empty() && !state.stop.requested {
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.stop.requested {
            state.cache_refresh_ready = false;
            drop(state);
            self.unregister_fetch_version(&version);
            self.wakeup.notify_all();
            return;
        }

        for (index, id) in ids.iter().enumerate() {
            let Some(status) = reply.statuses.get(index).copied() else {
                break;
            };
            let object = reply.objects.get(index).cloned().flatten();
            let params = FetchParams {
                id: id.clone(),
                serial: None,
                create: false,
                requested_version: version.clone(),
                send_more_recent_updates: false,
                subscribe_updates: false,
                touch: false,
            };
            if let InstallOutcome::Failed(failure) = self.install_reply_locked(
                &mut state,
                &params,
                status,
                object,
                &version,
                requested_scout_ts.as_ref(),
                reply.estimated_committed_version.as_ref(),
                reply.estimated_disaster_durable_version.as_ref(),
            ) {
                tracing::warn!(object = %id, ?failure, "could not refresh cached object");
            }
        }
        self.set_next_available_snapshot(&mut state, version.clone());
        state.cache_refresh_ready = false;
        if let Some(pos) = state
            .fetch_versions_in_progress
            .iter()
            .position(|clock| *clock == version)
        {
            state.fetch_versions_in_progress.swap_remove(pos);
        }
        self.drain_evictions(&mut state);
        self.wakeup.notify_all();
    }

    fn unregister_fetch_version(&self, version: &VersionClock) {
        let mut state = self.lock_state();
        if let Some(pos) = state
            .fetch_versions_in_progress
            .iter()
            .position(|clock| clock == version)
        {
            state.fetch_versions_in_progress.swap_remove(pos);
        }
    }

    /// Non-graceful stop from a worker that hit an unrecoverable error.
    pub(crate) fn stop_fatal(&self, reason: &str) {
        tracing::error!(reason, "stopping scout after fatal error");
        let mut state = self.lock_state();
        state.stop = StopState {
            requested: true,
            graceful: false,
        };
        self.stopped.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }
}

/// Bring a cached object up to date with one queued local transaction.
/// Returns true when new operations were applied.
pub(crate) fn apply_local_updates(crdt: &mut ManagedCrdt, txn: &CommittedTxn) -> bool {
    if let Some(group) = txn.ops.get(crdt.id()) {
        matches!(crdt.execute(group, DependencyPolicy::Ignore), Ok(true))
    } else {
        // No updates for this object: advance clocks only.
        crdt.augment_with_scout_timestamp(txn.mapping.client());
        let mut system = VersionClock::new();
        for ts in txn.mapping.system_timestamps() {
            system.record(ts);
        }
        crdt.augment_with_store_clock(&system);
        false
    }
}

/// The scout: owns the cache, the clock bookkeeping, and the background
/// workers; serves sessions until stopped.
pub struct Scout {
    pub(crate) inner: Arc<ScoutInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scout {
    /// Connect to the configured surrogate endpoints and start the scout.
    pub fn connect(config: ScoutConfig) -> Result<Scout, ScoutError> {
        let (notifications_tx, notifications_rx) = notification_channel();
        let client = crate::proto::endpoint::FramedClient::connect(
            &config.server_hostnames,
            Duration::from_millis(config.deadline_millis),
            DEFAULT_MAX_FRAME_BYTES,
            notifications_tx,
        )?;
        Ok(Self::open(config, Arc::new(client), notifications_rx))
    }

    /// Start a scout over an already-built surrogate endpoint. The receiver
    /// carries server-initiated update notifications.
    pub fn open(
        config: ScoutConfig,
        surrogate: Arc<dyn Surrogate>,
        notifications: NotificationReceiver,
    ) -> Scout {
        let scout_id = SourceId::generate();
        tracing::info!(scout = %scout_id, "starting scout");

        // Replay, then reopen for appending.
        let mut replayed = Vec::new();
        let log: Box<dyn CommitLog> = match &config.log_filename {
            Some(path) => {
                match DiskLog::replay(path) {
                    Ok(txns) => replayed = txns,
                    Err(err) => tracing::warn!(%err, "could not replay commit log"),
                }
                match DiskLog::open(path, config.log_flush_on_commit) {
                    Ok(log) => Box::new(log),
                    Err(err) => {
                        tracing::warn!(%err, "could not open commit log, proceeding without one");
                        Box::new(NoopLog)
                    }
                }
            }
            None => Box::new(NoopLog),
        };

        let evicted = Arc::new(Mutex::new(Vec::new()));
        let mut cache = ObjectCache::new(
            config.cache_size,
            Duration::from_millis(config.cache_eviction_time_millis),
        );
        {
            let evicted = Arc::clone(&evicted);
            cache.set_eviction_listener(move |id: &CrdtId| {
                let mut evicted = evicted
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                evicted.push(id.clone());
            });
        }

        let state = ScoutState {
            stop: StopState::default(),
            committed_version: VersionClock::new(),
            committed_disaster_durable: VersionClock::new(),
            last_locally_committed: VersionClock::new(),
            next_available_snapshot: VersionClock::new(),
            timestamps: TimestampSource::new(scout_id.clone()),
            next_serial: 0,
            cache,
            pending: BTreeMap::new(),
            locally_committed: BTreeMap::new(),
            globally_committed_unstable: VecDeque::new(),
            fetch_versions_in_progress: Vec::new(),
            subscriptions: SubscriptionRegistry::default(),
            pending_notifications: PendingNotifications::default(),
            cache_refresh_ready: false,
            log,
        };

        let inner = Arc::new(ScoutInner {
            scout_id,
            config,
            surrogate,
            state: Mutex::new(state),
            wakeup: Condvar::new(),
            executor: ListenerExecutor::new(EXECUTOR_THREADS),
            fetches: FetchPipeline::default(),
            stopped: AtomicBool::new(false),
            evicted,
        });

        // Re-enqueue commits that never reached the store before the last
        // shutdown.
        if !replayed.is_empty() {
            tracing::info!(count = replayed.len(), "replaying logged local commits");
            let mut state = inner.lock_state();
            for logged in replayed {
                let client = logged.client_timestamp.clone();
                state.timestamps.advance_past(&client);
                state.last_locally_committed.record(&client);
                state.last_locally_committed.merge(&logged.dependency);
                let ops = logged
                    .groups
                    .into_iter()
                    .map(|group| (group.target.clone(), group))
                    .collect();
                state.locally_committed.insert(
                    client.clone(),
                    CommittedTxn {
                        serial: 0,
                        mapping: TimestampMapping::new(client),
                        dependency: logged.dependency,
                        ops,
                    },
                );
            }
        }

        // Initial committed-clock estimate.
        if let Some(next) = inner.force_clock_estimate() {
            let mut state = inner.lock_state();
            inner.set_next_available_snapshot(&mut state, next);
        } else {
            tracing::warn!("could not obtain the initial snapshot clock");
        }

        let mut workers = Vec::new();
        {
            let inner = Arc::clone(&inner);
            workers.push(
                std::thread::Builder::new()
                    .name("scout-committer".into())
                    .spawn(move || run_committer(inner))
                    .expect("spawn committer thread"),
            );
        }
        {
            let inner = Arc::clone(&inner);
            workers.push(
                std::thread::Builder::new()
                    .name("scout-notifier".into())
                    .spawn(move || run_notifier(inner, notifications))
                    .expect("spawn notifier thread"),
            );
        }
        if inner.config.cache_update_protocol.is_periodic_refresh() {
            let inner = Arc::clone(&inner);
            workers.push(
                std::thread::Builder::new()
                    .name("scout-refresh".into())
                    .spawn(move || run_refresh(inner))
                    .expect("spawn refresh thread"),
            );
        }

        Scout {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn scout_id(&self) -> &SourceId {
        &self.inner.scout_id
    }

    pub fn new_session(&self, session_id: impl Into<String>) -> ScoutSession {
        ScoutSession::new(Arc::clone(&self.inner), session_id.into())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.lock_state().cache.stats()
    }

    /// Clock window of a cached object: (object clock, prune clock).
    /// Observability helper; `None` when the object is not cached.
    pub fn object_clocks(&self, id: &CrdtId) -> Option<(VersionClock, VersionClock)> {
        let state = self.inner.lock_state();
        state
            .cache
            .get_without_touch(id)
            .map(|crdt| (crdt.clock().clone(), crdt.prune_clock().clone()))
    }

    /// Stop the scout. A graceful stop drains the locally committed queue
    /// before the committer exits; otherwise queued transactions are
    /// abandoned and blocked callers fail with a network error.
    pub fn stop(&self, graceful: bool) {
        {
            let mut state = self.inner.lock_state();
            if state.stop.requested {
                tracing::warn!("scout is already stopped");
                return;
            }
            if !state.pending.is_empty() {
                tracing::warn!(
                    pending = state.pending.len(),
                    "stopping while transactions are pending"
                );
            }
            state.stop = StopState {
                requested: true,
                graceful,
            };
            self.inner.stopped.store(true, Ordering::SeqCst);
            self.inner.wakeup.notify_all();
        }

        let workers: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            workers.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.join();
        }
        self.inner.executor.shutdown();

        let mut state = self.inner.lock_state();
        for id in state.subscriptions.subscribed_ids() {
            state.subscriptions.remove_object(&id);
        }
        if let Err(err) = state.log.close() {
            tracing::warn!(%err, "could not close the durable commit log");
        }
        let stats = state.cache.stats();
        tracing::info!(
            hits = stats.hits,
            misses_no_object = stats.misses_no_object,
            misses_wrong_version = stats.misses_wrong_version,
            evictions = stats.evictions,
            "scout stopped"
        );
    }
}

fn run_notifier(inner: Arc<ScoutInner>, notifications: NotificationReceiver) {
    loop {
        if inner.is_stopping() {
            return;
        }
        match notifications.recv_timeout(STOP_POLL_INTERVAL) {
            Ok(batch) => inner.handle_notification(batch),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn run_refresh(inner: Arc<ScoutInner>) {
    let period = Duration::from_millis(inner.config.cache_refresh_period_millis.max(1));
    // Vary the initial offset across scouts to avoid synchronized refresh
    // bursts against the same surrogate.
    let offset = period.mul_f64(rand::random::<f64>());
    if sleep_unless_stopping(&inner, offset) {
        return;
    }
    loop {
        inner.refresh_cache();
        if sleep_unless_stopping(&inner, period) {
            return;
        }
    }
}

/// Sleep in short slices; returns true when the scout is stopping.
pub(crate) fn sleep_unless_stopping(inner: &ScoutInner, total: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < total {
        if inner.is_stopping() {
            return true;
        }
        std::thread::sleep(STOP_POLL_INTERVAL.min(total));
    }
    inner.is_stopping()
}
