//! Committer worker: serialises locally committed transactions to the store.
//!
//! Single thread. Takes the earliest locally committed transactions in
//! client-timestamp order, ships them as one batch, and splices the
//! store-assigned system timestamps back into the transactions' mappings and
//! the cached objects' clocks. Commits are stubborn: a timed-out batch is
//! retried until it succeeds or the scout stops, because a locally committed
//! transaction must never be silently dropped.

use std::sync::Arc;
use std::time::Duration;

use crate::core::{Timestamp, VersionClock};
use crate::proto::messages::{
    BatchCommitUpdatesRequest, CommitStatus, CommitUpdatesRequest,
};

use super::core::{ScoutInner, ScoutState, apply_local_updates, sleep_unless_stopping};

/// Replace every transaction's dependency clock in a batch with the last
/// transaction's clock plus the scout's own prior timestamps. A legal
/// over-approximation that shrinks commit metadata.
const SHARE_DEPENDENCIES_IN_BATCH: bool = true;

const COMMIT_RETRY_BACKOFF_START: Duration = Duration::from_millis(100);
const COMMIT_RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);
const DEFAULT_K_STABILITY: u32 = 1;

pub(crate) fn run_committer(inner: Arc<ScoutInner>) {
    loop {
        let Some(batch) = consume_queue(&inner) else {
            tracing::debug!("committer exiting");
            return;
        };
        if !commit_batch(&inner, &batch) {
            return;
        }
    }
}

/// Block until a batch of transactions is ready, or `None` when the scout is
/// stopping (after draining the queue when the stop is graceful).
fn consume_queue(inner: &Arc<ScoutInner>) -> Option<Vec<Timestamp>> {
    let mut state = inner.lock_state();
    loop {
        let batch = gather_batch(inner, &state);
        if !batch.is_empty() {
            if state.stop.requested && !state.stop.graceful {
                tracing::warn!(
                    queued = state.locally_committed.len(),
                    "ungraceful stop, queued transactions will not commit globally"
                );
                return None;
            }
            return Some(batch);
        }
        if state.stop.requested {
            return None;
        }
        state = inner
            .wakeup
            .wait(state)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

/// Earliest transactions eligible for global commit, bounded by the batch
/// size. Under concurrent-open, nothing is eligible while an open update
/// transaction holds a smaller client counter: timestamp order is commit
/// order.
fn gather_batch(inner: &Arc<ScoutInner>, state: &ScoutState) -> Vec<Timestamp> {
    let Some(first) = state.locally_committed.keys().next() else {
        return Vec::new();
    };
    if inner.config.concurrent_open_transactions {
        let blocked = state.pending.values().any(|record| {
            !record.read_only
                && record
                    .mapping
                    .as_ref()
                    .is_some_and(|mapping| mapping.client().counter < first.counter)
        });
        if blocked {
            return Vec::new();
        }
    }
    state
        .locally_committed
        .keys()
        .take(inner.config.max_commit_batch_size.max(1))
        .cloned()
        .collect()
}

/// Commit one batch. Returns false when the committer must exit.
fn commit_batch(inner: &Arc<ScoutInner>, batch: &[Timestamp]) -> bool {
    let request = {
        let state = inner.lock_state();
        build_request(inner, &state, batch)
    };
    tracing::debug!(transactions = request.requests.len(), "committing batch");

    // Stubborn send: the store must eventually see every local commit.
    let deadline = Duration::from_millis(inner.config.deadline_millis);
    let mut backoff = COMMIT_RETRY_BACKOFF_START;
    let reply = loop {
        match inner.surrogate.commit_updates(request.clone(), deadline) {
            Ok(reply) => break reply,
            Err(err) => {
                if stopping_ungracefully(inner) {
                    return false;
                }
                tracing::warn!(%err, "commit request failed, retrying");
                if sleep_unless_stopping(inner, backoff) && stopping_ungracefully(inner) {
                    return false;
                }
                backoff = (backoff * 2).min(COMMIT_RETRY_BACKOFF_CAP);
            }
        }
    };

    if reply.replies.len() != request.requests.len() {
        inner.stop_fatal("store returned a mismatched number of commit replies");
        return false;
    }

    let mut state = inner.lock_state();
    for (client, outcome) in batch.iter().zip(reply.replies) {
        let Some(txn) = state.locally_committed.get_mut(client) else {
            continue;
        };
        let serial = txn.serial;

        match outcome.status {
            CommitStatus::CommittedWithKnownTimestamps => {
                for ts in &outcome.system_timestamps {
                    txn.mapping.add_system_timestamp(ts.clone());
                }
                for group in txn.ops.values_mut() {
                    for ts in &outcome.system_timestamps {
                        group.mapping.add_system_timestamp(ts.clone());
                    }
                }
                let mut system_clock = VersionClock::new();
                for ts in &outcome.system_timestamps {
                    system_clock.record(ts);
                }

                let txn = state
                    .locally_committed
                    .get(client)
                    .cloned()
                    .expect("present above");
                let updated: Vec<_> = txn.ops.keys().cloned().collect();
                for id in &updated {
                    if let Some(crdt) = state.cache.get_without_touch_mut(id) {
                        crdt.add_system_timestamps(client, &outcome.system_timestamps);
                        apply_local_updates(crdt, &txn);
                    }
                }
                state.cache.augment_all_with_store_clock(&system_clock);
                inner.update_committed_versions(&mut state, Some(&system_clock), None);
                inner.try_prune(&mut state, &updated);
            }
            CommitStatus::CommittedWithKnownClockRange => {
                if let Some(imprecise) = &outcome.imprecise_commit_clock {
                    inner.update_committed_versions(&mut state, Some(imprecise), None);
                }
            }
            CommitStatus::InvalidOperation => {
                drop(state);
                inner.stop_fatal("store rejected a commit request as invalid");
                return false;
            }
        }

        state.cache.remove_protection(serial);
        let txn = state
            .locally_committed
            .remove(client)
            .expect("present above");
        tracing::info!(client = %client, "transaction committed globally");

        // Subscriptions on objects this transaction created can only be
        // placed at the store now that the objects exist there.
        for (id, group) in &txn.ops {
            if group.creates && state.subscriptions.is_subscribed(id) {
                inner.async_fetch_and_subscribe(id.clone());
            }
        }
        state.globally_committed_unstable.push_back(txn);
        inner.wakeup.notify_all();
    }
    true
}

fn stopping_ungracefully(inner: &ScoutInner) -> bool {
    if !inner.is_stopping() {
        return false;
    }
    let state = inner.lock_state();
    !state.stop.graceful
}

fn build_request(
    inner: &Arc<ScoutInner>,
    state: &ScoutState,
    batch: &[Timestamp],
) -> BatchCommitUpdatesRequest {
    let shared_dependency = if SHARE_DEPENDENCIES_IN_BATCH {
        let last = batch
            .last()
            .and_then(|client| state.locally_committed.get(client));
        last.map(|txn| {
            let mut shared = txn.dependency.clone();
            if let Some(first) = batch.first()
                && first.counter > 1
            {
                shared.record_all_until(&Timestamp::new(
                    inner.scout_id.clone(),
                    first.counter - 1,
                ));
            }
            shared
        })
    } else {
        None
    };

    let mut requests = Vec::with_capacity(batch.len());
    for client in batch {
        let Some(txn) = state.locally_committed.get(client) else {
            continue;
        };
        let dependency = shared_dependency
            .clone()
            .unwrap_or_else(|| txn.dependency.clone());
        let ops_groups = txn
            .ops
            .values()
            .map(|group| group.with_dependency(dependency.clone()))
            .collect();
        requests.push(CommitUpdatesRequest {
            client_timestamp: client.clone(),
            dependency_clock: dependency,
            ops_groups,
            k_stability: DEFAULT_K_STABILITY,
        });
    }
    BatchCommitUpdatesRequest {
        scout_id: inner.scout_id.clone(),
        disaster_safe: inner.config.disaster_safe,
        requests,
    }
}
