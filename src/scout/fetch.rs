//! Fetch pipeline: single-flight object fetches with bounded retry.
//!
//! Distinct ids fetch concurrently, but per id exactly one physical request
//! races at a time; later callers for the same id wait for its outcome and
//! then retry the cache. VERSION_MISSING is retried with backoff until the
//! deadline; VERSION_PRUNED is not retried.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::{CrdtId, VersionClock};
use crate::proto::messages::BatchFetchObjectVersionRequest;

use super::cache::TxnSerial;
use super::core::{InstallOutcome, ScoutInner};
use super::handle::TxnError;

const RETRY_BACKOFF_START: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub(crate) enum FetchFailure {
    Network(String),
    NoSuchObject,
    WrongType,
    VersionNotFound(String),
}

impl FetchFailure {
    pub fn into_txn_error(self, id: &CrdtId) -> TxnError {
        match self {
            FetchFailure::Network(reason) => TxnError::Network { reason },
            FetchFailure::NoSuchObject => TxnError::NoSuchObject { id: id.clone() },
            FetchFailure::WrongType => TxnError::WrongType {
                id: id.clone(),
                requested: id.kind(),
            },
            FetchFailure::VersionNotFound(reason) => TxnError::VersionNotFound {
                id: id.clone(),
                reason,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FetchParams {
    pub id: CrdtId,
    pub serial: Option<TxnSerial>,
    pub create: bool,
    /// Full requested clock; the scout's own entry is recorded and dropped
    /// before the request leaves.
    pub requested_version: VersionClock,
    pub send_more_recent_updates: bool,
    pub subscribe_updates: bool,
    pub touch: bool,
}

#[derive(Default)]
struct FetchSlot {
    outcome: Mutex<Option<Result<(), FetchFailure>>>,
    done: Condvar,
}

impl FetchSlot {
    fn wait(&self) -> Result<(), FetchFailure> {
        let mut outcome = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while outcome.is_none() {
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        outcome.clone().expect("outcome present")
    }

    fn complete(&self, result: Result<(), FetchFailure>) {
        let mut outcome = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *outcome = Some(result);
        self.done.notify_all();
    }
}

#[derive(Default)]
pub(crate) struct FetchPipeline {
    in_flight: Mutex<HashMap<CrdtId, Arc<FetchSlot>>>,
}

impl FetchPipeline {
    /// Fetch an object, deduplicating against an in-flight request for the
    /// same id. On success the reply has been merged into the cache; the
    /// caller retries its cache read.
    pub fn fetch(&self, inner: &ScoutInner, params: FetchParams) -> Result<(), TxnError> {
        let id = params.id.clone();
        let (slot, leader) = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match in_flight.get(&id) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(FetchSlot::default());
                    in_flight.insert(id.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            return slot.wait().map_err(|failure| failure.into_txn_error(&id));
        }

        let result = self.run_fetch(inner, &params);
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            in_flight.remove(&id);
        }
        slot.complete(result.clone());
        result.map_err(|failure| failure.into_txn_error(&id))
    }

    fn run_fetch(&self, inner: &ScoutInner, params: &FetchParams) -> Result<(), FetchFailure> {
        let deadline = Duration::from_millis(inner.config.deadline_millis);
        let started = Instant::now();

        // Record and drop the scout's entry from the requested clock: the
        // store reasons about store-side causality only, and the scout
        // re-adds its own timestamps locally.
        let mut requested = params.requested_version.clone();
        let requested_scout_ts = requested.latest(&inner.scout_id);
        requested.drop_source(&inner.scout_id);

        let (subscribe, light_mode) = {
            let mut state = inner.lock_state();
            let subscribe = if params.subscribe_updates {
                state.subscriptions.ensure_subscribed(&params.id);
                true
            } else {
                state.subscriptions.is_subscribed(&params.id)
            };
            // Pruning must never cross a live fetch: the in-flight clock caps
            // the prune lower bound until the request settles.
            state.fetch_versions_in_progress.push(requested.clone());
            (subscribe, inner.config.cache_update_protocol.is_uncoordinated())
        };

        let request = BatchFetchObjectVersionRequest {
            scout_id: inner.scout_id.clone(),
            disaster_safe: inner.config.disaster_safe,
            known_version: None,
            requested_version: requested.clone(),
            send_more_recent_updates: params.send_more_recent_updates,
            subscribe_updates: subscribe,
            light_mode,
            ids: vec![params.id.clone()],
        };

        let result = self.request_until_deadline(
            inner,
            params,
            &request,
            &requested,
            requested_scout_ts.as_ref(),
            started,
            deadline,
        );

        {
            let mut state = inner.lock_state();
            if let Some(pos) = state
                .fetch_versions_in_progress
                .iter()
                .position(|clock| *clock == requested)
            {
                state.fetch_versions_in_progress.swap_remove(pos);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn request_until_deadline(
        &self,
        inner: &ScoutInner,
        params: &FetchParams,
        request: &BatchFetchObjectVersionRequest,
        requested: &VersionClock,
        requested_scout_ts: Option<&crate::core::Timestamp>,
        started: Instant,
        deadline: Duration,
    ) -> Result<(), FetchFailure> {
        let mut backoff = RETRY_BACKOFF_START;
        let mut attempt = 0u32;
        loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(FetchFailure::Network(
                    "deadline exceeded waiting for an appropriate fetch reply".into(),
                ));
            };
            if remaining.is_zero() {
                return Err(FetchFailure::Network(
                    "deadline exceeded waiting for an appropriate fetch reply".into(),
                ));
            }
            if attempt > 0 {
                tracing::warn!(object = %params.id, attempt, "retrying fetch");
            }

            let reply = inner
                .surrogate
                .fetch_object_versions(request.clone(), remaining)
                .map_err(|err| FetchFailure::Network(err.to_string()))?;
            if inner.is_stopping() {
                return Err(FetchFailure::Network(
                    "scout was shut down while fetching an object".into(),
                ));
            }

            let status = *reply
                .statuses
                .first()
                .ok_or_else(|| FetchFailure::Network("malformed fetch reply: no status".into()))?;
            let object = reply.objects.into_iter().next().flatten();

            match inner.install_fetch_reply(
                params,
                status,
                object,
                requested,
                requested_scout_ts,
                reply.estimated_committed_version.as_ref(),
                reply.estimated_disaster_durable_version.as_ref(),
            ) {
                InstallOutcome::Done => return Ok(()),
                InstallOutcome::Retry => {
                    std::thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    attempt += 1;
                }
                InstallOutcome::Failed(failure) => return Err(failure),
            }
        }
    }
}
