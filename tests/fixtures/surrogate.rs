//! In-process scripted surrogate for driving the scout end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use scout_rs::core::DependencyPolicy;
use scout_rs::{
    BatchCommitUpdatesReply, BatchCommitUpdatesRequest, BatchFetchObjectVersionReply,
    BatchFetchObjectVersionRequest, CommitStatus, CommitUpdatesReply, CrdtId, CrdtValue,
    FetchStatus, LatestKnownClockReply, LatestKnownClockRequest, ManagedCrdt, RpcError, SourceId,
    Surrogate, Timestamp, VersionClock,
};

struct StoreState {
    dc: SourceId,
    next_counter: u64,
    committed: VersionClock,
    objects: HashMap<CrdtId, ManagedCrdt>,
    commit_order: Vec<Timestamp>,
}

/// A single data center that commits everything it is sent, in arrival
/// order, assigning one system timestamp per transaction. Failure modes are
/// scripted through flags.
pub struct FakeSurrogate {
    state: Mutex<StoreState>,
    unreachable: AtomicBool,
    /// Serve this many VERSION_MISSING replies before answering normally.
    missing_replies: AtomicU32,
    /// Serve this many VERSION_PRUNED replies before answering normally.
    pruned_replies: AtomicU32,
    fetch_count: AtomicUsize,
    fetch_gate: (Mutex<bool>, Condvar),
}

impl FakeSurrogate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                dc: SourceId::parse("dc0").unwrap(),
                next_counter: 0,
                committed: VersionClock::new(),
                objects: HashMap::new(),
                commit_order: Vec::new(),
            }),
            unreachable: AtomicBool::new(false),
            missing_replies: AtomicU32::new(0),
            pruned_replies: AtomicU32::new(0),
            fetch_count: AtomicUsize::new(0),
            fetch_gate: (Mutex::new(false), Condvar::new()),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn serve_missing(&self, replies: u32) {
        self.missing_replies.store(replies, Ordering::SeqCst);
    }

    pub fn serve_pruned(&self, replies: u32) {
        self.pruned_replies.store(replies, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Make fetches hang until [`release_fetches`] is called.
    pub fn block_fetches(&self) {
        *self.fetch_gate.0.lock().unwrap() = true;
    }

    pub fn release_fetches(&self) {
        *self.fetch_gate.0.lock().unwrap() = false;
        self.fetch_gate.1.notify_all();
    }

    pub fn committed_clock(&self) -> VersionClock {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn commit_order(&self) -> Vec<Timestamp> {
        self.state.lock().unwrap().commit_order.clone()
    }

    pub fn has_object(&self, id: &CrdtId) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    /// Latest counter value of a stored counter object.
    pub fn counter_value(&self, id: &CrdtId) -> Option<i64> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(id)?;
        object
            .get_version(object.clock())
            .ok()
            .and_then(|value| value.counter_value())
    }

    fn check_reachable(&self) -> Result<(), RpcError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout);
        }
        Ok(())
    }

    fn wait_gate(&self) {
        let mut blocked = self.fetch_gate.0.lock().unwrap();
        while *blocked {
            blocked = self.fetch_gate.1.wait(blocked).unwrap();
        }
    }
}

impl Surrogate for FakeSurrogate {
    fn latest_known_clock(
        &self,
        _request: LatestKnownClockRequest,
        _deadline: Duration,
    ) -> Result<LatestKnownClockReply, RpcError> {
        self.check_reachable()?;
        let committed = self.committed_clock();
        Ok(LatestKnownClockReply {
            clock: committed.clone(),
            disaster_durable_clock: committed,
        })
    }

    fn fetch_object_versions(
        &self,
        request: BatchFetchObjectVersionRequest,
        _deadline: Duration,
    ) -> Result<BatchFetchObjectVersionReply, RpcError> {
        self.check_reachable()?;
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.wait_gate();

        let state = self.state.lock().unwrap();
        let scripted_status = if self.missing_replies.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        ).is_ok()
        {
            Some(FetchStatus::VersionMissing)
        } else if self
            .pruned_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Some(FetchStatus::VersionPruned)
        } else {
            None
        };

        let mut statuses = Vec::new();
        let mut objects = Vec::new();
        for id in &request.ids {
            let existing = state.objects.get(id);
            match scripted_status {
                Some(status) => {
                    // Error replies still carry the store's current state.
                    let mut copy = existing.cloned().unwrap_or_else(|| {
                        ManagedCrdt::new(
                            id.clone(),
                            CrdtValue::new(id.kind()),
                            state.committed.clone(),
                            false,
                        )
                    });
                    copy.augment_with_store_clock(&state.committed);
                    statuses.push(status);
                    objects.push(Some(copy));
                }
                None => match existing {
                    Some(object) => {
                        let mut copy = object.clone();
                        // The store ships the object at least as fresh as its
                        // committed clock and the requested version.
                        copy.augment_with_store_clock(&state.committed);
                        copy.augment_with_store_clock(&request.requested_version);
                        statuses.push(FetchStatus::Ok);
                        objects.push(Some(copy));
                    }
                    None => {
                        statuses.push(FetchStatus::ObjectNotFound);
                        objects.push(None);
                    }
                },
            }
        }

        Ok(BatchFetchObjectVersionReply {
            statuses,
            objects,
            estimated_committed_version: Some(state.committed.clone()),
            estimated_disaster_durable_version: Some(state.committed.clone()),
        })
    }

    fn commit_updates(
        &self,
        request: BatchCommitUpdatesRequest,
        _deadline: Duration,
    ) -> Result<BatchCommitUpdatesReply, RpcError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        let mut replies = Vec::new();
        for commit in &request.requests {
            state.next_counter += 1;
            let system = Timestamp::new(state.dc.clone(), state.next_counter);
            state.commit_order.push(commit.client_timestamp.clone());

            for group in &commit.ops_groups {
                let mut group = group.clone();
                group.mapping.add_system_timestamp(system.clone());
                let object = state
                    .objects
                    .entry(group.target.clone())
                    .or_insert_with(|| {
                        ManagedCrdt::new(
                            group.target.clone(),
                            CrdtValue::new(group.target.kind()),
                            VersionClock::new(),
                            true,
                        )
                    });
                object
                    .execute(&group, DependencyPolicy::Ignore)
                    .expect("store applies committed group");
                object.mark_registered_in_store();
            }

            state.committed.record(&system);
            replies.push(CommitUpdatesReply {
                status: CommitStatus::CommittedWithKnownTimestamps,
                system_timestamps: vec![system],
                imprecise_commit_clock: None,
            });
        }
        Ok(BatchCommitUpdatesReply { replies })
    }
}
