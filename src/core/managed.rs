//! Managed CRDT: a value plus the causal bookkeeping the scout needs.
//!
//! The object state is a checkpoint (everything folded up to the prune clock)
//! plus a log of update groups applied since. Snapshots replay the log
//! entries visible at the query clock over a copy of the checkpoint, so any
//! version between the prune clock and the object clock can be served.

use minicbor::{Decode, Encode};
use thiserror::Error;

use super::clock::{ClockOrd, VersionClock};
use super::id::{CrdtId, CrdtKind};
use super::op::{CrdtOp, OpsGroup};
use super::timestamp::{SourceId, Timestamp, TimestampMapping};
use super::value::{CrdtValue, KindMismatch};

/// How `execute` treats an update group's dependency clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyPolicy {
    /// Fail unless the object clock already covers the dependencies.
    Check,
    /// Apply without looking at dependencies (replay-tolerant paths:
    /// notifications may arrive out of causal order at the link level).
    Ignore,
    /// Fold the dependency clock into the object clock without evidence.
    RecordBlindly,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CrdtError {
    #[error(transparent)]
    KindMismatch(#[from] KindMismatch),
    #[error("object {id}: version {requested} outside available window {prune}..{clock}")]
    VersionNotAvailable {
        id: CrdtId,
        requested: String,
        prune: String,
        clock: String,
    },
    #[error("object {id}: dependencies of update {client} not satisfied")]
    DependenciesMissing { id: CrdtId, client: Timestamp },
    #[error("object {id}: prune clocks do not overlap, states cannot be aligned")]
    PruneClocksDisjoint { id: CrdtId },
    #[error("object {id}: updates below the prune clock are no longer enumerable")]
    UpdatesPruned { id: CrdtId },
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub(crate) struct LogEntry {
    #[n(0)]
    pub(crate) mapping: TimestampMapping,
    #[n(1)]
    pub(crate) ops: Vec<CrdtOp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ManagedCrdt {
    #[n(0)]
    id: CrdtId,
    #[n(1)]
    checkpoint: CrdtValue,
    #[n(2)]
    log: Vec<LogEntry>,
    #[n(3)]
    clock: VersionClock,
    #[n(4)]
    prune_clock: VersionClock,
    #[n(5)]
    registered_in_store: bool,
}

impl ManagedCrdt {
    /// Wrap a value whose state is already consistent with `clock` and that
    /// carries no individually addressable updates (fresh or empty objects).
    pub fn new(id: CrdtId, value: CrdtValue, clock: VersionClock, registered_in_store: bool) -> Self {
        Self {
            id,
            checkpoint: value,
            log: Vec::new(),
            clock,
            prune_clock: VersionClock::new(),
            registered_in_store,
        }
    }

    pub fn id(&self) -> &CrdtId {
        &self.id
    }

    pub fn kind(&self) -> CrdtKind {
        self.checkpoint.kind()
    }

    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }

    pub fn prune_clock(&self) -> &VersionClock {
        &self.prune_clock
    }

    pub fn is_registered_in_store(&self) -> bool {
        self.registered_in_store
    }

    pub fn mark_registered_in_store(&mut self) {
        self.registered_in_store = true;
    }

    /// Apply one update group. Returns true when the group was new, false if
    /// its timestamps were already incorporated (replays are idempotent).
    pub fn execute(
        &mut self,
        group: &OpsGroup,
        policy: DependencyPolicy,
    ) -> Result<bool, CrdtError> {
        if group.target.kind() != self.kind() {
            return Err(KindMismatch {
                op_kind: group.target.kind(),
                value_kind: self.kind(),
            }
            .into());
        }
        match policy {
            DependencyPolicy::Check => {
                if !self.clock.is_at_least(&group.dependency) {
                    return Err(CrdtError::DependenciesMissing {
                        id: self.id.clone(),
                        client: group.client_timestamp().clone(),
                    });
                }
            }
            DependencyPolicy::Ignore => {}
            DependencyPolicy::RecordBlindly => {
                self.clock.merge(&group.dependency);
            }
        }

        let already_known = group.mapping.any_timestamp_included(&self.clock);
        group.mapping.record_into(&mut self.clock);
        if already_known {
            // Fold any newly learned system timestamps into the matching
            // log entry so later snapshots and prunes see them.
            if let Some(entry) = self
                .log
                .iter_mut()
                .find(|entry| entry.mapping.client() == group.client_timestamp())
            {
                for ts in group.mapping.system_timestamps() {
                    entry.mapping.add_system_timestamp(ts.clone());
                }
            }
            return Ok(false);
        }

        self.log.push(LogEntry {
            mapping: group.mapping.clone(),
            ops: group.ops.clone(),
        });
        Ok(true)
    }

    /// Snapshot the object at `query`. Valid only between the prune clock and
    /// the object clock.
    pub fn get_version(&self, query: &VersionClock) -> Result<CrdtValue, CrdtError> {
        if !query.is_at_least(&self.prune_clock) || !self.clock.is_at_least(query) {
            return Err(self.version_unavailable(query));
        }
        let mut value = self.checkpoint.clone();
        for entry in &self.log {
            if entry.mapping.any_timestamp_included(query) {
                for op in &entry.ops {
                    value.apply(op)?;
                }
            }
        }
        Ok(value)
    }

    /// Collapse history up to `point` into the checkpoint. The object clock
    /// is left unchanged; the prune clock absorbs `point`.
    pub fn prune(&mut self, point: &VersionClock, check_versions: bool) -> Result<(), CrdtError> {
        let mut point = point.clone();
        if check_versions {
            if !self.clock.is_at_least(&point) {
                return Err(self.version_unavailable(&point));
            }
        } else {
            point.intersect(&self.clock);
        }

        let mut kept = Vec::with_capacity(self.log.len());
        for entry in self.log.drain(..) {
            if entry.mapping.any_timestamp_included(&point) {
                for op in &entry.ops {
                    self.checkpoint.apply(op)?;
                }
            } else {
                kept.push(entry);
            }
        }
        self.log = kept;
        self.prune_clock.merge(&point);
        Ok(())
    }

    /// Timestamp mappings of every update not yet covered by `since`.
    /// Fails when `since` reaches below the prune clock: those updates were
    /// folded away and can no longer be enumerated.
    pub fn updates_since(&self, since: &VersionClock) -> Result<Vec<TimestampMapping>, CrdtError> {
        if !since.is_at_least(&self.prune_clock) {
            return Err(CrdtError::UpdatesPruned {
                id: self.id.clone(),
            });
        }
        Ok(self
            .log
            .iter()
            .filter(|entry| !entry.mapping.any_timestamp_included(since))
            .map(|entry| entry.mapping.clone())
            .collect())
    }

    /// Advance the object clock from store-side knowledge without importing
    /// any operation evidence.
    pub fn augment_with_store_clock(&mut self, clock: &VersionClock) {
        self.clock.merge(clock);
    }

    /// Record a single scout timestamp into the object clock, clock-only.
    pub fn augment_with_scout_timestamp(&mut self, ts: &Timestamp) {
        self.clock.record(ts);
    }

    /// Splice store-assigned system timestamps into the log entry for
    /// `client` and record them in the object clock.
    pub fn add_system_timestamps(&mut self, client: &Timestamp, system: &[Timestamp]) {
        for ts in system {
            self.clock.record(ts);
        }
        if let Some(entry) = self
            .log
            .iter_mut()
            .find(|entry| entry.mapping.client() == client)
        {
            for ts in system {
                entry.mapping.add_system_timestamp(ts.clone());
            }
        }
    }

    /// Drop a foreign scout's entry from the object clock. Updates arriving
    /// via notifications record their origin scout's client timestamp, but
    /// only system timestamps matter across scouts.
    pub fn discard_scout_clock(&mut self, source: &SourceId) {
        self.clock.drop_source(source);
    }

    /// Merge a second copy of the same object (e.g. a fetched version into
    /// the cached one). Requires comparable prune clocks; concurrent prune
    /// points mean the checkpoints cannot be aligned and the caller must drop
    /// one copy and refetch.
    pub fn merge(&mut self, other: &ManagedCrdt) -> Result<(), CrdtError> {
        if other.kind() != self.kind() {
            return Err(KindMismatch {
                op_kind: other.kind(),
                value_kind: self.kind(),
            }
            .into());
        }
        match self.prune_clock.compare(&other.prune_clock) {
            ClockOrd::Concurrent => {
                return Err(CrdtError::PruneClocksDisjoint {
                    id: self.id.clone(),
                });
            }
            ClockOrd::Equal | ClockOrd::Dominates => {
                for entry in &other.log {
                    self.adopt_entry(entry);
                }
                self.clock.merge(&other.clock);
            }
            ClockOrd::Dominated => {
                // The other side pruned further: rebase onto its checkpoint
                // and re-add our entries it has not seen.
                let own_log = std::mem::take(&mut self.log);
                let own_clock = std::mem::replace(&mut self.clock, other.clock.clone());
                self.checkpoint = other.checkpoint.clone();
                self.prune_clock = other.prune_clock.clone();
                self.log = other.log.clone();
                for entry in &own_log {
                    self.adopt_entry(entry);
                }
                self.clock.merge(&own_clock);
            }
        }
        self.registered_in_store |= other.registered_in_store;
        Ok(())
    }

    fn adopt_entry(&mut self, entry: &LogEntry) {
        if let Some(existing) = self
            .log
            .iter_mut()
            .find(|e| e.mapping.client() == entry.mapping.client())
        {
            for ts in entry.mapping.system_timestamps() {
                existing.mapping.add_system_timestamp(ts.clone());
            }
            entry.mapping.record_into(&mut self.clock);
            return;
        }
        if entry.mapping.any_timestamp_included(&self.clock) {
            // Already folded into our checkpoint or otherwise covered.
            entry.mapping.record_into(&mut self.clock);
            return;
        }
        entry.mapping.record_into(&mut self.clock);
        self.log.push(entry.clone());
    }

    fn version_unavailable(&self, requested: &VersionClock) -> CrdtError {
        CrdtError::VersionNotAvailable {
            id: self.id.clone(),
            requested: requested.to_string(),
            prune: self.prune_clock.to_string(),
            clock: self.clock.to_string(),
        }
    }
}
