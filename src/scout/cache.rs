//! Local object cache with access-order eviction, TTL eviction, and
//! per-transaction eviction protection.
//!
//! Invariant maintained by the scout core: a cached object always includes
//! every update of locally and globally committed transactions that
//! originated at this scout. Requires external synchronization (the scout's
//! coarse lock).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::core::{CrdtId, ManagedCrdt, Timestamp, VersionClock};

/// Serial of an open transaction, used to pin cache entries.
pub type TxnSerial = u64;

/// Counters for cache effectiveness, reported at scout stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses_no_object: u64,
    pub misses_wrong_version: u64,
    pub evictions: u64,
}

struct Entry {
    crdt: ManagedCrdt,
    stamp: u64,
    last_access: Instant,
    accesses: u64,
    protectors: HashSet<TxnSerial>,
}

pub struct ObjectCache {
    entries: HashMap<CrdtId, Entry>,
    recency: BTreeMap<u64, CrdtId>,
    next_stamp: u64,
    max_elements: usize,
    eviction_time: Duration,
    protections: HashSet<TxnSerial>,
    on_evict: Option<Box<dyn FnMut(&CrdtId) + Send>>,
    stats: CacheStats,
}

impl ObjectCache {
    pub fn new(max_elements: usize, eviction_time: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
            max_elements: max_elements.max(1),
            eviction_time,
            protections: HashSet::new(),
            on_evict: None,
            stats: CacheStats::default(),
        }
    }

    pub fn set_eviction_listener(&mut self, listener: impl FnMut(&CrdtId) + Send + 'static) {
        self.on_evict = Some(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &CrdtId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub(crate) fn note_hit(&mut self) {
        self.stats.hits += 1;
    }

    pub(crate) fn note_miss_no_object(&mut self) {
        self.stats.misses_no_object += 1;
    }

    pub(crate) fn note_miss_wrong_version(&mut self) {
        self.stats.misses_wrong_version += 1;
    }

    /// Install an object, overwriting any previous entry for the id. A
    /// protecting transaction serial pins the entry until the protection is
    /// released. May evict other entries over the size limit.
    pub fn add(&mut self, crdt: ManagedCrdt, protector: Option<TxnSerial>) {
        let id = crdt.id().clone();
        if let Some(serial) = protector {
            self.protections.insert(serial);
        }
        let stamp = self.bump_stamp();
        if let Some(old) = self.entries.remove(&id) {
            self.recency.remove(&old.stamp);
        }
        let mut protectors = HashSet::new();
        if let Some(serial) = protector {
            protectors.insert(serial);
        }
        self.entries.insert(
            id.clone(),
            Entry {
                crdt,
                stamp,
                last_access: Instant::now(),
                accesses: 1,
                protectors,
            },
        );
        self.recency.insert(stamp, id);
        self.evict_excess();
    }

    /// Returns the object and records the access for eviction purposes.
    pub fn get_and_touch(&mut self, id: &CrdtId) -> Option<&mut ManagedCrdt> {
        let stamp = self.bump_stamp();
        let entry = self.entries.get_mut(id)?;
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        entry.last_access = Instant::now();
        entry.accesses += 1;
        self.recency.insert(stamp, id.clone());
        Some(&mut entry.crdt)
    }

    /// Returns the object without recording an access.
    pub fn get_without_touch(&self, id: &CrdtId) -> Option<&ManagedCrdt> {
        self.entries.get(id).map(|entry| &entry.crdt)
    }

    pub fn get_without_touch_mut(&mut self, id: &CrdtId) -> Option<&mut ManagedCrdt> {
        self.entries.get_mut(id).map(|entry| &mut entry.crdt)
    }

    /// Drop an entry outright (e.g. after a failed merge). Does not fire the
    /// eviction listener: the caller immediately reinstalls a fresh copy.
    pub fn remove(&mut self, id: &CrdtId) -> Option<ManagedCrdt> {
        let entry = self.entries.remove(id)?;
        self.recency.remove(&entry.stamp);
        Some(entry.crdt)
    }

    pub fn ids(&self) -> Vec<CrdtId> {
        self.entries.keys().cloned().collect()
    }

    /// Pin an existing entry for an open transaction.
    pub fn protect(&mut self, id: &CrdtId, serial: TxnSerial) {
        if let Some(entry) = self.entries.get_mut(id) {
            self.protections.insert(serial);
            entry.protectors.insert(serial);
        }
    }

    /// Release a transaction's protection and sweep: entries over the size
    /// limit and entries idle longer than the eviction time go.
    pub fn remove_protection(&mut self, serial: TxnSerial) {
        self.remove_protection_at(serial, Instant::now());
    }

    pub(crate) fn remove_protection_at(&mut self, serial: TxnSerial, now: Instant) {
        self.protections.remove(&serial);
        self.evict_excess();
        self.evict_outdated(now);
    }

    /// Advance every cached object's clock from store-side knowledge, without
    /// importing operations.
    pub fn augment_all_with_store_clock(&mut self, clock: &VersionClock) {
        for entry in self.entries.values_mut() {
            entry.crdt.augment_with_store_clock(clock);
        }
    }

    /// Record a scout timestamp in every cached object's clock.
    pub fn augment_all_with_scout_timestamp(&mut self, ts: &Timestamp) {
        for entry in self.entries.values_mut() {
            entry.crdt.augment_with_scout_timestamp(ts);
        }
    }

    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn is_protected(&self, entry: &Entry) -> bool {
        entry
            .protectors
            .iter()
            .any(|serial| self.protections.contains(serial))
    }

    fn evict_excess(&mut self) {
        while self.entries.len() > self.max_elements {
            let victim = self
                .recency
                .values()
                .find(|id| {
                    self.entries
                        .get(*id)
                        .is_some_and(|entry| !self.is_protected(entry))
                })
                .cloned();
            // Every excess entry is protected: the cache is allowed to run
            // over its limit until a protection is released.
            let Some(victim) = victim else { break };
            self.evict(&victim);
        }
    }

    fn evict_outdated(&mut self, now: Instant) {
        let threshold = match now.checked_sub(self.eviction_time) {
            Some(threshold) => threshold,
            None => return,
        };
        let victims: Vec<CrdtId> = self
            .recency
            .values()
            .filter(|id| {
                self.entries.get(*id).is_some_and(|entry| {
                    entry.last_access <= threshold && !self.is_protected(entry)
                })
            })
            .cloned()
            .collect();
        for id in victims {
            self.evict(&id);
        }
    }

    fn evict(&mut self, id: &CrdtId) {
        if let Some(entry) = self.entries.remove(id) {
            self.recency.remove(&entry.stamp);
            self.stats.evictions += 1;
            tracing::debug!(object = %id, accesses = entry.accesses, "evicted from cache");
            if let Some(listener) = self.on_evict.as_mut() {
                listener(id);
            }
        }
    }
}
