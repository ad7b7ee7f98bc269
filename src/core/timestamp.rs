//! Timestamps, source ids, and the per-scout timestamp source.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use minicbor::{Decode, Encode};
use thiserror::Error;
use uuid::Uuid;

use super::clock::VersionClock;

/// Identifies an event source: a scout instance or a data center surrogate.
///
/// Short opaque string, structural equality. Scout ids are generated; data
/// center ids come from the store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
#[cbor(transparent)]
pub struct SourceId(#[n(0)] String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("source id `{raw}` is invalid: {reason}")]
pub struct InvalidSourceId {
    pub raw: String,
    pub reason: &'static str,
}

impl SourceId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidSourceId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidSourceId {
                raw,
                reason: "must not be empty",
            });
        }
        if raw.contains(char::is_whitespace) {
            return Err(InvalidSourceId {
                raw,
                reason: "must not contain whitespace",
            });
        }
        Ok(Self(raw))
    }

    /// Generate a fresh scout id. Eight hex chars of a random UUID keep the
    /// on-wire footprint of every vector entry small while staying unique
    /// enough for a population of scouts.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        let hex = uuid.simple().to_string();
        Self(hex[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (source, counter) event identifier.
#[derive(Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Timestamp {
    #[n(0)]
    pub source: SourceId,
    #[n(1)]
    pub counter: u64,
}

impl Timestamp {
    pub fn new(source: SourceId, counter: u64) -> Self {
        Self { source, counter }
    }
}

// Counter-first order: gives a lamport-style total order usable for
// last-writer-wins arbitration, with the source id as tiebreak.
impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.counter)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.counter)
    }
}

/// One client timestamp plus every system timestamp the store eventually
/// bound to it.
///
/// System timestamps accumulate over commit retries and are never removed.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct TimestampMapping {
    #[n(0)]
    client: Timestamp,
    #[n(1)]
    system: BTreeSet<Timestamp>,
}

impl TimestampMapping {
    pub fn new(client: Timestamp) -> Self {
        Self {
            client,
            system: BTreeSet::new(),
        }
    }

    pub fn client(&self) -> &Timestamp {
        &self.client
    }

    pub fn add_system_timestamp(&mut self, ts: Timestamp) {
        self.system.insert(ts);
    }

    pub fn system_timestamps(&self) -> impl Iterator<Item = &Timestamp> {
        self.system.iter()
    }

    pub fn has_system_timestamp(&self) -> bool {
        !self.system.is_empty()
    }

    /// True when the client timestamp or any bound system timestamp is in
    /// `clock`.
    pub fn any_timestamp_included(&self, clock: &VersionClock) -> bool {
        clock.includes(&self.client) || self.system.iter().any(|ts| clock.includes(ts))
    }

    /// True when every bound system timestamp is in `clock`. Vacuously false
    /// while no system timestamp is known.
    pub fn all_system_timestamps_included(&self, clock: &VersionClock) -> bool {
        !self.system.is_empty() && self.system.iter().all(|ts| clock.includes(ts))
    }

    /// Record the client timestamp and every system timestamp into `clock`.
    pub fn record_into(&self, clock: &mut VersionClock) {
        clock.record(&self.client);
        for ts in &self.system {
            clock.record(ts);
        }
    }
}

/// Strictly increasing counter scoped to one scout id.
///
/// The most recently issued timestamp can be handed back when the transaction
/// that took it turns out read-only or is discarded without a global commit,
/// so the scout's vector entry stays hole-free.
#[derive(Debug)]
pub struct TimestampSource {
    scout: SourceId,
    counter: u64,
}

impl TimestampSource {
    pub fn new(scout: SourceId) -> Self {
        Self { scout, counter: 0 }
    }

    pub fn scout(&self) -> &SourceId {
        &self.scout
    }

    pub fn generate_next(&mut self) -> Timestamp {
        self.counter += 1;
        Timestamp::new(self.scout.clone(), self.counter)
    }

    /// Return `ts` for reuse. Only the most recently issued timestamp can be
    /// returned; anything older has been superseded and returning it would
    /// recycle a value that later transactions already depend on.
    pub fn return_last(&mut self, ts: &Timestamp) {
        if ts.source == self.scout && ts.counter == self.counter {
            self.counter -= 1;
        }
    }

    /// Ensure future timestamps come after `ts`. No-op for foreign sources.
    pub fn advance_past(&mut self, ts: &Timestamp) {
        if ts.source == self.scout && ts.counter > self.counter {
            self.counter = ts.counter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(name: &str) -> SourceId {
        SourceId::parse(name).unwrap()
    }

    #[test]
    fn source_id_rejects_empty_and_whitespace() {
        assert!(SourceId::parse("").is_err());
        assert!(SourceId::parse("a b").is_err());
        assert!(SourceId::parse("dc0").is_ok());
    }

    #[test]
    fn generated_source_ids_are_short_and_distinct() {
        let a = SourceId::generate();
        let b = SourceId::generate();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_order_is_counter_then_source() {
        let a1 = Timestamp::new(src("a"), 1);
        let b1 = Timestamp::new(src("b"), 1);
        let a2 = Timestamp::new(src("a"), 2);

        assert!(a1 < b1);
        assert!(b1 < a2);
    }

    #[test]
    fn source_issues_increasing_timestamps() {
        let mut source = TimestampSource::new(src("s"));
        let t1 = source.generate_next();
        let t2 = source.generate_next();
        assert_eq!(t1.counter, 1);
        assert_eq!(t2.counter, 2);
    }

    #[test]
    fn only_most_recent_timestamp_can_be_returned() {
        let mut source = TimestampSource::new(src("s"));
        let t1 = source.generate_next();
        let t2 = source.generate_next();

        // Returning the older value is a no-op.
        source.return_last(&t1);
        assert_eq!(source.generate_next().counter, 3);

        // Returning the newest rolls the counter back, reissuing it.
        source.return_last(&t2);
        assert_eq!(source.counter, 2);
    }

    #[test]
    fn returning_newest_then_reissuing_reuses_counter() {
        let mut source = TimestampSource::new(src("s"));
        let t1 = source.generate_next();
        source.return_last(&t1);
        let t1_again = source.generate_next();
        assert_eq!(t1, t1_again);
    }

    #[test]
    fn mapping_inclusion_checks_client_and_system() {
        let mut mapping = TimestampMapping::new(Timestamp::new(src("s"), 1));
        let mut clock = VersionClock::new();
        assert!(!mapping.any_timestamp_included(&clock));

        mapping.add_system_timestamp(Timestamp::new(src("dc0"), 9));
        clock.record(&Timestamp::new(src("dc0"), 9));
        assert!(mapping.any_timestamp_included(&clock));
        assert!(mapping.all_system_timestamps_included(&clock));

        mapping.add_system_timestamp(Timestamp::new(src("dc1"), 2));
        assert!(mapping.any_timestamp_included(&clock));
        assert!(!mapping.all_system_timestamps_included(&clock));
    }

    #[test]
    fn mapping_without_system_timestamps_is_never_fully_included() {
        let mapping = TimestampMapping::new(Timestamp::new(src("s"), 1));
        let mut clock = VersionClock::new();
        clock.record(&Timestamp::new(src("s"), 1));
        assert!(!mapping.all_system_timestamps_included(&clock));
    }
}
