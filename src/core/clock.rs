//! Causal version clocks with per-source exception intervals.
//!
//! A `VersionClock` maps each event source (a scout or a data center) to the
//! set of counter values it has observed from that source. The set is kept as
//! sorted inclusive runs, so a clock can represent `[1-5, 8, 11-13]`: a
//! contiguous prefix with holes. Holes appear when updates are delivered out
//! of causal order (e.g. a notification stream racing a fetch) and close as
//! the missing timestamps arrive.

use std::collections::BTreeMap;
use std::fmt;

use minicbor::{Decode, Encode};

use super::timestamp::{SourceId, Timestamp};

/// Outcome of comparing two clocks as sets of observed events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrd {
    /// Both clocks contain exactly the same events.
    Equal,
    /// Self contains every event of the other, plus more.
    Dominates,
    /// The other clock contains every event of self, plus more.
    Dominated,
    /// Each side contains events the other is missing.
    Concurrent,
}

/// One inclusive run of counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Run {
    #[n(0)]
    pub lo: u64,
    #[n(1)]
    pub hi: u64,
}

/// Sorted, disjoint, non-adjacent inclusive runs over counters >= 1.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct IntervalSet {
    #[n(0)]
    runs: Vec<Run>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn contains(&self, value: u64) -> bool {
        let idx = self.runs.partition_point(|run| run.hi < value);
        self.runs.get(idx).is_some_and(|run| run.lo <= value)
    }

    /// Highest included counter, or 0 when empty.
    pub fn max(&self) -> u64 {
        self.runs.last().map_or(0, |run| run.hi)
    }

    pub fn insert(&mut self, value: u64) {
        self.insert_range(value, value);
    }

    /// Insert the inclusive range `[lo, hi]`, coalescing adjacent runs.
    pub fn insert_range(&mut self, lo: u64, hi: u64) {
        debug_assert!(lo >= 1 && lo <= hi, "interval must be non-empty and 1-based");
        let mut merged = Run { lo, hi };
        let mut out = Vec::with_capacity(self.runs.len() + 1);
        let mut placed = false;
        for run in &self.runs {
            if run.hi.saturating_add(1) < merged.lo {
                out.push(*run);
            } else if merged.hi.saturating_add(1) < run.lo {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*run);
            } else {
                merged.lo = merged.lo.min(run.lo);
                merged.hi = merged.hi.max(run.hi);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.runs = out;
    }

    /// True when every counter of `self` is also in `other`.
    pub fn is_subset(&self, other: &IntervalSet) -> bool {
        // Runs are normalized (disjoint, non-adjacent), so a run of self is
        // covered iff a single run of other spans it.
        self.runs.iter().all(|run| {
            let idx = other.runs.partition_point(|o| o.hi < run.lo);
            other
                .runs
                .get(idx)
                .is_some_and(|o| o.lo <= run.lo && run.hi <= o.hi)
        })
    }

    pub fn union_with(&mut self, other: &IntervalSet) {
        for run in &other.runs {
            self.insert_range(run.lo, run.hi);
        }
    }

    pub fn intersect_with(&mut self, other: &IntervalSet) {
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < self.runs.len() && j < other.runs.len() {
            let a = self.runs[i];
            let b = other.runs[j];
            let lo = a.lo.max(b.lo);
            let hi = a.hi.min(b.hi);
            if lo <= hi {
                out.push(Run { lo, hi });
            }
            if a.hi <= b.hi {
                i += 1;
            } else {
                j += 1;
            }
        }
        self.runs = out;
    }

    pub fn runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|run| (run.lo, run.hi))
    }
}

/// Vector clock over event sources, tolerating holes per source.
///
/// An empty clock is dominated by every non-empty clock and dominates
/// nothing; all comparisons are pure set comparisons over (source, counter)
/// pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct VersionClock {
    #[n(0)]
    sources: BTreeMap<SourceId, IntervalSet>,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.values().all(IntervalSet::is_empty)
    }

    /// Record a single timestamp as observed.
    pub fn record(&mut self, ts: &Timestamp) {
        self.sources
            .entry(ts.source.clone())
            .or_default()
            .insert(ts.counter);
    }

    /// Record the full prefix `[1..=ts.counter]` for `ts.source`.
    pub fn record_all_until(&mut self, ts: &Timestamp) {
        if ts.counter == 0 {
            return;
        }
        self.sources
            .entry(ts.source.clone())
            .or_default()
            .insert_range(1, ts.counter);
    }

    pub fn includes(&self, ts: &Timestamp) -> bool {
        self.sources
            .get(&ts.source)
            .is_some_and(|set| set.contains(ts.counter))
    }

    pub fn has_source(&self, source: &SourceId) -> bool {
        self.sources.get(source).is_some_and(|set| !set.is_empty())
    }

    /// Highest observed timestamp for `source`, if any.
    pub fn latest(&self, source: &SourceId) -> Option<Timestamp> {
        let set = self.sources.get(source)?;
        if set.is_empty() {
            return None;
        }
        Some(Timestamp::new(source.clone(), set.max()))
    }

    /// Remove a source entirely.
    pub fn drop_source(&mut self, source: &SourceId) {
        self.sources.remove(source);
    }

    /// Pointwise union. Returns how `self` related to `other` before merging,
    /// so callers can tell whether the merge brought in anything new.
    pub fn merge(&mut self, other: &VersionClock) -> ClockOrd {
        let relation = self.compare(other);
        for (source, set) in &other.sources {
            self.sources
                .entry(source.clone())
                .or_default()
                .union_with(set);
        }
        relation
    }

    /// Pointwise intersection, in place.
    pub fn intersect(&mut self, other: &VersionClock) {
        self.sources.retain(|source, set| {
            match other.sources.get(source) {
                Some(other_set) => {
                    set.intersect_with(other_set);
                    !set.is_empty()
                }
                None => false,
            }
        });
    }

    pub fn compare(&self, other: &VersionClock) -> ClockOrd {
        let mut self_extra = false;
        let mut other_extra = false;
        for (source, set) in &self.sources {
            if set.is_empty() {
                continue;
            }
            match other.sources.get(source) {
                None => self_extra = true,
                Some(other_set) => {
                    if !set.is_subset(other_set) {
                        self_extra = true;
                    }
                    if !other_set.is_subset(set) {
                        other_extra = true;
                    }
                }
            }
        }
        for (source, other_set) in &other.sources {
            if !other_set.is_empty() && !self.sources.contains_key(source) {
                other_extra = true;
            }
        }
        match (self_extra, other_extra) {
            (false, false) => ClockOrd::Equal,
            (true, false) => ClockOrd::Dominates,
            (false, true) => ClockOrd::Dominated,
            (true, true) => ClockOrd::Concurrent,
        }
    }

    /// True when `self` contains every event of `other`.
    pub fn is_at_least(&self, other: &VersionClock) -> bool {
        matches!(self.compare(other), ClockOrd::Equal | ClockOrd::Dominates)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.sources
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(source, _)| source)
    }

    /// Drop empty per-source entries left behind by intersections.
    pub fn trim(&mut self) {
        self.sources.retain(|_, set| !set.is_empty());
    }
}

impl fmt::Display for VersionClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (source, set) in &self.sources {
            if set.is_empty() {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{source}:")?;
            let mut first_run = true;
            for (lo, hi) in set.runs() {
                if !first_run {
                    write!(f, "+")?;
                }
                first_run = false;
                if lo == hi {
                    write!(f, "{lo}")?;
                } else {
                    write!(f, "{lo}-{hi}")?;
                }
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(name: &str) -> SourceId {
        SourceId::parse(name).unwrap()
    }

    fn ts(name: &str, counter: u64) -> Timestamp {
        Timestamp::new(src(name), counter)
    }

    #[test]
    fn record_and_includes() {
        let mut clock = VersionClock::new();
        clock.record(&ts("a", 1));
        clock.record(&ts("a", 3));

        assert!(clock.includes(&ts("a", 1)));
        assert!(!clock.includes(&ts("a", 2)));
        assert!(clock.includes(&ts("a", 3)));
        assert!(!clock.includes(&ts("b", 1)));
    }

    #[test]
    fn holes_close_when_missing_timestamp_arrives() {
        let mut clock = VersionClock::new();
        clock.record(&ts("a", 1));
        clock.record(&ts("a", 3));
        clock.record(&ts("a", 2));

        let set = clock.sources.get(&src("a")).unwrap();
        assert_eq!(set.runs().collect::<Vec<_>>(), vec![(1, 3)]);
    }

    #[test]
    fn record_all_until_fills_prefix() {
        let mut clock = VersionClock::new();
        clock.record_all_until(&ts("a", 4));

        for counter in 1..=4 {
            assert!(clock.includes(&ts("a", counter)));
        }
        assert!(!clock.includes(&ts("a", 5)));
    }

    #[test]
    fn empty_clock_is_dominated_by_any_nonempty_clock() {
        let empty = VersionClock::new();
        let mut other = VersionClock::new();
        other.record(&ts("a", 1));

        assert_eq!(empty.compare(&other), ClockOrd::Dominated);
        assert_eq!(other.compare(&empty), ClockOrd::Dominates);
        assert_eq!(empty.compare(&VersionClock::new()), ClockOrd::Equal);
    }

    #[test]
    fn compare_detects_concurrency() {
        let mut a = VersionClock::new();
        a.record(&ts("a", 1));
        let mut b = VersionClock::new();
        b.record(&ts("b", 1));

        assert_eq!(a.compare(&b), ClockOrd::Concurrent);
        assert_eq!(b.compare(&a), ClockOrd::Concurrent);
    }

    #[test]
    fn compare_sees_through_holes() {
        // a = {1,3}, b = {1,2,3}: b dominates despite equal max.
        let mut a = VersionClock::new();
        a.record(&ts("x", 1));
        a.record(&ts("x", 3));
        let mut b = VersionClock::new();
        b.record_all_until(&ts("x", 3));

        assert_eq!(a.compare(&b), ClockOrd::Dominated);
        assert_eq!(b.compare(&a), ClockOrd::Dominates);
    }

    #[test]
    fn merge_is_union_and_reports_prior_relation() {
        let mut a = VersionClock::new();
        a.record(&ts("x", 1));
        let mut b = VersionClock::new();
        b.record(&ts("y", 2));

        let relation = a.merge(&b);
        assert_eq!(relation, ClockOrd::Concurrent);
        assert!(a.includes(&ts("x", 1)));
        assert!(a.includes(&ts("y", 2)));

        // Merging something already covered reports domination, changes nothing.
        let before = a.clone();
        assert_eq!(a.merge(&b), ClockOrd::Dominates);
        assert_eq!(a, before);
    }

    #[test]
    fn intersect_keeps_common_events_only() {
        let mut a = VersionClock::new();
        a.record_all_until(&ts("x", 5));
        a.record(&ts("y", 1));
        let mut b = VersionClock::new();
        b.record(&ts("x", 3));
        b.record(&ts("x", 4));
        b.record(&ts("z", 7));

        a.intersect(&b);
        assert!(!a.includes(&ts("x", 2)));
        assert!(a.includes(&ts("x", 3)));
        assert!(a.includes(&ts("x", 4)));
        assert!(!a.includes(&ts("x", 5)));
        assert!(!a.has_source(&src("y")));
        assert!(!a.has_source(&src("z")));
    }

    #[test]
    fn drop_source_removes_all_evidence() {
        let mut clock = VersionClock::new();
        clock.record_all_until(&ts("x", 3));
        clock.record(&ts("y", 1));

        clock.drop_source(&src("x"));
        assert!(!clock.has_source(&src("x")));
        assert_eq!(clock.latest(&src("x")), None);
        assert_eq!(clock.latest(&src("y")), Some(ts("y", 1)));
    }

    #[test]
    fn interval_set_subset_handles_split_runs() {
        let mut small = IntervalSet::new();
        small.insert_range(2, 3);
        let mut big = IntervalSet::new();
        big.insert_range(1, 5);
        assert!(small.is_subset(&big));
        assert!(!big.is_subset(&small));

        // [2-3] is not covered by [1-2]+[4-5]: 3 falls in the hole.
        let mut gappy = IntervalSet::new();
        gappy.insert_range(1, 2);
        gappy.insert_range(4, 5);
        assert!(!small.is_subset(&gappy));
    }

    #[test]
    fn display_renders_runs() {
        let mut clock = VersionClock::new();
        clock.record_all_until(&ts("dc0", 3));
        clock.record(&ts("dc0", 5));
        assert_eq!(clock.to_string(), "[dc0:1-3+5]");
    }
}
