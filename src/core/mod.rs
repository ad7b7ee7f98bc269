//! Domain types: clocks, timestamps, identifiers, operations, managed CRDTs.
//!
//! Module order follows type dependency order: timestamps and clocks first,
//! then identifiers and operations, then the value variants, and finally the
//! managed wrapper that ties a value to its causal bookkeeping.

pub mod clock;
pub mod id;
pub mod managed;
pub mod op;
pub mod timestamp;
pub mod value;

pub use clock::{ClockOrd, IntervalSet, VersionClock};
pub use id::{CrdtId, CrdtKind, InvalidCrdtId};
pub use managed::{CrdtError, DependencyPolicy, ManagedCrdt};
pub use op::{CrdtOp, OpsGroup, UpdateTag};
pub use timestamp::{InvalidSourceId, SourceId, Timestamp, TimestampMapping, TimestampSource};
pub use value::{CrdtValue, KindMismatch, LwwCell};
