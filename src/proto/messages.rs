//! Surrogate protocol message schemas and CBOR encoding.
//!
//! Every message travels as one frame whose body is the CBOR encoding of a
//! `WireMessage` envelope: a protocol version plus the typed payload.

use minicbor::{Decode, Encode};
use thiserror::Error;

use crate::core::{CrdtId, ManagedCrdt, OpsGroup, SourceId, Timestamp, VersionClock};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct LatestKnownClockRequest {
    #[n(0)]
    pub scout_id: SourceId,
    #[n(1)]
    pub disaster_safe: bool,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct LatestKnownClockReply {
    #[n(0)]
    pub clock: VersionClock,
    #[n(1)]
    pub disaster_durable_clock: VersionClock,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BatchFetchObjectVersionRequest {
    #[n(0)]
    pub scout_id: SourceId,
    #[n(1)]
    pub disaster_safe: bool,
    /// Lower bound the scout already holds; lets the store skip shipping a
    /// full state when only a delta is needed. Only meaningful for precise
    /// version requests.
    #[n(2)]
    pub known_version: Option<VersionClock>,
    /// Requested version with the scout's own entry dropped: the store
    /// reasons about store-side causality only.
    #[n(3)]
    pub requested_version: VersionClock,
    #[n(4)]
    pub send_more_recent_updates: bool,
    #[n(5)]
    pub subscribe_updates: bool,
    /// Cache-less operation: the store may strip metadata it would normally
    /// keep for cached readers.
    #[n(6)]
    pub light_mode: bool,
    #[n(7)]
    pub ids: Vec<CrdtId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(index_only)]
pub enum FetchStatus {
    #[n(0)]
    Ok,
    #[n(1)]
    UpToDate,
    #[n(2)]
    ObjectNotFound,
    #[n(3)]
    VersionMissing,
    #[n(4)]
    VersionPruned,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BatchFetchObjectVersionReply {
    /// One status per requested id, same order.
    #[n(0)]
    pub statuses: Vec<FetchStatus>,
    /// Object state per id; `None` for UP_TO_DATE and error statuses.
    #[n(1)]
    pub objects: Vec<Option<ManagedCrdt>>,
    #[n(2)]
    pub estimated_committed_version: Option<VersionClock>,
    #[n(3)]
    pub estimated_disaster_durable_version: Option<VersionClock>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CommitUpdatesRequest {
    #[n(0)]
    pub client_timestamp: Timestamp,
    #[n(1)]
    pub dependency_clock: VersionClock,
    #[n(2)]
    pub ops_groups: Vec<OpsGroup>,
    /// Number of data centers that must hold the transaction before the
    /// store acknowledges it.
    #[n(3)]
    pub k_stability: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BatchCommitUpdatesRequest {
    #[n(0)]
    pub scout_id: SourceId,
    #[n(1)]
    pub disaster_safe: bool,
    #[n(2)]
    pub requests: Vec<CommitUpdatesRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(index_only)]
pub enum CommitStatus {
    #[n(0)]
    CommittedWithKnownTimestamps,
    #[n(1)]
    CommittedWithKnownClockRange,
    #[n(2)]
    InvalidOperation,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CommitUpdatesReply {
    #[n(0)]
    pub status: CommitStatus,
    /// System timestamps bound to the client timestamp; present with
    /// `CommittedWithKnownTimestamps`.
    #[n(1)]
    pub system_timestamps: Vec<Timestamp>,
    /// Imprecise bound for `CommittedWithKnownClockRange`.
    #[n(2)]
    pub imprecise_commit_clock: Option<VersionClock>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BatchCommitUpdatesReply {
    #[n(0)]
    pub replies: Vec<CommitUpdatesReply>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ObjectUpdates {
    #[n(0)]
    pub id: CrdtId,
    #[n(1)]
    pub groups: Vec<OpsGroup>,
}

/// Server-initiated push: a causally closed batch of updates plus the store
/// version they bring the subscriber to.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct BatchUpdatesNotification {
    #[n(0)]
    pub scout_id: SourceId,
    #[n(1)]
    pub new_version: VersionClock,
    #[n(2)]
    pub is_disaster_safe: bool,
    #[n(3)]
    pub updates: Vec<ObjectUpdates>,
}

impl BatchUpdatesNotification {
    pub fn ids(&self) -> impl Iterator<Item = &CrdtId> {
        self.updates.iter().map(|entry| &entry.id)
    }
}

/// Envelope for the framed stream.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum WireMessage {
    #[n(0)]
    LatestKnownClockRequest(#[n(0)] LatestKnownClockRequest),
    #[n(1)]
    LatestKnownClockReply(#[n(0)] LatestKnownClockReply),
    #[n(2)]
    FetchRequest(#[n(0)] BatchFetchObjectVersionRequest),
    #[n(3)]
    FetchReply(#[n(0)] BatchFetchObjectVersionReply),
    #[n(4)]
    CommitRequest(#[n(0)] BatchCommitUpdatesRequest),
    #[n(5)]
    CommitReply(#[n(0)] BatchCommitUpdatesReply),
    #[n(6)]
    Notification(#[n(0)] BatchUpdatesNotification),
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WireEnvelope {
    #[n(0)]
    pub version: u32,
    #[n(1)]
    pub message: WireMessage,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode: {0}")]
    Encode(String),
    #[error("cbor decode: {0}")]
    Decode(String),
    #[error("protocol version {got} not supported (expected {expected})")]
    VersionMismatch { expected: u32, got: u32 },
}

pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let envelope = WireEnvelope {
        version: PROTOCOL_VERSION,
        message: message.clone(),
    };
    let mut buf = Vec::new();
    minicbor::encode(&envelope, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    let envelope: WireEnvelope =
        minicbor::decode(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: envelope.version,
        });
    }
    Ok(envelope.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        CrdtKind, CrdtOp, CrdtValue, TimestampMapping,
    };

    fn scout() -> SourceId {
        SourceId::parse("s0").unwrap()
    }

    fn sample_clock() -> VersionClock {
        let mut clock = VersionClock::new();
        clock.record_all_until(&Timestamp::new(SourceId::parse("dc0").unwrap(), 5));
        clock.record(&Timestamp::new(scout(), 2));
        clock
    }

    #[test]
    fn latest_known_clock_roundtrip() {
        let message = WireMessage::LatestKnownClockRequest(LatestKnownClockRequest {
            scout_id: scout(),
            disaster_safe: true,
        });
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn fetch_reply_with_object_roundtrip() {
        let id = CrdtId::new("t", "k", CrdtKind::Counter).unwrap();
        let mut crdt = ManagedCrdt::new(
            id.clone(),
            CrdtValue::new(CrdtKind::Counter),
            sample_clock(),
            true,
        );
        let mut group = OpsGroup::new(
            id,
            TimestampMapping::new(Timestamp::new(scout(), 3)),
        );
        group.ops.push(CrdtOp::CounterAdd { delta: 4 });
        crdt.execute(&group, crate::core::DependencyPolicy::Ignore)
            .unwrap();

        let message = WireMessage::FetchReply(BatchFetchObjectVersionReply {
            statuses: vec![FetchStatus::Ok],
            objects: vec![Some(crdt)],
            estimated_committed_version: Some(sample_clock()),
            estimated_disaster_durable_version: None,
        });
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn commit_request_roundtrip() {
        let id = CrdtId::new("t", "k", CrdtKind::Set).unwrap();
        let mapping = TimestampMapping::new(Timestamp::new(scout(), 7));
        let mut group = OpsGroup::new(id, mapping);
        group.dependency = sample_clock();
        group.ops.push(CrdtOp::SetAdd {
            element: "e".into(),
            tag: crate::core::UpdateTag::new(Timestamp::new(scout(), 7), 0),
        });

        let message = WireMessage::CommitRequest(BatchCommitUpdatesRequest {
            scout_id: scout(),
            disaster_safe: false,
            requests: vec![CommitUpdatesRequest {
                client_timestamp: Timestamp::new(scout(), 7),
                dependency_clock: sample_clock(),
                ops_groups: vec![group],
                k_stability: 1,
            }],
        });
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let envelope = WireEnvelope {
            version: PROTOCOL_VERSION + 1,
            message: WireMessage::LatestKnownClockRequest(LatestKnownClockRequest {
                scout_id: scout(),
                disaster_safe: false,
            }),
        };
        let mut bytes = Vec::new();
        minicbor::encode(&envelope, &mut bytes).unwrap();
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::VersionMismatch { .. })
        ));
    }
}
