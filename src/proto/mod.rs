//! Wire protocol: message schemas, framing, and the surrogate endpoint.

pub mod endpoint;
pub mod frame;
pub mod messages;

pub use endpoint::{
    FramedClient, NotificationReceiver, NotificationSender, RpcError, Surrogate,
    notification_channel,
};
pub use frame::{DEFAULT_MAX_FRAME_BYTES, FrameError, FrameReader, FrameWriter, encode_frame};
pub use messages::{
    BatchCommitUpdatesReply, BatchCommitUpdatesRequest, BatchFetchObjectVersionReply,
    BatchFetchObjectVersionRequest, BatchUpdatesNotification, CodecError, CommitStatus,
    CommitUpdatesReply, CommitUpdatesRequest, FetchStatus, LatestKnownClockReply,
    LatestKnownClockRequest, ObjectUpdates, PROTOCOL_VERSION, WireMessage, decode_message,
    encode_message,
};
