//! Surrogate endpoint: the request/reply surface the scout talks to, plus a
//! framed TCP client implementation.
//!
//! The store side is an external collaborator; everything the scout needs
//! from it goes through [`Surrogate`]. Server-initiated notifications arrive
//! out of band on a channel, so request/reply and push traffic can share one
//! stream.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use super::frame::{FrameError, FrameReader, encode_frame};
use super::messages::{
    BatchCommitUpdatesReply, BatchCommitUpdatesRequest, BatchFetchObjectVersionReply,
    BatchFetchObjectVersionRequest, BatchUpdatesNotification, CodecError, LatestKnownClockReply,
    LatestKnownClockRequest, WireMessage, decode_message, encode_message,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request deadline exceeded")]
    Timeout,
    #[error("connection closed by peer")]
    Disconnected,
    #[error("no server endpoint reachable")]
    NoServerReachable,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected reply message for {expected}")]
    UnexpectedReply { expected: &'static str },
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout)
    }
}

/// Request/reply surface of a data center surrogate.
pub trait Surrogate: Send + Sync {
    fn latest_known_clock(
        &self,
        request: LatestKnownClockRequest,
        deadline: Duration,
    ) -> Result<LatestKnownClockReply, RpcError>;

    fn fetch_object_versions(
        &self,
        request: BatchFetchObjectVersionRequest,
        deadline: Duration,
    ) -> Result<BatchFetchObjectVersionReply, RpcError>;

    fn commit_updates(
        &self,
        request: BatchCommitUpdatesRequest,
        deadline: Duration,
    ) -> Result<BatchCommitUpdatesReply, RpcError>;
}

pub type NotificationSender = Sender<BatchUpdatesNotification>;
pub type NotificationReceiver = Receiver<BatchUpdatesNotification>;

pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    unbounded()
}

/// Blocking framed client over one TCP stream.
///
/// Requests are serialized through an internal lock; notification frames that
/// arrive while waiting for a reply are forwarded to the notification channel
/// and the wait continues.
#[derive(Debug)]
pub struct FramedClient {
    stream: Mutex<TcpStream>,
    max_frame_bytes: usize,
    notifications: NotificationSender,
}

impl FramedClient {
    /// Connect to the first reachable endpoint of `servers` (first entry is
    /// the primary).
    pub fn connect(
        servers: &[String],
        connect_timeout: Duration,
        max_frame_bytes: usize,
        notifications: NotificationSender,
    ) -> Result<Self, RpcError> {
        for server in servers {
            let Ok(addrs) = server.to_socket_addrs() else {
                tracing::warn!(server, "could not resolve server endpoint");
                continue;
            };
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, connect_timeout) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        tracing::info!(%addr, "connected to surrogate");
                        return Ok(Self {
                            stream: Mutex::new(stream),
                            max_frame_bytes,
                            notifications,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%addr, %err, "surrogate endpoint unreachable");
                    }
                }
            }
        }
        Err(RpcError::NoServerReachable)
    }

    fn request(&self, message: &WireMessage, deadline: Duration) -> Result<WireMessage, RpcError> {
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let started = Instant::now();

        let body = encode_message(message)?;
        let frame = encode_frame(&body, self.max_frame_bytes)?;
        stream.set_write_timeout(Some(deadline))?;
        stream.write_all(&frame).map_err(map_io_timeout)?;

        loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(RpcError::Timeout);
            };
            if remaining.is_zero() {
                return Err(RpcError::Timeout);
            }
            stream.set_read_timeout(Some(remaining))?;
            let mut reader = FrameReader::new(&mut *stream, self.max_frame_bytes);
            let body = match reader.read_next() {
                Ok(Some(body)) => body,
                Ok(None) => return Err(RpcError::Disconnected),
                Err(FrameError::Io(err)) => return Err(map_io_timeout(err)),
                Err(err) => return Err(err.into()),
            };
            match decode_message(&body)? {
                WireMessage::Notification(batch) => {
                    // Push traffic interleaved with the reply; hand it to the
                    // notification worker and keep waiting.
                    let _ = self.notifications.send(batch);
                }
                reply => return Ok(reply),
            }
        }
    }
}

fn map_io_timeout(err: std::io::Error) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => RpcError::Timeout,
        std::io::ErrorKind::UnexpectedEof => RpcError::Disconnected,
        _ => RpcError::Io(err),
    }
}

impl Surrogate for FramedClient {
    fn latest_known_clock(
        &self,
        request: LatestKnownClockRequest,
        deadline: Duration,
    ) -> Result<LatestKnownClockReply, RpcError> {
        match self.request(&WireMessage::LatestKnownClockRequest(request), deadline)? {
            WireMessage::LatestKnownClockReply(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedReply {
                expected: "LatestKnownClockReply",
            }),
        }
    }

    fn fetch_object_versions(
        &self,
        request: BatchFetchObjectVersionRequest,
        deadline: Duration,
    ) -> Result<BatchFetchObjectVersionReply, RpcError> {
        match self.request(&WireMessage::FetchRequest(request), deadline)? {
            WireMessage::FetchReply(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedReply {
                expected: "FetchReply",
            }),
        }
    }

    fn commit_updates(
        &self,
        request: BatchCommitUpdatesRequest,
        deadline: Duration,
    ) -> Result<BatchCommitUpdatesReply, RpcError> {
        match self.request(&WireMessage::CommitRequest(request), deadline)? {
            WireMessage::CommitReply(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedReply {
                expected: "CommitReply",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SourceId, Timestamp, VersionClock};
    use crate::proto::frame::FrameWriter;
    use std::net::TcpListener;

    fn scout() -> SourceId {
        SourceId::parse("s0").unwrap()
    }

    #[test]
    fn request_skips_interleaved_notifications() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::new(stream.try_clone().unwrap(), 1 << 20);
            let body = reader.read_next().unwrap().unwrap();
            let request = decode_message(&body).unwrap();
            assert!(matches!(request, WireMessage::LatestKnownClockRequest(_)));

            let mut writer = FrameWriter::new(stream, 1 << 20);
            // Push a notification before the reply; the client must forward
            // it and keep waiting.
            let notification = WireMessage::Notification(BatchUpdatesNotification {
                scout_id: scout(),
                new_version: VersionClock::new(),
                is_disaster_safe: false,
                updates: Vec::new(),
            });
            writer
                .write_frame(&encode_message(&notification).unwrap())
                .unwrap();

            let mut clock = VersionClock::new();
            clock.record(&Timestamp::new(SourceId::parse("dc0").unwrap(), 1));
            let reply = WireMessage::LatestKnownClockReply(LatestKnownClockReply {
                clock: clock.clone(),
                disaster_durable_clock: clock,
            });
            writer
                .write_frame(&encode_message(&reply).unwrap())
                .unwrap();
        });

        let (tx, rx) = notification_channel();
        let client = FramedClient::connect(
            &[addr.to_string()],
            Duration::from_secs(1),
            1 << 20,
            tx,
        )
        .unwrap();

        let reply = client
            .latest_known_clock(
                LatestKnownClockRequest {
                    scout_id: scout(),
                    disaster_safe: false,
                },
                Duration::from_secs(2),
            )
            .unwrap();
        assert!(!reply.clock.is_empty());
        assert_eq!(rx.try_iter().count(), 1);

        server.join().unwrap();
    }

    #[test]
    fn unreachable_servers_fail_fast() {
        let (tx, _rx) = notification_channel();
        let err = FramedClient::connect(
            &["127.0.0.1:1".to_string()],
            Duration::from_millis(100),
            1 << 20,
            tx,
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::NoServerReachable));
    }
}
