//! Durable log of locally committed transactions.
//!
//! Optional append-only file letting a restarted scout re-enqueue
//! transactions that never reached the store. Records are CBOR bodies in
//! crc-checked frames; replay stops at the first torn or corrupt record, so
//! a crash mid-append loses at most the record being written.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use minicbor::{Decode, Encode};
use thiserror::Error;

use crate::core::{OpsGroup, Timestamp, VersionClock};
use crate::proto::frame::{FrameError, FrameReader, encode_frame};

const MAX_RECORD_BYTES: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum CommitLogError {
    #[error("commit log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("commit log encode: {0}")]
    Encode(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One locally committed transaction, as persisted.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct LoggedTxn {
    #[n(0)]
    pub client_timestamp: Timestamp,
    #[n(1)]
    pub dependency: VersionClock,
    #[n(2)]
    pub groups: Vec<OpsGroup>,
}

pub trait CommitLog: Send {
    fn append(&mut self, txn: &LoggedTxn) -> Result<(), CommitLogError>;
    fn flush(&mut self) -> Result<(), CommitLogError>;
    fn close(&mut self) -> Result<(), CommitLogError>;
}

/// Log used when no durable log is configured.
pub struct NoopLog;

impl CommitLog for NoopLog {
    fn append(&mut self, _txn: &LoggedTxn) -> Result<(), CommitLogError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CommitLogError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), CommitLogError> {
        Ok(())
    }
}

/// Append-only disk log.
///
/// With `flush_on_append` disabled, appends stay in the write buffer until an
/// explicit flush or close; a crash then loses buffered commits but never
/// corrupts earlier records.
pub struct DiskLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    flush_on_append: bool,
}

impl DiskLog {
    pub fn open(path: impl Into<PathBuf>, flush_on_append: bool) -> Result<Self, CommitLogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CommitLogError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            flush_on_append,
        })
    }

    /// Read back every intact record. Tolerates a torn tail: replay stops at
    /// the first record that fails to frame-decode.
    pub fn replay(path: &Path) -> Result<Vec<LoggedTxn>, CommitLogError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CommitLogError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mut reader = FrameReader::new(BufReader::new(file), MAX_RECORD_BYTES);
        let mut records = Vec::new();
        loop {
            match reader.read_next() {
                Ok(Some(body)) => match minicbor::decode::<LoggedTxn>(&body) {
                    Ok(txn) => records.push(txn),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "commit log record undecodable, stopping replay");
                        break;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "commit log tail torn, stopping replay");
                    break;
                }
            }
        }
        Ok(records)
    }

    fn io_err(&self, source: std::io::Error) -> CommitLogError {
        CommitLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CommitLog for DiskLog {
    fn append(&mut self, txn: &LoggedTxn) -> Result<(), CommitLogError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let mut body = Vec::new();
        minicbor::encode(txn, &mut body).map_err(|e| CommitLogError::Encode(e.to_string()))?;
        let frame = encode_frame(&body, MAX_RECORD_BYTES)?;
        writer
            .write_all(&frame)
            .map_err(|source| CommitLogError::Io {
                path: self.path.clone(),
                source,
            })?;
        if self.flush_on_append {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CommitLogError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|source| CommitLogError::Io {
                path: self.path.clone(),
                source,
            })?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|source| CommitLogError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CommitLogError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|source| self.io_err(source))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|source| self.io_err(source))?;
        }
        Ok(())
    }
}
