//! Message framing (magic + length + crc32c).

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

const FRAME_MAGIC: u32 = 0x5343_5431; // "SCT1"
pub const FRAME_HEADER_LEN: usize = 12;

/// Upper bound on a single frame body. A fetch reply carries whole object
/// states, so this is generous; anything larger indicates a runaway encoder
/// or a corrupt stream.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame magic mismatch: got {got:#010x}")]
    MagicMismatch { got: u32 },
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame body. `Ok(None)` on a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::MagicMismatch { got: magic });
        }

        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            read_body += n;
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::CrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::LengthInvalid {
            reason: "frame payload cannot be empty".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip_validates_crc() {
        let payload = b"hello";
        let frame = encode_frame(payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let decoded = reader.read_next().unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn corrupt_body_is_detected() {
        let mut frame = encode_frame(b"hello", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut frame = encode_frame(b"hello", 1024).unwrap();
        frame[0] ^= 0xff;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn oversize_frame_is_rejected_on_both_sides() {
        let payload = vec![0u8; 10];
        assert!(matches!(
            encode_frame(&payload, 5),
            Err(FrameError::TooLarge { .. })
        ));

        let frame = encode_frame(&payload, 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 5);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn clean_eof_returns_none() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()), 1024);
        assert!(reader.read_next().unwrap().is_none());
    }
}
