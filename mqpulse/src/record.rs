//! Fixed-size timestamped records carried by the channel.

use std::borrow::Cow;
use std::fmt;
use std::io::Write;

use thiserror::Error;

use crate::config::RECORD_SIZE;

/// Timestamp layout used in record payloads.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors building a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The payload plus its NUL terminator does not fit in a record.
    #[error("payload of {len} bytes does not fit a {max}-byte record", max = RECORD_SIZE)]
    TooLong { len: usize },
}

/// One message on the channel: a NUL-terminated text payload in a
/// `RECORD_SIZE` buffer.
///
/// Records are always sent as the full buffer. `len` is the number of bytes
/// the transport delivered on receive, which may be shorter than the buffer
/// (or zero) if a foreign writer put a short message on the queue.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Record {
    bytes: [u8; RECORD_SIZE],
    len: usize,
}

impl Record {
    /// Builds a full-size record from a text payload.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::TooLong`] if `text` plus the terminator exceeds
    /// `RECORD_SIZE`.
    pub fn from_text(text: &str) -> Result<Self, RecordError> {
        if text.len() >= RECORD_SIZE {
            return Err(RecordError::TooLong { len: text.len() + 1 });
        }
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self {
            bytes,
            len: RECORD_SIZE,
        })
    }

    /// Builds the producer's `"NUM: <seq> now: <timestamp>"` record.
    ///
    /// Formats straight into the buffer; no heap allocation on the
    /// callback path.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::TooLong`] if the formatted payload does not fit.
    pub fn numbered(seq: usize, timestamp: &str) -> Result<Self, RecordError> {
        let mut bytes = [0u8; RECORD_SIZE];
        // Leave the last byte for the terminator.
        let mut cursor = &mut bytes[..RECORD_SIZE - 1];
        if write!(cursor, "NUM: {seq} now: {timestamp}").is_err() {
            // Cold path: measure the payload for the error.
            let len = format!("NUM: {seq} now: {timestamp}").len() + 1;
            return Err(RecordError::TooLong { len });
        }
        Ok(Self {
            bytes,
            len: RECORD_SIZE,
        })
    }

    /// Copies a received message into a record.
    ///
    /// Messages shorter than `RECORD_SIZE` are zero-padded; longer input is
    /// truncated to the buffer size.
    #[must_use]
    pub fn from_received(data: &[u8]) -> Self {
        let len = data.len().min(RECORD_SIZE);
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { bytes, len }
    }

    /// The full wire buffer.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.bytes
    }

    /// Number of bytes delivered by the transport.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the transport delivered an empty message.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload text up to the first NUL within the delivered bytes.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        let delivered = &self.bytes[..self.len];
        let end = delivered.iter().position(|&b| b == 0).unwrap_or(delivered.len());
        String::from_utf8_lossy(&delivered[..end])
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("len", &self.len)
            .field("text", &self.text())
            .finish()
    }
}
