//! Bounded FIFO channels carrying [`Record`]s between the producer and the
//! event loop.
//!
//! - [`mqueue::MessageQueue`] - named POSIX message queue (cross-process)
//! - [`memory::MemoryChannel`] - in-process queue with an eventfd readiness handle
//!
//! Both expose a readable file descriptor through [`AsFd`] that is
//! level-ready whenever the channel holds at least one record, so either can
//! be registered with the [`Multiplexer`](crate::runtime::Multiplexer).

pub mod memory;
pub mod mqueue;

use std::os::fd::AsFd;

use thiserror::Error;

use crate::record::Record;

pub use memory::MemoryChannel;
pub use mqueue::{MessageQueue, QueueAttr, QueueName};

/// Errors produced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is at capacity; the record was not enqueued.
    #[error("channel is full")]
    Full,
    /// The channel was empty when a receive was attempted.
    #[error("channel is empty")]
    WouldBlock,
    /// The queue name does not satisfy POSIX naming rules.
    #[error("invalid queue name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    /// Queue attributes are out of range.
    #[error("invalid queue attributes: {0}")]
    InvalidAttr(&'static str),
    /// An existing queue has a different record size than requested.
    #[error("queue `{name}` has record size {actual}, expected {expected}")]
    AttrMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// A system call failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    pub(crate) fn os(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            op,
            source: source.into(),
        }
    }
}

/// A bounded FIFO of records shared between a sending and a receiving context.
///
/// `send` never blocks: a full channel reports [`ChannelError::Full`] and is
/// left unchanged. `receive` never blocks either: it is meant to be called
/// after the descriptor reported readiness, and reports
/// [`ChannelError::WouldBlock`] if another consumer got there first.
pub trait Channel: AsFd + Send + Sync {
    /// Appends a record at the tail.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] at capacity; [`ChannelError::Os`] on syscall failure.
    fn send(&self, record: &Record) -> Result<(), ChannelError>;

    /// Removes and returns the record at the head.
    ///
    /// # Errors
    ///
    /// [`ChannelError::WouldBlock`] when empty; [`ChannelError::Os`] on syscall failure.
    fn receive(&self) -> Result<Record, ChannelError>;

    /// Current number of queued records.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Os`] if the occupancy cannot be queried.
    fn len(&self) -> Result<usize, ChannelError>;

    /// Maximum number of queued records.
    fn capacity(&self) -> usize;

    /// Returns `true` if no records are queued.
    ///
    /// # Errors
    ///
    /// See [`Channel::len`].
    fn is_empty(&self) -> Result<bool, ChannelError> {
        self.len().map(|n| n == 0)
    }
}
