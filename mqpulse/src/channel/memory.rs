//! In-process bounded channel with a pollable readiness descriptor.
//!
//! # Differences from [`super::mqueue`]
//!
//! - No kernel queue: records live in a heap `VecDeque` behind a mutex
//! - No name, no privileges: works where POSIX message queues are disabled
//!   or limited (containers, CI)
//! - Readiness comes from a semaphore `eventfd` whose counter mirrors the
//!   queue length, so epoll sees the same level-triggered behavior as for a
//!   message queue descriptor

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustix::event::{EventfdFlags, eventfd};
use rustix::io::{self as rio, Errno};

use super::{Channel, ChannelError};
use crate::record::Record;

/// A bounded in-process FIFO implementing [`Channel`].
///
/// Every push writes `1` to the eventfd and every pop reads `1` back
/// (`EFD_SEMAPHORE`), both under the queue lock, so the counter always equals
/// the number of queued records. The descriptor is therefore readable exactly
/// while the channel is non-empty.
#[derive(Debug)]
pub struct MemoryChannel {
    queue: Mutex<VecDeque<Record>>,
    ready: OwnedFd,
    capacity: usize,
}

impl MemoryChannel {
    /// Creates an empty channel holding at most `capacity` records.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidAttr`] if `capacity` is zero
    /// - [`ChannelError::Os`] if the eventfd cannot be created
    pub fn new(capacity: usize) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::InvalidAttr("capacity must be > 0"));
        }
        let ready = eventfd(
            0,
            EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK | EventfdFlags::SEMAPHORE,
        )
        .map_err(|e| ChannelError::os("eventfd", e))?;

        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            ready,
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Record>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for MemoryChannel {
    fn send(&self, record: &Record) -> Result<(), ChannelError> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(ChannelError::Full);
        }
        rio::write(&self.ready, &1u64.to_ne_bytes()).map_err(|e| ChannelError::os("write", e))?;
        queue.push_back(*record);
        Ok(())
    }

    fn receive(&self) -> Result<Record, ChannelError> {
        let mut queue = self.lock();
        if queue.is_empty() {
            return Err(ChannelError::WouldBlock);
        }
        let mut counter = [0u8; 8];
        match rio::read(&self.ready, &mut counter[..]) {
            Ok(_) => {}
            Err(Errno::AGAIN) => return Err(ChannelError::WouldBlock),
            Err(e) => return Err(ChannelError::os("read", e)),
        }
        queue.pop_front().ok_or(ChannelError::WouldBlock)
    }

    fn len(&self) -> Result<usize, ChannelError> {
        Ok(self.lock().len())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl AsFd for MemoryChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.ready.as_fd()
    }
}
