//! POSIX message queue channel.
//!
//! Wraps `mq_open`/`mq_send`/`mq_receive` in a safe [`Channel`]. The queue
//! descriptor is opened non-blocking: a full queue turns `send` into
//! [`ChannelError::Full`] and an empty one turns `receive` into
//! [`ChannelError::WouldBlock`]. Blocking happens only in the event loop's
//! `epoll_wait`.
//!
//! ```text
//! POSIX call:                 Safe wrapper:
//! ┌──────────────────┐        ┌─────────────────────────┐
//! │ mq_open()        │───────>│ MessageQueue::open()    │
//! │ mq_send()        │───────>│ Channel::send()         │
//! │ mq_receive()     │───────>│ Channel::receive()      │
//! │ mq_getattr()     │───────>│ Channel::len()          │
//! │ mq_close()       │───────>│ Drop::drop()            │
//! │ mq_unlink()      │───────>│ MessageQueue::unlink()  │
//! └──────────────────┘        └─────────────────────────┘
//! ```
//!
//! On Linux a message queue descriptor is a file descriptor, so the queue can
//! be registered with epoll directly; it polls readable while messages are
//! queued.
//!
//! The kernel object outlives the descriptor: dropping a [`MessageQueue`]
//! closes it but leaves the name in place, so a restarted process reopens the
//! same queue. Use [`MessageQueue::unlink`] to start from scratch.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr;

use super::{Channel, ChannelError};
use crate::config::RECORD_SIZE;
use crate::record::Record;
use crate::trace::{debug, info, warn};

const POSIX_NAME_MAX: usize = 255;

/// Permission bits for newly created queues (`rw-r--r--`).
const QUEUE_MODE: libc::mode_t = 0o644;

/// A validated POSIX message queue name.
///
/// POSIX requires a leading `/` and no further slashes; Linux additionally
/// caps the name at `NAME_MAX` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueName {
    name: String,
    c_name: CString,
}

impl QueueName {
    /// Validates and wraps a queue name.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidName`] if `name` does not start with `/`,
    /// contains another `/`, contains a NUL byte, or exceeds 255 bytes.
    pub fn new(name: impl Into<String>) -> Result<Self, ChannelError> {
        let name = name.into();
        let invalid = |reason| ChannelError::InvalidName {
            name: name.clone(),
            reason,
        };

        if !name.starts_with('/') {
            return Err(invalid("name must start with '/'"));
        }
        if name.len() == 1 {
            return Err(invalid("name must not be empty after '/'"));
        }
        if name[1..].contains('/') {
            return Err(invalid("name must not contain additional '/' characters"));
        }
        if name.len() > POSIX_NAME_MAX {
            return Err(invalid("name length must be <= 255 bytes"));
        }
        let c_name = CString::new(name.clone()).map_err(|_| invalid("name must not contain NUL"))?;

        Ok(Self { name, c_name })
    }

    /// The name as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueName({:?})", self.name)
    }
}

/// Requested queue geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttr {
    /// Maximum number of queued records (`mq_maxmsg`).
    pub capacity: usize,
    /// Size of every message in bytes (`mq_msgsize`); must equal `RECORD_SIZE`.
    pub record_size: usize,
}

impl QueueAttr {
    /// Attributes for `capacity` records of `RECORD_SIZE` bytes.
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            record_size: RECORD_SIZE,
        }
    }

    fn validate(&self) -> Result<(), ChannelError> {
        if self.capacity == 0 {
            return Err(ChannelError::InvalidAttr("capacity must be > 0"));
        }
        if self.record_size != RECORD_SIZE {
            return Err(ChannelError::InvalidAttr(
                "record size must match the fixed record size",
            ));
        }
        Ok(())
    }
}

/// A named, bounded POSIX message queue of [`Record`]s.
///
/// `MessageQueue` is `Send + Sync`: the kernel serializes concurrent
/// `mq_send`/`mq_receive` calls, and every message moves as one unit, so a
/// receiver never observes a partially written record.
pub struct MessageQueue {
    mqd: libc::mqd_t,
    name: QueueName,
    attr: QueueAttr,
}

impl MessageQueue {
    /// Opens the queue, creating it if absent.
    ///
    /// Opening is idempotent: if the queue already exists its attributes are
    /// kept. An existing queue with a different message size is rejected
    /// because records could not be received from it; a different capacity
    /// is adopted.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::InvalidAttr`] if `attr` is out of range
    /// - [`ChannelError::Os`] if `mq_open` fails (e.g. `EINVAL` when the
    ///   capacity exceeds `/proc/sys/fs/mqueue/msg_max` for an unprivileged
    ///   user, `EACCES`, `EMFILE`, `ENOSYS`)
    /// - [`ChannelError::AttrMismatch`] if an existing queue has another message size
    pub fn open(name: QueueName, attr: QueueAttr) -> Result<Self, ChannelError> {
        attr.validate()?;

        // SAFETY: mq_attr is a plain C struct; all-zero is a valid value and
        // the padding fields must stay zero.
        let mut requested: libc::mq_attr = unsafe { std::mem::zeroed() };
        requested.mq_maxmsg = attr.capacity as _;
        requested.mq_msgsize = attr.record_size as _;

        // SAFETY: `c_name` is a valid NUL-terminated string that outlives the
        // call; `requested` is a valid mq_attr. The variadic arguments match
        // what mq_open reads when O_CREAT is set (mode, then attr pointer).
        let mqd = unsafe {
            libc::mq_open(
                name.c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_NONBLOCK,
                QUEUE_MODE,
                &mut requested as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            let err = io::Error::last_os_error();
            warn!(queue = %name, capacity = attr.capacity, error = %err, "mq_open failed");
            return Err(ChannelError::os("mq_open", err));
        }

        let mut queue = Self { mqd, name, attr };

        // Read back: an existing queue keeps its original attributes.
        let actual = queue.attributes()?;
        let actual_size = actual.mq_msgsize as usize;
        if actual_size != attr.record_size {
            return Err(ChannelError::AttrMismatch {
                name: queue.name.to_string(),
                expected: attr.record_size,
                actual: actual_size,
            });
        }
        let actual_capacity = actual.mq_maxmsg as usize;
        if actual_capacity != attr.capacity {
            warn!(
                queue = %queue.name,
                requested = attr.capacity,
                actual = actual_capacity,
                "queue already exists with a different capacity; using existing"
            );
            queue.attr.capacity = actual_capacity;
        }

        info!(
            queue = %queue.name,
            capacity = queue.attr.capacity,
            record_size = queue.attr.record_size,
            queued = actual.mq_curmsgs as usize,
            "message queue open"
        );
        Ok(queue)
    }

    /// Removes a queue name from the system.
    ///
    /// Returns `Ok(false)` if no queue with that name existed. Open
    /// descriptors stay valid; the kernel frees the queue once they close.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Os`] if `mq_unlink` fails for another reason.
    pub fn unlink(name: &QueueName) -> Result<bool, ChannelError> {
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let rc = unsafe { libc::mq_unlink(name.c_name.as_ptr()) };
        if rc == 0 {
            debug!(queue = %name, "unlinked message queue");
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(ChannelError::os("mq_unlink", err))
        }
    }

    /// The queue's name.
    #[must_use]
    pub const fn name(&self) -> &QueueName {
        &self.name
    }

    /// The queue's effective attributes.
    #[must_use]
    pub const fn attr(&self) -> QueueAttr {
        self.attr
    }

    fn attributes(&self) -> Result<libc::mq_attr, ChannelError> {
        // SAFETY: see `open`.
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        // SAFETY: `mqd` is an open queue descriptor owned by `self`; `attr`
        // is a valid out-pointer.
        let rc = unsafe { libc::mq_getattr(self.mqd, &mut attr) };
        if rc == -1 {
            return Err(ChannelError::os("mq_getattr", io::Error::last_os_error()));
        }
        Ok(attr)
    }
}

impl Channel for MessageQueue {
    fn send(&self, record: &Record) -> Result<(), ChannelError> {
        let bytes = record.as_bytes();
        // SAFETY: `bytes` is valid for `RECORD_SIZE` reads, which equals the
        // queue's message size (checked in `open`).
        let rc = unsafe { libc::mq_send(self.mqd, bytes.as_ptr().cast(), bytes.len(), 0) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Err(ChannelError::Full),
            _ => Err(ChannelError::os("mq_send", err)),
        }
    }

    fn receive(&self) -> Result<Record, ChannelError> {
        let mut buf = [0u8; RECORD_SIZE];
        // SAFETY: `buf` is valid for `RECORD_SIZE` writes, which is at least
        // the queue's message size (checked in `open`). A null priority
        // pointer is allowed.
        let n = unsafe {
            libc::mq_receive(self.mqd, buf.as_mut_ptr().cast(), buf.len(), ptr::null_mut())
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Err(ChannelError::WouldBlock),
                _ => Err(ChannelError::os("mq_receive", err)),
            };
        }
        Ok(Record::from_received(&buf[..n as usize]))
    }

    fn len(&self) -> Result<usize, ChannelError> {
        self.attributes().map(|attr| attr.mq_curmsgs as usize)
    }

    fn capacity(&self) -> usize {
        self.attr.capacity
    }
}

impl AsFd for MessageQueue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: on Linux `mqd_t` is a file descriptor. It stays open until
        // `self` is dropped, which the borrow's lifetime enforces.
        unsafe { BorrowedFd::borrow_raw(self.mqd) }
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("mqd", &self.mqd)
            .field("name", &self.name)
            .field("attr", &self.attr)
            .finish()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        // SAFETY: `mqd` is open and owned by `self`; it is not used again.
        unsafe {
            let _ = libc::mq_close(self.mqd);
        }
    }
}
