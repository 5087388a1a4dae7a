//! Operator control input.
//!
//! The control stream is read one byte per readiness notification straight
//! from the descriptor. Going through [`std::io::Stdin`] would pull whole
//! lines into a user-space buffer that epoll cannot see, and the bytes
//! after the first would never wake the loop.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};

use rustix::io::{self as rio, Errno};

use crate::config::TRIGGER_BYTE;

/// What a control byte asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Flip the producer between enabled and disabled.
    Toggle,
    /// Not a command; dropped silently.
    Ignore,
}

/// Maps a control byte to its action: line feed toggles, anything else is ignored.
#[must_use]
pub const fn interpret(byte: u8) -> ControlAction {
    if byte == TRIGGER_BYTE {
        ControlAction::Toggle
    } else {
        ControlAction::Ignore
    }
}

/// A byte-at-a-time reader over a control descriptor.
#[derive(Debug)]
pub struct ControlInput<F> {
    fd: F,
}

impl<F: AsFd> ControlInput<F> {
    pub const fn new(fd: F) -> Self {
        Self { fd }
    }

    /// Reads exactly one byte.
    ///
    /// Returns `Ok(None)` at end of input. Interrupted reads are retried.
    ///
    /// # Errors
    ///
    /// Any other read failure, including `WouldBlock` on a non-blocking
    /// descriptor with nothing to read.
    pub fn read_trigger(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match rio::read(&self.fd, &mut byte[..]) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<F: AsFd> AsFd for ControlInput<F> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
