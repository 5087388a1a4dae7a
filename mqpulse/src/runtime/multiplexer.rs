//! Readiness multiplexer over Linux epoll.
//!
//! Sources are registered level-triggered for `EPOLLIN` under a [`Token`]
//! and routed by token through a map, never by position in the ready list.
//! Level triggering matters for the control input: one byte is consumed per
//! notification and epoll keeps reporting the descriptor while bytes remain.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use rustix::buffer::spare_capacity;
use rustix::event::epoll::{self, CreateFlags, Event, EventData, EventFlags};
use rustix::io::Errno;
use rustix::time::Timespec;

use crate::trace::{debug, trace};

/// Opaque identity of a registration. Allocated monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// What kind of source a registration is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Channel,
    Control,
}

/// Returned by a handler to keep or drop its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Deregister,
}

/// A pollable descriptor with a handler, dispatched with a mutable context.
pub trait EventSource<Ctx>: AsFd {
    fn kind(&self) -> SourceKind;

    /// Handles one readiness notification.
    ///
    /// Runs to completion on the loop thread; must not block.
    fn on_ready(&mut self, ctx: &mut Ctx) -> Disposition;
}

/// An epoll instance plus its dispatch table.
pub struct Multiplexer<Ctx> {
    epoll: OwnedFd,
    sources: HashMap<Token, Box<dyn EventSource<Ctx>>>,
    next_token: u64,
    events: Vec<Event>,
}

impl<Ctx> Multiplexer<Ctx> {
    /// Creates an empty multiplexer.
    ///
    /// # Errors
    ///
    /// Returns the `epoll_create1` failure.
    pub fn new() -> io::Result<Self> {
        let epoll = epoll::create(CreateFlags::CLOEXEC)?;
        Ok(Self {
            epoll,
            sources: HashMap::new(),
            next_token: 0,
            events: Vec::new(),
        })
    }

    /// Registers `source` for level-triggered read readiness.
    ///
    /// # Errors
    ///
    /// Returns the `epoll_ctl` failure; the source is dropped.
    pub fn register(&mut self, source: Box<dyn EventSource<Ctx>>) -> io::Result<Token> {
        let token = Token(self.next_token);
        epoll::add(
            &self.epoll,
            source.as_fd(),
            EventData::new_u64(token.0),
            EventFlags::IN,
        )?;
        self.next_token += 1;
        debug!(token = token.0, kind = ?source.kind(), "source registered");
        self.sources.insert(token, source);
        Ok(token)
    }

    /// Removes a registration, returning its source.
    ///
    /// Returns `None` for an unknown token.
    pub fn deregister(&mut self, token: Token) -> Option<Box<dyn EventSource<Ctx>>> {
        let source = self.sources.remove(&token)?;
        // The descriptor is still open here, so removal only fails if the
        // kernel already forgot it.
        if let Err(_e) = epoll::delete(&self.epoll, source.as_fd()) {
            debug!(token = token.0, error = %_e, "epoll delete failed");
        }
        debug!(token = token.0, kind = ?source.kind(), "source deregistered");
        Some(source)
    }

    /// Blocks until at least one source is ready or `timeout` elapses.
    ///
    /// Returns the ready tokens in kernel order. The list is empty only when
    /// a timeout elapsed. Interrupted waits are retried.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when waiting forever with nothing registered; any
    /// other `epoll_wait` failure.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Token>> {
        if self.sources.is_empty() && timeout.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "waiting forever with no registered sources",
            ));
        }
        let timeout = timeout.map(|d| Timespec {
            tv_sec: d.as_secs() as _,
            tv_nsec: d.subsec_nanos() as _,
        });

        self.events.clear();
        self.events.reserve(self.sources.len().max(1));
        loop {
            match epoll::wait(&self.epoll, spare_capacity(&mut self.events), timeout.as_ref()) {
                Ok(_) => break,
                Err(Errno::INTR) => {
                    trace!("epoll_wait interrupted; retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self
            .events
            .iter()
            .map(|event| {
                let data = event.data;
                Token(data.u64())
            })
            .collect())
    }

    /// Runs the handler of each ready token once, in the given order.
    ///
    /// Tokens deregistered earlier in the same batch are skipped. Returns the
    /// number of handlers run.
    pub fn dispatch(&mut self, ready: &[Token], ctx: &mut Ctx) -> usize {
        let mut dispatched = 0;
        for &token in ready {
            let Some(source) = self.sources.get_mut(&token) else {
                trace!(token = token.0, "skipping stale token");
                continue;
            };
            dispatched += 1;
            if source.on_ready(ctx) == Disposition::Deregister {
                self.deregister(token);
            }
        }
        dispatched
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Kind of the source behind `token`, if registered.
    #[must_use]
    pub fn kind(&self, token: Token) -> Option<SourceKind> {
        self.sources.get(&token).map(|source| source.kind())
    }
}
