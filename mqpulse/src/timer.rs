//! Periodic timer running a callback on its own thread.
//!
//! # Architecture
//!
//! ```text
//!  main loop                       worker thread ("mqpulse-timer")
//!  ─────────                       ───────────────────────────────
//!  arm(period) ──timerfd_settime──> read(timerfd) wakes on expiry
//!                                   lock schedule
//!                                   armed? ── no ──> skip
//!                                     │ yes
//!                                   callback()     (lock held)
//!  disarm() ───lock schedule──────> (waits for in-flight callback)
//!              timerfd_settime(0)
//!              armed = false
//! ```
//!
//! The worker re-checks the armed flag under the same lock `disarm` takes,
//! and keeps that lock for the duration of the callback. Hence once
//! `disarm` returns no callback is running and none can start, even if an
//! expiry was already read from the timerfd.

use std::os::fd::OwnedFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustix::io::{self as rio, Errno};
use rustix::time::{
    Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags, Timespec, timerfd_create,
    timerfd_settime,
};
use thiserror::Error;

use crate::trace::{debug, error, trace};

/// Delay before the first expiry after arming.
pub const INITIAL_DELAY: Duration = Duration::from_nanos(1);

/// Errors from timer setup and (re)configuration.
#[derive(Debug, Error)]
pub enum TimerError {
    /// `timerfd_create` failed.
    #[error("failed to create timer: {0}")]
    Create(#[source] Errno),
    /// The worker thread could not be spawned.
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// `timerfd_settime` failed; the timer state is unchanged.
    #[error("failed to {op} timer: {source}")]
    Settime {
        op: &'static str,
        #[source]
        source: Errno,
    },
    /// A zero period would make the timer one-shot.
    #[error("timer period must be non-zero")]
    ZeroPeriod,
}

/// Observable timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No expiries are scheduled.
    Disarmed,
    /// Fires after [`INITIAL_DELAY`], then every `period`.
    Armed { period: Duration },
}

impl TimerState {
    /// Returns `true` if armed.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        matches!(self, Self::Armed { .. })
    }
}

/// State shared between the controlling handle and the worker thread.
struct Shared {
    timerfd: OwnedFd,
    schedule: Mutex<TimerState>,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settime(&self, op: &'static str, value: Duration, interval: Duration) -> Result<(), TimerError> {
        let spec = Itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };
        timerfd_settime(&self.timerfd, TimerfdTimerFlags::empty(), &spec)
            .map(|_| ())
            .map_err(|source| TimerError::Settime { op, source })
    }
}

fn timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// A cancelable periodic timer backed by a Linux `timerfd`.
///
/// Starts disarmed. The callback runs on a dedicated worker thread,
/// concurrently with the caller; it must handle its own failures.
/// A panicking callback is caught and logged, and the timer stays armed.
pub struct PeriodicTimer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Creates the timer and spawns its worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Create`] if the timerfd cannot be created, or
    /// [`TimerError::Spawn`] if the thread cannot be started.
    pub fn spawn<F>(mut callback: F) -> Result<Self, TimerError>
    where
        F: FnMut() + Send + 'static,
    {
        let timerfd = timerfd_create(TimerfdClockId::Monotonic, TimerfdFlags::CLOEXEC)
            .map_err(TimerError::Create)?;

        let shared = Arc::new(Shared {
            timerfd,
            schedule: Mutex::new(TimerState::Disarmed),
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("mqpulse-timer".into())
            .spawn(move || {
                debug!("timer thread started");
                run_worker(&worker_shared, &mut callback);
                debug!("timer thread exiting");
            })
            .map_err(TimerError::Spawn)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Arms the timer: first expiry after [`INITIAL_DELAY`], then every `period`.
    ///
    /// Arming an already armed timer is a no-op.
    ///
    /// # Errors
    ///
    /// [`TimerError::ZeroPeriod`] for a zero period; [`TimerError::Settime`]
    /// if the kernel rejects the setting. The state is unchanged on error.
    pub fn arm(&self, period: Duration) -> Result<(), TimerError> {
        if period.is_zero() {
            return Err(TimerError::ZeroPeriod);
        }
        let mut state = self.shared.lock();
        if state.is_armed() {
            return Ok(());
        }
        self.shared.settime("arm", INITIAL_DELAY, period)?;
        *state = TimerState::Armed { period };
        debug!(period_ms = period.as_millis() as u64, "timer armed");
        Ok(())
    }

    /// Disarms the timer.
    ///
    /// Waits for an in-flight callback to finish. After this returns, no
    /// callback runs until the timer is armed again.
    ///
    /// # Errors
    ///
    /// [`TimerError::Settime`] if the kernel rejects the setting; the timer
    /// stays armed in that case.
    pub fn disarm(&self) -> Result<(), TimerError> {
        let mut state = self.shared.lock();
        if !state.is_armed() {
            return Ok(());
        }
        self.shared.settime("disarm", Duration::ZERO, Duration::ZERO)?;
        *state = TimerState::Disarmed;
        debug!("timer disarmed");
        Ok(())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        *self.shared.lock()
    }
}

fn run_worker(shared: &Shared, callback: &mut dyn FnMut()) {
    let mut expirations = [0u8; 8];
    loop {
        match rio::read(&shared.timerfd, &mut expirations[..]) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(e) => {
                error!(error = %e, "timerfd read failed; timer thread stopping");
                return;
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let state = shared.lock();
        if !state.is_armed() {
            // Expiry raced with disarm.
            trace!("skipping expiry of disarmed timer");
            continue;
        }
        let missed = u64::from_ne_bytes(expirations).saturating_sub(1);
        if missed > 0 {
            trace!(missed, "timer overrun");
        }
        if catch_unwind(AssertUnwindSafe(&mut *callback)).is_err() {
            error!("timer callback panicked");
        }
        drop(state);
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // Wake the worker out of its blocking read with a one-shot expiry.
        {
            let mut state = self.shared.lock();
            if let Err(_e) = self.shared.settime("wake", INITIAL_DELAY, Duration::ZERO) {
                error!(error = %_e, "failed to wake timer thread; detaching it");
                return;
            }
            *state = TimerState::Disarmed;
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
