//! Timer-driven record producer.
//!
//! On every timer expiry the producer sends a burst of `k + 1` records
//! (`NUM: 0` through `NUM: k`), with `k` drawn uniformly from
//! `[0, 2 * max_events]`. Bursts are not atomic: when the channel fills up
//! mid-burst, the remaining sends fail individually with
//! [`ChannelError::Full`], are logged, and the burst carries on.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::channel::{Channel, ChannelError};
use crate::config::{DEFAULT_MAX_EVENTS, DEFAULT_PERIOD};
use crate::record::{Record, TIMESTAMP_FORMAT};
use crate::timer::{INITIAL_DELAY, PeriodicTimer, TimerError, TimerState};
use crate::trace::{error, info, trace, warn};

/// Producer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Interval between bursts.
    pub period: Duration,
    /// Burst parameter: `k` is drawn from `[0, 2 * max_events]`.
    pub max_events: usize,
    /// Arm the timer during pipeline setup.
    pub start_enabled: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            max_events: DEFAULT_MAX_EVENTS,
            start_enabled: false,
        }
    }
}

/// Timer interval as configured in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl Interval {
    /// The all-zero value of a disarmed timer.
    pub const DISARMED: Self = Self {
        initial_delay: Duration::ZERO,
        period: Duration::ZERO,
    };
}

/// Snapshot of the producer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerState {
    pub enabled: bool,
    pub interval: Interval,
}

/// Outcome of one burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstReport {
    /// Records enqueued.
    pub sent: usize,
    /// Records rejected because the channel was full.
    pub full: usize,
    /// Records lost to other errors.
    pub failed: usize,
}

impl BurstReport {
    /// Total records attempted.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.sent + self.full + self.failed
    }
}

/// Draws the burst bound `k`, uniform in `[0, 2 * max_events]`.
pub fn draw_burst_len<R: Rng>(rng: &mut R, max_events: usize) -> usize {
    rng.gen_range(0..=max_events.saturating_mul(2))
}

/// Sends records `NUM: 0` through `NUM: k` stamped with `timestamp`.
///
/// Per-record failures are logged and counted; they never abort the burst.
pub fn emit_burst<C: Channel + ?Sized>(channel: &C, k: usize, timestamp: &str) -> BurstReport {
    let mut report = BurstReport::default();
    for i in 0..=k {
        let record = match Record::numbered(i, timestamp) {
            Ok(record) => record,
            Err(_e) => {
                error!(seq = i, error = %_e, "record does not fit");
                report.failed += 1;
                continue;
            }
        };
        match channel.send(&record) {
            Ok(()) => report.sent += 1,
            Err(ChannelError::Full) => {
                warn!(seq = i, k, "channel full, record dropped");
                report.full += 1;
            }
            Err(_e) => {
                error!(seq = i, error = %_e, "send failed");
                report.failed += 1;
            }
        }
    }
    trace!(k, sent = report.sent, full = report.full, "burst done");
    report
}

/// The timer-driven producer.
///
/// Owns its [`PeriodicTimer`]; the timer callback owns the channel handle.
/// Toggling requires `&mut self`, so only the owner of the producer (the
/// event loop context) can change its state.
pub struct Producer<C: Channel + 'static> {
    timer: PeriodicTimer,
    config: ProducerConfig,
    _channel: PhantomData<Arc<C>>,
}

impl<C: Channel + 'static> Producer<C> {
    /// Creates a disarmed producer feeding `channel`.
    ///
    /// `config.start_enabled` is not applied here; see
    /// [`Pipeline`](crate::runtime::Pipeline).
    ///
    /// # Errors
    ///
    /// Returns a [`TimerError`] if the timer cannot be created.
    pub fn new(channel: Arc<C>, config: ProducerConfig) -> Result<Self, TimerError> {
        let max_events = config.max_events;
        let timer = PeriodicTimer::spawn(move || {
            let k = draw_burst_len(&mut rand::thread_rng(), max_events);
            let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
            emit_burst(&*channel, k, &timestamp);
        })?;

        Ok(Self {
            timer,
            config,
            _channel: PhantomData,
        })
    }

    /// Flips between armed and disarmed, returning the new `enabled` state.
    ///
    /// Disabling waits for an in-flight burst to complete; no burst starts
    /// after this returns.
    ///
    /// # Errors
    ///
    /// Returns the [`TimerError`] if the timer cannot be reconfigured; the
    /// producer keeps its previous state.
    pub fn toggle(&mut self) -> Result<bool, TimerError> {
        if self.is_enabled() {
            self.timer.disarm()?;
        } else {
            self.timer.arm(self.config.period)?;
        }
        let enabled = self.is_enabled();
        info!(enabled, "producer toggled");
        Ok(enabled)
    }

    /// Returns `true` while the timer is armed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.timer.state().is_armed()
    }

    /// Current enabled flag and interval.
    #[must_use]
    pub fn state(&self) -> ProducerState {
        match self.timer.state() {
            TimerState::Disarmed => ProducerState {
                enabled: false,
                interval: Interval::DISARMED,
            },
            TimerState::Armed { period } => ProducerState {
                enabled: true,
                interval: Interval {
                    initial_delay: INITIAL_DELAY,
                    period,
                },
            },
        }
    }
}
