//! Runtime configuration and the pipeline's well-known constants.

use std::time::Duration;

use clap::Parser;

use crate::channel::mqueue::QueueAttr;
use crate::producer::ProducerConfig;

/// Size in bytes of every record on the wire, terminator included.
pub const RECORD_SIZE: usize = 64;

/// Default name of the POSIX message queue.
pub const DEFAULT_QUEUE_NAME: &str = "/ExampleMQ";

/// Default maximum queue depth.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default producer period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// Default burst parameter: each burst holds `1..=2 * DEFAULT_MAX_EVENTS + 1` records.
pub const DEFAULT_MAX_EVENTS: usize = 50;

/// Control byte that toggles the producer (line feed).
pub const TRIGGER_BYTE: u8 = b'\n';

/// Command line configuration for the `mqpulse` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "mqpulse")]
#[command(about = "Timer-driven producer feeding a POSIX message queue, drained by epoll")]
#[command(long_about = "Press Enter to toggle the producer on and off. Runs until killed.")]
pub struct Config {
    /// Message queue name (must start with '/')
    #[arg(long, default_value = DEFAULT_QUEUE_NAME)]
    pub queue: String,

    /// Maximum number of records held by the queue
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Producer period in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub period_ms: u64,

    /// Burst size parameter: each tick sends between 1 and 2*N+1 records
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_EVENTS)]
    pub max_events: usize,

    /// Start with the producer armed
    #[arg(long)]
    pub enabled: bool,

    /// Unlink a leftover queue with the same name before opening
    #[arg(long)]
    pub fresh: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            period_ms: DEFAULT_PERIOD.as_millis() as u64,
            max_events: DEFAULT_MAX_EVENTS,
            enabled: false,
            fresh: false,
        }
    }
}

impl Config {
    /// Producer settings derived from the command line.
    #[must_use]
    pub fn producer(&self) -> ProducerConfig {
        ProducerConfig {
            period: Duration::from_millis(self.period_ms),
            max_events: self.max_events,
            start_enabled: self.enabled,
        }
    }

    /// Queue attributes derived from the command line.
    #[must_use]
    pub const fn queue_attr(&self) -> QueueAttr {
        QueueAttr {
            capacity: self.capacity,
            record_size: RECORD_SIZE,
        }
    }
}
