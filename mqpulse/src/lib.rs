//! Timer-driven producer feeding a bounded channel, drained by an epoll loop.
//!
//! A [`PeriodicTimer`](timer::PeriodicTimer) fires bursts of fixed-size
//! [`Record`](record::Record)s into a [`Channel`](channel::Channel), by
//! default a POSIX message queue. A single-threaded
//! [`Pipeline`](runtime::Pipeline) waits on the channel and on standard
//! input: every record is printed as it arrives, and every line feed on
//! standard input toggles the producer.
//!
//! Linux only: the loop is built on `epoll`, `timerfd` and `eventfd`.

pub mod channel;
pub mod config;
pub mod control;
pub mod producer;
pub mod record;
pub mod runtime;
pub mod timer;
pub(crate) mod trace;

pub use channel::{Channel, ChannelError};
pub use config::Config;
pub use runtime::{Pipeline, PipelineError, SetupError};
pub use trace::init_tracing;
