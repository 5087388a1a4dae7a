//! The producer/consumer pipeline and its event loop.
//!
//! # Architecture
//!
//! ```text
//!  timer thread                  kernel                 loop thread
//!  ────────────                  ──────                 ───────────
//!  Producer::emit_burst ──send──> channel ──EPOLLIN──> ChannelSource: drain
//!                                 stdin   ──EPOLLIN──> ControlSource: 1 byte
//!                                                        '\n' => Producer::toggle
//! ```
//!
//! The loop owns a [`Context`] (producer, console, counters) and hands it by
//! `&mut` to whichever handler is ready. Only the loop thread toggles the
//! producer; only the timer thread sends; the channel is the one shared
//! resource.

use std::convert::Infallible;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::console::Console;
use super::multiplexer::{Disposition, EventSource, Multiplexer, SourceKind, Token};
use crate::channel::mqueue::{MessageQueue, QueueName};
use crate::channel::{Channel, ChannelError};
use crate::config::Config;
use crate::control::{ControlAction, ControlInput, interpret};
use crate::producer::{Producer, ProducerConfig};
use crate::timer::TimerError;
use crate::trace::{debug, error, info, trace, warn};

/// Fatal errors while assembling the pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("message queue setup failed: {0}")]
    Queue(#[from] ChannelError),
    #[error("failed to create multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("timer setup failed: {0}")]
    Timer(#[from] TimerError),
    #[error("failed to register {kind:?} source: {source}")]
    Register {
        kind: SourceKind,
        #[source]
        source: io::Error,
    },
}

/// Errors that end [`Pipeline::run`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("event wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Completed waits, including ones that timed out.
    pub wait_cycles: u64,
    /// Ready notifications dispatched.
    pub ready_events: u64,
    pub records_received: u64,
    /// Channel notifications that found the channel empty.
    pub spurious_wakeups: u64,
    pub receive_errors: u64,
    pub toggles: u64,
    pub toggle_failures: u64,
    /// Control bytes other than the trigger.
    pub ignored_control_bytes: u64,
}

/// State owned by the loop and lent to handlers.
pub struct Context<C: Channel + 'static> {
    pub producer: Producer<C>,
    pub console: Console,
    pub stats: Stats,
}

/// Drains the channel on readiness and prints every record.
///
/// One notification takes at most `capacity()` records. Whatever is left
/// keeps the descriptor ready, so the control input is served in between.
pub struct ChannelSource<C> {
    channel: Arc<C>,
}

impl<C: Channel> ChannelSource<C> {
    pub const fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: Channel> AsFd for ChannelSource<C> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.channel.as_fd()
    }
}

impl<C: Channel + 'static> EventSource<Context<C>> for ChannelSource<C> {
    fn kind(&self) -> SourceKind {
        SourceKind::Channel
    }

    fn on_ready(&mut self, ctx: &mut Context<C>) -> Disposition {
        let limit = self.channel.capacity() as u64;
        let mut drained = 0u64;
        while drained < limit {
            match self.channel.receive() {
                Ok(record) => {
                    drained += 1;
                    ctx.console.line(format_args!("{} bytes read.", record.len()));
                    ctx.console.line(format_args!("Read '{}'", record.text()));
                }
                Err(ChannelError::WouldBlock) => {
                    if drained == 0 {
                        ctx.stats.spurious_wakeups += 1;
                        ctx.console.line(format_args!("channel empty despite readiness"));
                        debug!("spurious channel readiness");
                    }
                    break;
                }
                Err(_e) => {
                    ctx.stats.receive_errors += 1;
                    error!(error = %_e, "receive failed");
                    break;
                }
            }
        }
        ctx.stats.records_received += drained;
        trace!(drained, "channel drained");
        Disposition::Keep
    }
}

/// Reads one control byte per readiness and toggles the producer on a trigger.
///
/// Deregisters itself at end of input: a closed descriptor stays readable
/// and would otherwise spin the loop.
pub struct ControlSource<F> {
    input: ControlInput<F>,
}

impl<F: AsFd> ControlSource<F> {
    pub const fn new(input: ControlInput<F>) -> Self {
        Self { input }
    }
}

impl<F: AsFd> AsFd for ControlSource<F> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }
}

impl<C: Channel + 'static, F: AsFd> EventSource<Context<C>> for ControlSource<F> {
    fn kind(&self) -> SourceKind {
        SourceKind::Control
    }

    fn on_ready(&mut self, ctx: &mut Context<C>) -> Disposition {
        let byte = match self.input.read_trigger() {
            Ok(Some(byte)) => byte,
            Ok(None) => {
                info!("control input closed; producer state is now fixed");
                return Disposition::Deregister;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Disposition::Keep,
            Err(_e) => {
                error!(error = %_e, "control read failed; ignoring control input");
                return Disposition::Deregister;
            }
        };

        match interpret(byte) {
            ControlAction::Toggle => match ctx.producer.toggle() {
                Ok(enabled) => {
                    ctx.stats.toggles += 1;
                    let state = if enabled { "enabled" } else { "disabled" };
                    ctx.console.line(format_args!("producer {state}"));
                }
                Err(_e) => {
                    ctx.stats.toggle_failures += 1;
                    error!(error = %_e, "toggle failed; producer state unchanged");
                }
            },
            ControlAction::Ignore => {
                ctx.stats.ignored_control_bytes += 1;
                trace!(byte, "ignoring control byte");
            }
        }
        Disposition::Keep
    }
}

/// A channel, its producer and the control input, driven by one loop.
pub struct Pipeline<C: Channel + 'static> {
    mux: Multiplexer<Context<C>>,
    ctx: Context<C>,
    channel: Arc<C>,
    channel_token: Token,
    control_token: Option<Token>,
}

impl<C: Channel + 'static> Pipeline<C> {
    /// Builds the loop: multiplexer, producer, and two registrations
    /// (channel, then control).
    ///
    /// A control descriptor epoll refuses (`EPERM`: `/dev/null` or a regular
    /// file on stdin) is logged and left out; the loop then runs with the
    /// channel alone and the producer keeps its initial state.
    ///
    /// The producer starts disabled unless `producer.start_enabled` is set.
    ///
    /// # Errors
    ///
    /// Any [`SetupError`]; nothing is left running on failure.
    pub fn new<F>(
        channel: Arc<C>,
        control: F,
        producer: &ProducerConfig,
        console: Console,
    ) -> Result<Self, SetupError>
    where
        F: AsFd + 'static,
    {
        if producer.period.is_zero() {
            return Err(SetupError::Config("producer period must be non-zero"));
        }

        let mut mux = Multiplexer::new().map_err(SetupError::Multiplexer)?;
        let mut producer_handle = Producer::new(Arc::clone(&channel), *producer)?;

        let channel_token = mux
            .register(Box::new(ChannelSource::new(Arc::clone(&channel))))
            .map_err(|source| SetupError::Register {
                kind: SourceKind::Channel,
                source,
            })?;
        let control_token =
            match mux.register(Box::new(ControlSource::new(ControlInput::new(control)))) {
                Ok(token) => Some(token),
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                    warn!("control input is not pollable; running without it");
                    None
                }
                Err(source) => {
                    return Err(SetupError::Register {
                        kind: SourceKind::Control,
                        source,
                    });
                }
            };

        if producer.start_enabled {
            producer_handle.toggle()?;
        }

        info!(
            capacity = channel.capacity(),
            period_ms = producer.period.as_millis() as u64,
            max_events = producer.max_events,
            enabled = producer_handle.is_enabled(),
            "pipeline ready"
        );

        Ok(Self {
            mux,
            ctx: Context {
                producer: producer_handle,
                console,
                stats: Stats::default(),
            },
            channel,
            channel_token,
            control_token,
        })
    }

    /// One wait, report and dispatch cycle.
    ///
    /// With `None` this blocks until something is ready. Returns the number
    /// of ready sources; zero only if `timeout` elapsed.
    ///
    /// # Errors
    ///
    /// The wait failure. Handler failures never surface here.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready = self.mux.wait(timeout)?;
        self.ctx.stats.wait_cycles += 1;
        if ready.is_empty() {
            return Ok(0);
        }
        self.ctx
            .console
            .line(format_args!("{} ready events", ready.len()));
        let dispatched = self.mux.dispatch(&ready, &mut self.ctx);
        self.ctx.stats.ready_events += dispatched as u64;
        Ok(ready.len())
    }

    /// Runs the loop until waiting fails.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Wait`]; there is no other way out.
    pub fn run(&mut self) -> Result<Infallible, PipelineError> {
        loop {
            self.turn(None).map_err(|e| {
                error!(error = %e, "event wait failed");
                PipelineError::Wait(e)
            })?;
        }
    }

    #[must_use]
    pub const fn context(&self) -> &Context<C> {
        &self.ctx
    }

    #[must_use]
    pub const fn stats(&self) -> &Stats {
        &self.ctx.stats
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    #[must_use]
    pub const fn channel_token(&self) -> Token {
        self.channel_token
    }

    /// Token of the control source; `None` if it could not be registered.
    #[must_use]
    pub const fn control_token(&self) -> Option<Token> {
        self.control_token
    }

    /// Returns `true` until the control input reached end of input.
    #[must_use]
    pub fn control_registered(&self) -> bool {
        self.control_token
            .is_some_and(|token| self.mux.kind(token).is_some())
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.mux.len()
    }
}

impl Pipeline<MessageQueue> {
    /// Opens the configured POSIX queue and builds a pipeline controlled by
    /// standard input and printing to standard output.
    ///
    /// # Errors
    ///
    /// Any [`SetupError`], notably [`SetupError::Queue`] when the queue
    /// cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self, SetupError> {
        let name = QueueName::new(config.queue.as_str())?;
        if config.fresh && MessageQueue::unlink(&name)? {
            warn!(queue = %name, "removed stale queue");
        }
        let queue = MessageQueue::open(name, config.queue_attr())?;
        debug!(queue = %queue.name(), "control on stdin, console on stdout");
        Self::new(
            Arc::new(queue),
            io::stdin(),
            &config.producer(),
            Console::stdout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::OwnedFd;
    use std::sync::Mutex;

    use rustix::io as rio;
    use rustix::pipe::pipe;

    use crate::channel::MemoryChannel;
    use crate::record::Record;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    fn context<C: Channel + 'static>(channel: &Arc<C>, capture: &Capture) -> Context<C> {
        let config = ProducerConfig {
            period: Duration::from_secs(3600),
            max_events: 0,
            start_enabled: false,
        };
        Context {
            producer: Producer::new(Arc::clone(channel), config).unwrap(),
            console: Console::new(capture.clone()),
            stats: Stats::default(),
        }
    }

    #[test]
    fn channel_source_drains_everything() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);

        channel.send(&Record::from_text("one").unwrap()).unwrap();
        channel.send(&Record::from_text("two").unwrap()).unwrap();

        let mut source = ChannelSource::new(Arc::clone(&channel));
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert!(channel.is_empty().unwrap());
        assert_eq!(ctx.stats.records_received, 2);
        assert_eq!(
            capture.lines(),
            vec!["64 bytes read.", "Read 'one'", "64 bytes read.", "Read 'two'"]
        );
    }

    /// A channel that never runs dry, like one refilled faster than it drains.
    struct Bottomless {
        ready: MemoryChannel,
    }

    impl AsFd for Bottomless {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.ready.as_fd()
        }
    }

    impl Channel for Bottomless {
        fn send(&self, record: &Record) -> Result<(), ChannelError> {
            self.ready.send(record)
        }

        fn receive(&self) -> Result<Record, ChannelError> {
            Ok(Record::from_text("again").unwrap())
        }

        fn len(&self) -> Result<usize, ChannelError> {
            Ok(self.capacity())
        }

        fn capacity(&self) -> usize {
            5
        }
    }

    #[test]
    fn drain_stops_after_capacity_records() {
        let channel = Arc::new(Bottomless {
            ready: MemoryChannel::new(1).unwrap(),
        });
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);

        let mut source = ChannelSource::new(Arc::clone(&channel));
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert_eq!(ctx.stats.records_received, 5);
        assert_eq!(capture.lines().len(), 10);
    }

    #[test]
    fn unpollable_control_is_skipped() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let dev_null = std::fs::File::open("/dev/null").unwrap();
        let pipeline = Pipeline::new(
            channel,
            dev_null,
            &ProducerConfig::default(),
            Console::new(io::sink()),
        )
        .unwrap();
        assert_eq!(pipeline.registrations(), 1);
        assert_eq!(pipeline.control_token(), None);
        assert!(!pipeline.control_registered());
    }

    #[test]
    fn start_enabled_arms_through_toggle() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let (reader, _writer) = pipe().unwrap();
        let config = ProducerConfig {
            period: Duration::from_secs(3600),
            start_enabled: true,
            ..ProducerConfig::default()
        };
        let pipeline =
            Pipeline::new(channel, reader, &config, Console::new(io::sink())).unwrap();
        assert!(pipeline.context().producer.state().enabled);
        assert_eq!(pipeline.stats().toggles, 0);
    }

    #[test]
    fn empty_channel_is_a_spurious_wakeup() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);

        let mut source = ChannelSource::new(Arc::clone(&channel));
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert_eq!(ctx.stats.spurious_wakeups, 1);
        assert_eq!(capture.lines(), vec!["channel empty despite readiness"]);
    }

    fn control_source() -> (ControlSource<OwnedFd>, OwnedFd) {
        let (reader, writer) = pipe().unwrap();
        (ControlSource::new(ControlInput::new(reader)), writer)
    }

    #[test]
    fn control_source_toggles_on_line_feed() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);
        let (mut source, writer) = control_source();

        rio::write(&writer, b"\n\n").unwrap();
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert!(ctx.producer.is_enabled());
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert!(!ctx.producer.is_enabled());
        assert_eq!(ctx.stats.toggles, 2);
        assert_eq!(capture.lines(), vec!["producer enabled", "producer disabled"]);
    }

    #[test]
    fn control_source_ignores_other_bytes() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);
        let (mut source, writer) = control_source();

        rio::write(&writer, b"q").unwrap();
        assert_eq!(source.on_ready(&mut ctx), Disposition::Keep);
        assert!(!ctx.producer.is_enabled());
        assert_eq!(ctx.stats.ignored_control_bytes, 1);
        assert!(capture.lines().is_empty());
    }

    #[test]
    fn control_source_deregisters_at_end_of_input() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let capture = Capture::default();
        let mut ctx = context(&channel, &capture);
        let (mut source, writer) = control_source();

        drop(writer);
        assert_eq!(source.on_ready(&mut ctx), Disposition::Deregister);
    }

    #[test]
    fn zero_period_is_a_config_error() {
        let channel = Arc::new(MemoryChannel::new(8).unwrap());
        let (reader, _writer) = pipe().unwrap();
        let config = ProducerConfig {
            period: Duration::ZERO,
            ..ProducerConfig::default()
        };
        let result = Pipeline::new(channel, reader, &config, Console::new(io::sink()));
        assert!(matches!(result, Err(SetupError::Config(_))));
    }

    #[test]
    fn from_config_rejects_bad_queue_name() {
        let config = Config {
            queue: "no-leading-slash".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            Pipeline::from_config(&config),
            Err(SetupError::Queue(ChannelError::InvalidName { .. }))
        ));
    }
}
