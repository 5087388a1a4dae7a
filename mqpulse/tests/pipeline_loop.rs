//! End-to-end tests of the event loop over the in-process channel.
//!
//! A pipe stands in for standard input and a shared buffer captures the
//! console, so these run anywhere epoll, timerfd and eventfd are available.
//!
//! ```bash
//! RUST_LOG=mqpulse=debug cargo test --test pipeline_loop -- --nocapture
//! ```

use std::io;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use rustix::io as rio;
use rustix::pipe::pipe;

use mqpulse::channel::{Channel, MemoryChannel};
use mqpulse::producer::ProducerConfig;
use mqpulse::runtime::{Console, Pipeline};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        mqpulse::init_tracing();
    });
}

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

/// A console that takes a while per write, like a slow terminal.
#[derive(Clone, Default)]
struct SlowConsole(Capture);

impl io::Write for SlowConsole {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_micros(20));
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

const TICK: Option<Duration> = Some(Duration::from_millis(20));
const DEADLINE: Duration = Duration::from_secs(5);

struct Harness {
    pipeline: Pipeline<MemoryChannel>,
    control: Option<OwnedFd>,
    console: Capture,
}

impl Harness {
    fn new(capacity: usize, producer: ProducerConfig) -> Self {
        init_test_tracing();
        let channel = Arc::new(MemoryChannel::new(capacity).unwrap());
        let (reader, writer) = pipe().unwrap();
        let console = Capture::default();
        let pipeline =
            Pipeline::new(channel, reader, &producer, Console::new(console.clone())).unwrap();
        Self {
            pipeline,
            control: Some(writer),
            console,
        }
    }

    fn press(&self, bytes: &[u8]) {
        rio::write(self.control.as_ref().unwrap(), bytes).unwrap();
    }

    fn close_control(&mut self) {
        self.control = None;
    }

    /// Turns the loop until `cond` holds.
    fn turn_until(&mut self, mut cond: impl FnMut(&Self) -> bool) {
        let start = Instant::now();
        while !cond(self) {
            assert!(start.elapsed() < DEADLINE, "condition not reached in time");
            self.pipeline.turn(TICK).unwrap();
        }
    }

    /// Turns the loop until a wait times out with nothing ready.
    fn settle(&mut self) {
        let start = Instant::now();
        while self.pipeline.turn(TICK).unwrap() > 0 {
            assert!(start.elapsed() < DEADLINE, "loop never went idle");
        }
    }
}

fn fast_producer() -> ProducerConfig {
    ProducerConfig {
        period: Duration::from_millis(5),
        max_events: 2,
        start_enabled: false,
    }
}

#[test]
fn exactly_two_sources_registered() {
    let harness = Harness::new(64, fast_producer());
    assert_eq!(harness.pipeline.registrations(), 2);
    let control = harness.pipeline.control_token().unwrap();
    assert_ne!(harness.pipeline.channel_token(), control);
    assert!(!harness.pipeline.context().producer.is_enabled());
}

#[test]
fn line_feed_enables_and_records_flow() {
    let mut harness = Harness::new(1000, fast_producer());
    harness.press(b"\n");

    harness.turn_until(|h| h.pipeline.context().producer.is_enabled());
    assert_eq!(harness.console.count("producer enabled"), 1);

    harness.turn_until(|h| h.pipeline.stats().records_received >= 5);
    let lines = harness.console.lines();
    assert!(lines.iter().any(|l| l.ends_with(" ready events")));
    assert!(lines.iter().any(|l| l == "64 bytes read."));
    assert!(lines.iter().any(|l| l.starts_with("Read 'NUM: 0 now: ")));
}

#[test]
fn second_line_feed_stops_records() {
    let mut harness = Harness::new(1000, fast_producer());
    harness.press(b"\n");
    harness.turn_until(|h| h.pipeline.stats().records_received > 0);

    harness.press(b"\n");
    harness.turn_until(|h| !h.pipeline.context().producer.is_enabled());
    harness.settle();
    let received = harness.pipeline.stats().records_received;
    assert!(harness.pipeline.channel().is_empty().unwrap());

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.pipeline.turn(TICK).unwrap(), 0);
    assert_eq!(harness.pipeline.stats().records_received, received);
    assert_eq!(harness.console.count("producer disabled"), 1);
}

#[test]
fn bytes_are_consumed_one_per_notification() {
    let mut harness = Harness::new(1000, ProducerConfig {
        period: Duration::from_secs(3600),
        ..fast_producer()
    });
    // Three toggles and two ignored bytes, all written at once.
    harness.press(b"\nx\ny\n");
    harness.turn_until(|h| {
        let stats = h.pipeline.stats();
        stats.toggles + stats.ignored_control_bytes == 5
    });
    let stats = *harness.pipeline.stats();
    assert_eq!(stats.toggles, 3);
    assert_eq!(stats.ignored_control_bytes, 2);
    assert!(harness.pipeline.context().producer.is_enabled());
}

#[test]
fn start_enabled_needs_no_input() {
    let mut harness = Harness::new(1000, ProducerConfig {
        start_enabled: true,
        ..fast_producer()
    });
    assert!(harness.pipeline.context().producer.is_enabled());
    harness.turn_until(|h| h.pipeline.stats().records_received > 0);
    assert_eq!(harness.pipeline.stats().toggles, 0);
}

#[test]
fn closed_control_deregisters_and_loop_keeps_draining() {
    let mut harness = Harness::new(1000, fast_producer());
    harness.press(b"\n");
    harness.close_control();

    harness.turn_until(|h| !h.pipeline.control_registered());
    assert_eq!(harness.pipeline.registrations(), 1);
    assert!(harness.pipeline.context().producer.is_enabled());

    let before = harness.pipeline.stats().records_received;
    harness.turn_until(|h| h.pipeline.stats().records_received > before);
}

#[test]
fn full_channel_drops_records_but_loop_survives() {
    let mut harness = Harness::new(2, ProducerConfig {
        period: Duration::from_millis(5),
        max_events: 20,
        start_enabled: true,
    });
    harness.turn_until(|h| h.pipeline.stats().records_received >= 10);
    assert_eq!(harness.pipeline.stats().receive_errors, 0);
    assert!(harness.pipeline.channel().len().unwrap() <= 2);
}

#[test]
fn line_feed_disables_a_producer_outpacing_the_console() {
    init_test_tracing();
    let channel = Arc::new(MemoryChannel::new(1000).unwrap());
    let (reader, writer) = pipe().unwrap();
    let console = SlowConsole::default();
    let producer = ProducerConfig {
        period: Duration::from_millis(1),
        max_events: 50,
        start_enabled: true,
    };
    let mut pipeline =
        Pipeline::new(channel, reader, &producer, Console::new(console.clone())).unwrap();

    rio::write(&writer, b"\n").unwrap();
    let start = Instant::now();
    while pipeline.context().producer.is_enabled() {
        assert!(start.elapsed() < DEADLINE, "line feed never dispatched");
        pipeline.turn(TICK).unwrap();
    }
    assert_eq!(pipeline.stats().toggles, 1);
    assert_eq!(console.0.count("producer disabled"), 1);
}
