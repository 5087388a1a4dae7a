//! mqpulse daemon.
//!
//! Opens (or creates) the POSIX message queue, starts the producer timer
//! disarmed, and runs the event loop until killed. Press Enter to toggle
//! the producer.
//!
//! # Usage
//!
//! ```sh
//! mqpulse --queue /ExampleMQ --capacity 1000 --period-ms 100 --max-events 50
//! ```

use std::convert::Infallible;

use clap::Parser;
use mqpulse::{Config, Pipeline, PipelineError};

fn main() {
    if let Err(e) = run() {
        eprintln!("mqpulse: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<Infallible, PipelineError> {
    let config = Config::parse();
    mqpulse::init_tracing();

    let mut pipeline = Pipeline::from_config(&config)?;
    eprintln!(
        "mqpulse: listening on {} (press Enter to toggle the producer)",
        config.queue
    );
    pipeline.run()
}
