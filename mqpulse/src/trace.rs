//! Diagnostics on stderr.
//!
//! stdout belongs to the console (`"<n> ready events"`, `"Read '...'"`), so
//! every log line goes to stderr. Building without the default `tracing`
//! feature turns the log macros into empty expansions.

/// Filter used when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "mqpulse=info";

/// Installs the stderr subscriber.
///
/// Lines carry the uptime, the thread name (`mqpulse-timer` for bursts) and
/// the target. Only the first call installs anything.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::uptime())
        .with_thread_names(true)
        .with_target(true);

    let _ = tracing_subscriber::registry().with(filter).with(stderr).try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod silent {
    macro_rules! trace { ($($arg:tt)*) => {}; }
    macro_rules! debug { ($($arg:tt)*) => {}; }
    macro_rules! info { ($($arg:tt)*) => {}; }
    macro_rules! warn { ($($arg:tt)*) => {}; }
    macro_rules! error { ($($arg:tt)*) => {}; }

    pub(crate) use {debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use silent::{debug, error, info, trace, warn};
