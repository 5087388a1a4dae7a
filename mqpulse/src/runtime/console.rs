//! Operator-facing console output.

use std::fmt;
use std::io::{self, Write};

use crate::trace::warn;

/// Synchronous line-oriented writer, flushed after every line.
///
/// Write failures are logged and otherwise ignored: losing console output
/// must not stop the loop.
pub struct Console {
    out: Box<dyn Write + Send>,
}

impl Console {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    /// A console on the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Writes one line.
    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        let result = self
            .out
            .write_fmt(args)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(_e) = result {
            warn!(error = %_e, "console write failed");
        }
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}
