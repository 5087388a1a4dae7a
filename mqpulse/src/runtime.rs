//! Event loop runtime.
//!
//! - `multiplexer`: level-triggered epoll registry dispatching to boxed handlers.
//! - `console`: synchronous line output for the operator.
//! - `pipeline`: wires channel, producer and control input into one loop.

pub mod console;
pub mod multiplexer;
pub mod pipeline;

pub use console::Console;
pub use multiplexer::{Disposition, EventSource, Multiplexer, SourceKind, Token};
pub use pipeline::{
    ChannelSource, Context, ControlSource, Pipeline, PipelineError, SetupError, Stats,
};
