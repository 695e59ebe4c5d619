//! Observability module providing structured logging.
//!
//! Console output is pretty, compact or JSON; the filter honours `RUST_LOG`.

mod tracing_init;

pub use tracing_init::*;
