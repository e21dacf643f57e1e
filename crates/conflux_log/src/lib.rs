//! Logging facade for the Conflux workspace.
//!
//! Re-exports the [`log`] crate macros so that workspace crates depend on
//! a single logging entry point, and adds a wrapper macro for tracing the
//! duration of an expression.

mod macros;

pub use log::{Level, LevelFilter, debug, error, info, log, trace, warn};
