//! Shared types for the agent bridge workspace
//!
//! Holds the configuration-level error type and the atomic file write helper
//! used by every crate that persists small JSON state next to its config.

mod error;
mod fs;

pub use error::{Error, Result};
pub use fs::write_atomic;
