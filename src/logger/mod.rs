//! The `logger` module is a thin wrapper over a reloadable `tracing` filter.
//! See `bin/logger_demo.rs` for a binary demonstrating its usage.

mod logger;
pub use logger::*;

pub use tracing::{debug, error, info, trace, warn};
