//! # heapdig Utilities
//!
//! Shared helpers for the heapdig workspace.
//!
//! Currently this is the logging setup used by the command line tool. The
//! analysis library itself only emits `tracing` events and never installs a
//! subscriber.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with, LogFormat, LogGuard, LogLevel, LoggingConfig, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
