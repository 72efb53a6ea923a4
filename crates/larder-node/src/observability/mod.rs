//! Observability for the Larder node.
//!
//! The storage crate emits `tracing` events throughout: routing decisions at
//! debug, migrations at info, degraded reads and retries at warn. This module
//! installs the subscriber that renders them.

mod logging;

pub use logging::{init_logging, LogFormat};
