//! Coordination between the daemon and its training runs
//!
//! - Graceful shutdown: latched stop requests observed at episode boundaries

pub mod shutdown;

pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownSignal, ShutdownToken};
