//! Gateway basic library
//!
//! Provides basic functions shared by services:
//! - logging setup
//! - shutdown signal handling
//! - common command-line arguments
//! - hex formatting for frame logs

pub mod bootstrap_args;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use logging::{init_logging, LogConfig, LogGuard};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
