//! Common module
//!
//! This module contains the error type and logging helpers shared by the whole crate.

pub mod error;
pub mod log;

// Re-export commonly used types and functions
pub use error::{RelayError, Result};
pub use log::{init_logger, init_logger_with_sink};
