//! # Offline Common
//!
//! Logging configuration shared by the offline service worker crates and the
//! hosts that embed them.

pub mod logging;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat, LoggingError};
