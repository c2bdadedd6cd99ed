//! Tracing setup shared by the CACHE binaries.
pub mod logging;

pub use logging::{init, LogConfig, LogFormat, LogOutput, LoggerError};
