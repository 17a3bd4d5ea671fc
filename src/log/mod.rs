//! VANADIUM Logging Subsystem

pub mod logger;

pub use logger::{init as init_logger, try_get_logger, Logger, Sink};
