// src/utils/mod.rs
//! Common utilities: error types and engine configuration

pub mod config;
pub mod errors;

pub use config::{
    BatchConfig, EngineConfig, InterruptConfig, LogFormat, LoggingConfig, Mode, TraceConfig,
};
pub use errors::{EngineError, Result};
