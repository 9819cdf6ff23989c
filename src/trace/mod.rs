// src/trace/mod.rs
//! Trace management
//!
//! A trace records the execution of one request tree. Contexts create theirs
//! lazily through a [`TraceManager`]; the manager is a narrow seam so the
//! storage backend can be swapped without touching the context.

pub mod manager;

pub use manager::{
    InMemoryTraceManager, TraceDriver, TraceHandle, TraceManager, TraceOptions, TraceStatus,
};
