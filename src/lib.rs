// src/lib.rs
//! Sentra Lab Execution-Context Core
//!
//! Tracks one in-flight agent request end-to-end, lets a single-threaded
//! consumer observe and control work running on many concurrent workers,
//! and guarantees deterministic, leak-free teardown of every resource a
//! request touches.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **context**: Execution context, forks, stack frames, memory, output
//! - **interrupt**: Interrupt signals and the per-context controller
//! - **batch**: All/any/race scheduling with a single progress consumer
//! - **resources**: Handle registry with cascading release
//! - **trace**: Trace manager contract and in-process backend
//! - **runtime**: Injected bundle of process-wide services
//! - **observability**: Tracing, metrics, and the request logger
//! - **utils**: Configuration and error types

// Public module exports
pub mod batch;
pub mod context;
pub mod interrupt;
pub mod observability;
pub mod resources;
pub mod runtime;
pub mod trace;
pub mod utils;

// Re-export commonly used types
pub use batch::{BatchScheduler, JoinPolicy};
pub use context::{AuthorizedInfo, Context, ContextRegistry, RequestInfo};
pub use interrupt::{InterruptController, InterruptSignal, InterruptType};
pub use resources::{Resource, ResourceRegistry};
pub use runtime::{BuildInfo, ExecutionRuntime};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};
