// src/batch/mod.rs
//! Batch execution
//!
//! Runs N independent sub-operations concurrently under a join policy and
//! funnels their streamed progress to one consumer thread.
//!
//! - **api**: request/result/message types and the [`SubOperationApi`] seam
//! - **policy**: all/any/race join semantics and the async dispatcher
//! - **scheduler**: the blocking consumer-side entry point
//!
//! # Example
//!
//! ```no_run
//! use sentra_lab_context::batch::{sub_operation, BatchScheduler, BatchMessage};
//! use sentra_lab_context::{EngineError, ExecutionRuntime};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let runtime = ExecutionRuntime::builder().with_handle(rt.handle().clone()).build();
//! let ctx = runtime.create_context(CancellationToken::new(), None, "chat-1").unwrap();
//!
//! let api = sub_operation(|_ctx, request, _progress| async move {
//!     Ok::<_, EngineError>(json!(request.target))
//! });
//! let scheduler = BatchScheduler::new(Arc::clone(&runtime), api);
//!
//! let mut on_progress = |msg: &BatchMessage| println!("{} #{}: {}", msg.producer, msg.index, msg.event);
//! let results = scheduler
//!     .all(&ctx, &json!([{"agent": "a"}, {"agent": "b"}]), Some(&mut on_progress))
//!     .unwrap();
//! assert_eq!(results.len(), 2);
//! ctx.release();
//! ```

pub mod api;
pub mod policy;
pub mod scheduler;

pub use api::{sub_operation, BatchMessage, BatchRequest, BatchResult, ProgressEmitter, SubOperationApi};
pub use policy::{BatchDispatcher, JoinPolicy};
pub use scheduler::{BatchScheduler, ProgressSink};
