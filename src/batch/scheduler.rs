// src/batch/scheduler.rs
//! Blocking batch entry point for a single-threaded consumer
//!
//! The consumer (a scripting environment) must never be entered from more
//! than one thread. Workers therefore never call the progress callback;
//! they queue [`BatchMessage`]s and the calling thread drains them:
//!
//! ```text
//!  consumer thread                         tokio runtime
//!  ───────────────                         ─────────────
//!  execute() ──spawn supervisor──────────▶ supervisor
//!     │                                     ├─ worker 0 ─┐
//!     │                                     ├─ worker 1 ─┼─ emit().await
//!     │                                     └─ worker N ─┘      │
//!     │◀──────────── [bounded queue] ◀──────────────────────────┘
//!  on_progress() per message                 │
//!     │◀──── Closed ◀── result slot ◀────────┘ (after join policy settles)
//!  return results
//! ```
//!
//! Producers await free queue slots, so a slow consumer throttles them
//! without losing events.

use crate::batch::api::{BatchMessage, BatchRequest, BatchResult, Envelope, SubOperationApi};
use crate::batch::policy::{BatchDispatcher, JoinPolicy};
use crate::context::Context;
use crate::observability::BATCH_PROGRESS_EVENTS;
use crate::runtime::ExecutionRuntime;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Receives progress events on the consumer thread
pub trait ProgressSink {
    fn on_progress(&mut self, message: &BatchMessage);
}

impl<F> ProgressSink for F
where
    F: FnMut(&BatchMessage),
{
    fn on_progress(&mut self, message: &BatchMessage) {
        self(message)
    }
}

/// Batch scheduler bound to an execution runtime
pub struct BatchScheduler {
    runtime: Arc<ExecutionRuntime>,
    dispatcher: BatchDispatcher,
}

impl BatchScheduler {
    pub fn new(runtime: Arc<ExecutionRuntime>, api: Arc<dyn SubOperationApi>) -> Self {
        Self {
            runtime,
            dispatcher: BatchDispatcher::new(api),
        }
    }

    /// Run a JSON request list from the consumer thread
    ///
    /// The list is validated before any worker starts. Must not be called
    /// from a thread that has entered the tokio runtime.
    pub fn execute(
        &self,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: &Value,
        sink: Option<&mut dyn ProgressSink>,
    ) -> Result<Vec<BatchResult>> {
        let requests = BatchRequest::parse_list(requests)?;
        self.execute_requests(parent, policy, requests, sink)
    }

    /// Like [`execute`](Self::execute) with already-parsed requests
    pub fn execute_requests(
        &self,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: Vec<BatchRequest>,
        sink: Option<&mut dyn ProgressSink>,
    ) -> Result<Vec<BatchResult>> {
        if Handle::try_current().is_ok() {
            return Err(EngineError::BlockingInRuntime(format!(
                "batch {} must be driven from the consumer thread",
                policy.name()
            )));
        }
        let handle = self.runtime.handle()?.clone();

        match sink {
            None => handle.block_on(self.dispatcher.dispatch(parent, policy, requests)),
            Some(sink) => self.execute_streaming(&handle, parent, policy, requests, sink),
        }
    }

    pub fn all(
        &self,
        parent: &Arc<Context>,
        requests: &Value,
        sink: Option<&mut dyn ProgressSink>,
    ) -> Result<Vec<BatchResult>> {
        self.execute(parent, JoinPolicy::All, requests, sink)
    }

    pub fn any(
        &self,
        parent: &Arc<Context>,
        requests: &Value,
        sink: Option<&mut dyn ProgressSink>,
    ) -> Result<Vec<BatchResult>> {
        self.execute(parent, JoinPolicy::Any, requests, sink)
    }

    pub fn race(
        &self,
        parent: &Arc<Context>,
        requests: &Value,
        sink: Option<&mut dyn ProgressSink>,
    ) -> Result<Vec<BatchResult>> {
        self.execute(parent, JoinPolicy::Race, requests, sink)
    }

    /// Callback-free form for async callers
    pub async fn execute_async(
        &self,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: &Value,
    ) -> Result<Vec<BatchResult>> {
        let requests = BatchRequest::parse_list(requests)?;
        self.dispatcher.dispatch(parent, policy, requests).await
    }

    fn execute_streaming(
        &self,
        handle: &Handle,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: Vec<BatchRequest>,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<BatchResult>> {
        let capacity = self.runtime.config().batch.queue_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
        let (result_tx, result_rx) = oneshot::channel();

        let dispatcher = self.dispatcher.clone();
        let parent = Arc::clone(parent);
        handle.spawn(async move {
            let result = dispatcher
                .dispatch_with_progress(&parent, policy, requests, Some(tx.clone()))
                .await;
            let _ = result_tx.send(result);
            let _ = tx.send(Envelope::Closed).await;
        });

        let mut delivered = 0u64;
        while let Some(envelope) = rx.blocking_recv() {
            match envelope {
                Envelope::Progress(message) => {
                    sink.on_progress(&message);
                    delivered += 1;
                }
                Envelope::Closed => break,
            }
        }
        // Stragglers from any/race now get ProgressClosed
        drop(rx);
        metrics::counter!(BATCH_PROGRESS_EVENTS).increment(delivered);
        debug!(policy = policy.name(), delivered, "Progress queue drained");

        let results = result_rx.blocking_recv().map_err(|_| {
            EngineError::BatchAborted("supervisor exited without a result".to_string())
        })??;
        info!(
            policy = policy.name(),
            results = results.len(),
            delivered,
            "Batch finished"
        );
        Ok(results)
    }
}
