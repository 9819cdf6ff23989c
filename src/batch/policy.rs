// src/batch/policy.rs
//! Join policies and the async dispatcher
//!
//! Every request runs as its own tokio task on a fresh fork of the calling
//! context. The fork is released when its sub-operation finishes, winner or
//! loser. Results are collected in completion order and returned according
//! to the policy:
//!
//! | policy | returns when                  | result                         |
//! |--------|-------------------------------|--------------------------------|
//! | all    | every task finished           | all N, request order           |
//! | any    | first success (or all failed) | the winner, or every failure   |
//! | race   | first task finished           | that task's result             |
//!
//! Tasks still running when any/race returns are not cancelled; their
//! results are discarded.

use crate::batch::api::{BatchRequest, BatchResult, Envelope, ProgressEmitter, SubOperationApi};
use crate::context::Context;
use crate::observability::BATCH_DISCARDED_RESULTS;
use crate::utils::errors::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a batch waits on its sub-operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    /// Wait for every sub-operation
    All,
    /// Return on the first success
    Any,
    /// Return on the first terminal result
    Race,
}

impl JoinPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            JoinPolicy::All => "all",
            JoinPolicy::Any => "any",
            JoinPolicy::Race => "race",
        }
    }

    /// Whether `result` settles the batch under this policy
    fn settles(&self, result: &BatchResult) -> bool {
        match self {
            JoinPolicy::All => false,
            JoinPolicy::Any => result.is_ok(),
            JoinPolicy::Race => true,
        }
    }
}

/// Runs request lists against a [`SubOperationApi`]
#[derive(Clone)]
pub struct BatchDispatcher {
    api: Arc<dyn SubOperationApi>,
}

impl BatchDispatcher {
    pub fn new(api: Arc<dyn SubOperationApi>) -> Self {
        Self { api }
    }

    /// Run `requests` under `policy`
    ///
    /// All forks are taken before any task starts, so a released parent
    /// fails the batch without side effects.
    pub async fn dispatch(
        &self,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchResult>> {
        self.dispatch_with_progress(parent, policy, requests, None)
            .await
    }

    /// [`dispatch`](Self::dispatch), giving every task an emitter onto
    /// `progress`
    pub(crate) async fn dispatch_with_progress(
        &self,
        parent: &Arc<Context>,
        policy: JoinPolicy,
        requests: Vec<BatchRequest>,
        progress: Option<mpsc::Sender<Envelope>>,
    ) -> Result<Vec<BatchResult>> {
        let total = requests.len();
        let forks = requests
            .iter()
            .map(|_| parent.fork())
            .collect::<Result<Vec<_>>>()?;

        debug!(
            context_id = parent.id(),
            policy = policy.name(),
            total,
            "Dispatching batch"
        );

        let mut pending = FuturesUnordered::new();
        for (index, (request, child)) in requests.into_iter().zip(forks).enumerate() {
            let api = Arc::clone(&self.api);
            let emitter = progress
                .as_ref()
                .map(|tx| ProgressEmitter::new(request.target.clone(), index, tx.clone()));
            let target = request.target.clone();

            let task = tokio::spawn(async move {
                let output = api.call(Arc::clone(&child), request, emitter).await;
                child.release();
                output
            });
            pending.push(async move {
                match task.await {
                    Ok(output) => BatchResult::from_output(index, target, output),
                    Err(e) => {
                        warn!(index, "Batch worker failed: {}", e);
                        BatchResult::failed(index, target, format!("worker failed: {}", e))
                    }
                }
            });
        }
        // Workers hold their own emitters; the queue closes with the last one
        drop(progress);

        let mut slots: Vec<Option<BatchResult>> = vec![None; total];
        let mut winner = None;
        while let Some(result) = pending.next().await {
            let index = result.index;
            let settled = policy.settles(&result);
            slots[index] = Some(result);
            if settled {
                winner = Some(index);
                break;
            }
        }

        let stragglers = pending.len();
        if stragglers > 0 {
            debug!(policy = policy.name(), stragglers, "Batch settled, detaching remaining tasks");
            tokio::spawn(async move {
                while pending.next().await.is_some() {
                    metrics::counter!(BATCH_DISCARDED_RESULTS).increment(1);
                }
            });
        }

        let results = match winner {
            Some(index) => slots.swap_remove(index).into_iter().collect(),
            None => slots.into_iter().flatten().collect(),
        };
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::api::sub_operation;
    use crate::runtime::ExecutionRuntime;
    use crate::utils::errors::EngineError;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Targets look like `ok:<delay_ms>` or `err:<delay_ms>`
    fn scripted() -> Arc<dyn SubOperationApi> {
        sub_operation(|_ctx, request: BatchRequest, _progress| async move {
            let mut parts = request.target.split(':');
            let kind = parts.next().unwrap_or("ok").to_string();
            let delay: u64 = parts.next().and_then(|d| d.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if kind == "err" {
                Err(EngineError::SubOperationFailed(request.target))
            } else {
                Ok(json!({ "target": request.target, "input": request.input }))
            }
        })
    }

    fn requests(targets: &[&str]) -> Vec<BatchRequest> {
        targets
            .iter()
            .map(|t| BatchRequest::new(*t, Value::Null))
            .collect()
    }

    #[tokio::test]
    async fn test_all_preserves_request_order() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        let dispatcher = BatchDispatcher::new(scripted());

        let results = dispatcher
            .dispatch(&parent, JoinPolicy::All, requests(&["ok:40", "err:5", "ok:10"]))
            .await
            .unwrap();

        let indices: Vec<_> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert_eq!(results[2].output.as_ref().unwrap()["target"], json!("ok:10"));

        // Every fork was released
        assert_eq!(runtime.contexts().len(), 1);
        parent.release();
    }

    #[tokio::test]
    async fn test_any_returns_first_success() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        let dispatcher = BatchDispatcher::new(scripted());

        let started = std::time::Instant::now();
        let results = dispatcher
            .dispatch(&parent, JoinPolicy::Any, requests(&["err:5", "ok:30", "ok:3000"]))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(2000));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 1);
        assert!(results[0].is_ok());
        parent.release();
    }

    #[tokio::test]
    async fn test_any_with_all_failures_returns_every_failure() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        let dispatcher = BatchDispatcher::new(scripted());

        let results = dispatcher
            .dispatch(&parent, JoinPolicy::Any, requests(&["err:30", "err:5", "err:15"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.is_ok()));
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        parent.release();
    }

    #[tokio::test]
    async fn test_race_returns_first_completion() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        let dispatcher = BatchDispatcher::new(scripted());

        let results = dispatcher
            .dispatch(&parent, JoinPolicy::Race, requests(&["ok:3000", "err:5"]))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 1);
        assert!(!results[0].is_ok());
        parent.release();
    }

    #[tokio::test]
    async fn test_released_parent_starts_nothing() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        parent.release();
        let dispatcher = BatchDispatcher::new(scripted());
        let result = dispatcher
            .dispatch(&parent, JoinPolicy::All, requests(&["ok:0"]))
            .await;
        assert!(matches!(result, Err(EngineError::ContextReleased(_))));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runtime = ExecutionRuntime::builder().build();
        let parent = runtime
            .create_context(CancellationToken::new(), None, "chat")
            .unwrap();
        let dispatcher = BatchDispatcher::new(scripted());
        for policy in [JoinPolicy::All, JoinPolicy::Any, JoinPolicy::Race] {
            let results = dispatcher
                .dispatch(&parent, policy, Vec::new())
                .await
                .unwrap();
            assert!(results.is_empty());
        }
        parent.release();
    }
}
