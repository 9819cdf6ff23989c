// src/batch/api.rs
//! Batch request/result types and the sub-operation seam

use crate::context::Context;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Option keys carrying per-request streaming callbacks; only the single
/// batch-wide sink is honoured
const CALLBACK_KEYS: &[&str] = &["onChunk", "on_chunk", "_handler"];

/// One sub-operation in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Agent or connector id
    pub target: String,

    /// Input payload (usually a message list)
    #[serde(default)]
    pub input: Value,

    /// Per-call option overrides
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl BatchRequest {
    pub fn new(target: impl Into<String>, input: Value) -> Self {
        Self {
            target: target.into(),
            input,
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Parse a JSON request list
    ///
    /// Each item is an object with `target` (or `agent` / `connector`),
    /// optional `input` (or `messages`) and optional `options`. Per-request
    /// callbacks are stripped. Any malformed item rejects the whole list.
    pub fn parse_list(value: &Value) -> Result<Vec<BatchRequest>> {
        let items = value
            .as_array()
            .ok_or_else(|| EngineError::InvalidBatchInput("requests must be an array".to_string()))?;

        items
            .iter()
            .enumerate()
            .map(|(index, item)| Self::parse_one(index, item))
            .collect()
    }

    fn parse_one(index: usize, item: &Value) -> Result<BatchRequest> {
        let object = item.as_object().ok_or_else(|| {
            EngineError::InvalidBatchInput(format!("request {} must be an object", index))
        })?;

        let target = ["target", "agent", "connector"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidBatchInput(format!("request {} is missing a target", index))
            })?;

        let input = object
            .get("input")
            .or_else(|| object.get("messages"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut options = match object.get("options") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(EngineError::InvalidBatchInput(format!(
                    "request {} options must be an object",
                    index
                )))
            }
        };
        for key in CALLBACK_KEYS {
            options.remove(*key);
        }

        Ok(BatchRequest {
            target: target.to_string(),
            input,
            options,
        })
    }
}

/// Outcome of one sub-operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Position in the request list
    pub index: usize,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    pub fn from_output(index: usize, target: String, output: Result<Value>) -> Self {
        match output {
            Ok(value) => Self {
                index,
                target,
                output: Some(value),
                error: None,
            },
            Err(e) => Self::failed(index, target, e.to_string()),
        }
    }

    pub fn failed(index: usize, target: String, error: impl Into<String>) -> Self {
        Self {
            index,
            target,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A progress event streamed from one sub-operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    /// Target of the producing sub-operation
    pub producer: String,
    pub index: usize,
    pub event: Value,
}

/// Items on the progress queue
pub(crate) enum Envelope {
    Progress(BatchMessage),
    /// The supervisor has published the aggregate result
    Closed,
}

/// Handle a sub-operation uses to stream progress to the consumer
#[derive(Clone)]
pub struct ProgressEmitter {
    producer: String,
    index: usize,
    tx: mpsc::Sender<Envelope>,
}

impl ProgressEmitter {
    pub(crate) fn new(producer: String, index: usize, tx: mpsc::Sender<Envelope>) -> Self {
        Self { producer, index, tx }
    }

    /// Queue an event, waiting while the queue is full
    ///
    /// Fails with `ProgressClosed` once the consumer has stopped listening,
    /// which is what happens to any/race losers.
    pub async fn emit(&self, event: Value) -> Result<()> {
        let message = BatchMessage {
            producer: self.producer.clone(),
            index: self.index,
            event,
        };
        self.tx
            .send(Envelope::Progress(message))
            .await
            .map_err(|_| EngineError::ProgressClosed)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// The sub-operation API the batch scheduler fans out to
pub trait SubOperationApi: Send + Sync {
    /// Run one request on its own forked context
    fn call(
        &self,
        ctx: Arc<Context>,
        request: BatchRequest,
        progress: Option<ProgressEmitter>,
    ) -> BoxFuture<'static, Result<Value>>;
}

struct FnSubOperation<F> {
    f: F,
}

impl<F, Fut> SubOperationApi for FnSubOperation<F>
where
    F: Fn(Arc<Context>, BatchRequest, Option<ProgressEmitter>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(
        &self,
        ctx: Arc<Context>,
        request: BatchRequest,
        progress: Option<ProgressEmitter>,
    ) -> BoxFuture<'static, Result<Value>> {
        (self.f)(ctx, request, progress).boxed()
    }
}

/// Wrap an async closure as a [`SubOperationApi`]
pub fn sub_operation<F, Fut>(f: F) -> Arc<dyn SubOperationApi>
where
    F: Fn(Arc<Context>, BatchRequest, Option<ProgressEmitter>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnSubOperation { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_list_with_aliases() {
        let requests = BatchRequest::parse_list(&json!([
            {"agent": "writer", "messages": [{"role": "user", "content": "hi"}]},
            {"target": "search", "input": "rust", "options": {"limit": 3, "onChunk": "fn"}},
            {"connector": "db"}
        ]))
        .unwrap();

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].target, "writer");
        assert_eq!(requests[0].input[0]["content"], json!("hi"));
        assert_eq!(requests[1].options.get("limit"), Some(&json!(3)));
        assert!(!requests[1].options.contains_key("onChunk"));
        assert_eq!(requests[2].input, Value::Null);
    }

    #[test]
    fn test_parse_list_rejects_malformed_input() {
        let cases = [
            json!({"agent": "a"}),
            json!(["not an object"]),
            json!([{"messages": []}]),
            json!([{"agent": ""}]),
            json!([{"agent": "a", "options": 5}]),
        ];
        for case in cases {
            assert!(
                matches!(BatchRequest::parse_list(&case), Err(EngineError::InvalidBatchInput(_))),
                "accepted {}",
                case
            );
        }
        assert!(BatchRequest::parse_list(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_result_from_output() {
        let ok = BatchResult::from_output(0, "a".into(), Ok(json!(1)));
        assert!(ok.is_ok());
        let err = BatchResult::from_output(
            1,
            "b".into(),
            Err(EngineError::SubOperationFailed("nope".into())),
        );
        assert!(!err.is_ok());
        assert!(err.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_emitter_reports_closed_consumer() {
        let (tx, rx) = mpsc::channel(1);
        let emitter = ProgressEmitter::new("a".into(), 0, tx);
        emitter.emit(json!(1)).await.unwrap();
        drop(rx);
        assert!(matches!(
            emitter.emit(json!(2)).await,
            Err(EngineError::ProgressClosed)
        ));
    }
}
