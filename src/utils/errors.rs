// src/utils/errors.rs
//! Error types shared across the engine
//!
//! Every fallible operation returns [`Result`]. Cleanup paths never
//! propagate these; they log and carry on.

use thiserror::Error;

/// Engine-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the execution-context core
#[derive(Debug, Error)]
pub enum EngineError {
    /// No context is registered under the given id
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// The context cannot be registered
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// The context has already been released
    #[error("context already released: {0}")]
    ContextReleased(String),

    /// The context exists but does not accept external signals
    #[error("interrupt controller not enabled for context {0}")]
    InterruptNotEnabled(String),

    /// The interrupt mailbox stayed full for the whole send window
    #[error("timeout sending interrupt signal after {timeout_ms}ms")]
    InterruptTimeout { timeout_ms: u64 },

    /// The controller was stopped and accepts no more signals
    #[error("interrupt controller stopped")]
    InterruptStopped,

    /// No tokio runtime is reachable from the caller
    #[error("async runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A blocking entry point was called from inside the async runtime
    #[error("blocking call made from within the async runtime: {0}")]
    BlockingInRuntime(String),

    /// Malformed batch request list
    #[error("invalid batch input: {0}")]
    InvalidBatchInput(String),

    /// The batch supervisor went away without producing a result
    #[error("batch aborted: {0}")]
    BatchAborted(String),

    /// The progress consumer hung up
    #[error("progress channel closed")]
    ProgressClosed,

    /// A sub-operation returned an error
    #[error("sub-operation failed: {0}")]
    SubOperationFailed(String),

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Memory backend failure
    #[error("memory error: {0}")]
    MemoryError(String),

    /// Output writer failure
    #[error("output error: {0}")]
    OutputError(String),

    /// Resource handle unknown or already released
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Resource registered under a different type
    #[error("resource {handle} is not a {expected}")]
    ResourceTypeMismatch { handle: String, expected: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

impl EngineError {
    /// Whether the error came from a cancelled or timed-out operation
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::InterruptTimeout { .. })
    }
}
