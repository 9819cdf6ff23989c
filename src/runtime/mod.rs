// src/runtime/mod.rs
//! Execution runtime
//!
//! The injected bundle of process-wide services every context is created
//! from:
//!
//! - **Context registry**: id → live context, for interrupt routing
//! - **Resource registry**: handle → host object, for the script consumer
//! - **Trace manager**: trace storage backend
//! - **Memory manager**: user/team/chat/context namespaces
//! - **Async handle**: the tokio runtime workers and listeners run on
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── ExecutionRuntime ──────────────────────────┐
//! │  ContextRegistry   ResourceRegistry   TraceManager   MemoryManager   │
//! └──────────┬───────────────────────────────────────────────────────────┘
//!            │ create_context
//!            ▼
//!        Context ──fork──▶ Context ──fork──▶ ...
//!            │
//!            └─ BatchScheduler (all / any / race) ──▶ worker tasks
//! ```

use crate::context::{AuthorizedInfo, Context, ContextRegistry, InMemoryMemoryManager, MemoryManager};
use crate::resources::ResourceRegistry;
use crate::trace::{InMemoryTraceManager, TraceManager};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build stamp of the running crate, logged when a runtime starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GIT_HASH"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

/// Process-wide services shared by every context
pub struct ExecutionRuntime {
    config: EngineConfig,
    contexts: Arc<ContextRegistry>,
    resources: Arc<ResourceRegistry>,
    traces: Arc<dyn TraceManager>,
    memory: Arc<dyn MemoryManager>,

    /// Runtime used by blocking entry points (batch consumer side)
    handle: Option<Handle>,
}

/// Builder for [`ExecutionRuntime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<EngineConfig>,
    traces: Option<Arc<dyn TraceManager>>,
    memory: Option<Arc<dyn MemoryManager>>,
    handle: Option<Handle>,
}

impl RuntimeBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_trace_manager(mut self, traces: Arc<dyn TraceManager>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn with_memory_manager(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Async runtime for blocking entry points; defaults to the current one
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Arc<ExecutionRuntime> {
        let config = self.config.unwrap_or_default();
        let build = BuildInfo::current();
        info!(
            mode = ?config.mode,
            version = build.version,
            git_hash = build.git_hash,
            "Initializing execution runtime"
        );
        Arc::new(ExecutionRuntime {
            config,
            contexts: Arc::new(ContextRegistry::new()),
            resources: Arc::new(ResourceRegistry::new()),
            traces: self
                .traces
                .unwrap_or_else(|| Arc::new(InMemoryTraceManager::new()) as Arc<dyn TraceManager>),
            memory: self
                .memory
                .unwrap_or_else(|| Arc::new(InMemoryMemoryManager::new()) as Arc<dyn MemoryManager>),
            handle: self.handle.or_else(|| Handle::try_current().ok()),
        })
    }
}

impl ExecutionRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Runtime with in-process backends
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::builder().with_config(config).build()
    }

    /// Create and register a root context
    pub fn create_context(
        self: &Arc<Self>,
        parent_signal: CancellationToken,
        authorized: Option<AuthorizedInfo>,
        chat_id: &str,
    ) -> Result<Arc<Context>> {
        Context::create(Arc::clone(self), parent_signal, authorized, chat_id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    pub fn trace_manager(&self) -> &Arc<dyn TraceManager> {
        &self.traces
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    /// The async runtime, if one was configured or current at build time
    pub fn handle(&self) -> Result<&Handle> {
        self.handle.as_ref().ok_or_else(|| {
            EngineError::RuntimeUnavailable("no tokio runtime configured".to_string())
        })
    }

    pub fn build_info(&self) -> BuildInfo {
        BuildInfo::current()
    }

    /// Release every resource handle still held by the script consumer
    pub fn shutdown(&self) {
        let released = self.resources.release_all();
        info!(released, live_contexts = self.contexts.len(), "Execution runtime shut down");
    }
}
