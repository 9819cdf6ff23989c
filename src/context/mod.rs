// src/context/mod.rs
//! Execution context
//!
//! A [`Context`] tracks one in-flight agent request end-to-end. It owns its
//! current stack frame, its interrupt controller and its request-scoped
//! memory namespace, and shares the rest with the forks it spawns.
//!
//! # Ownership
//!
//! ```text
//!                    root context                      fork
//! id                 own                               own
//! memory.context     own (keyed by id)                 own (keyed by fork id)
//! memory.user/team/chat ──────────── shared ─────────────▶
//! cache              ─────────────── shared ─────────────▶
//! output sink        own (closes on release) ── shared ──▶
//! stack arena        own (clears on release) ── shared ──▶
//! interrupt          optional                          none
//! trace              lazy, owned if created            loaded, not owned
//! ```
//!
//! # Release order
//!
//! logger phase → unregister → stop interrupts → finish trace → clear
//! context memory → clear frames → drop current frame → close output →
//! close logger. Every step is guarded; a second release is a no-op.

pub mod memory;
pub mod output;
pub mod registry;
pub mod stack;

pub use memory::{InMemoryMemoryManager, Memory, MemoryManager, Namespace, Scope};
pub use output::{MemoryWriter, OutputMessage, OutputSink, OutputStats};
pub use registry::ContextRegistry;
pub use stack::{ForkParentInfo, Stack, StackArena, StackStatus};

use crate::interrupt::{InterruptController, InterruptHandler, InterruptSignal};
use crate::observability::{RequestLogger, CONTEXTS_CREATED, CONTEXTS_FORKED, CONTEXTS_RELEASED};
use crate::resources::Resource;
use crate::runtime::ExecutionRuntime;
use crate::trace::{TraceDriver, TraceHandle, TraceOptions};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of the authenticated caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedInfo {
    pub subject: String,
    pub user_id: String,
    pub team_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub session_id: String,
}

/// Read-only request data, copied by value into forks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub authorized: Option<AuthorizedInfo>,
    pub chat_id: String,
    pub assistant_id: String,
    pub locale: String,
    pub theme: String,
    pub referer: String,
    pub route: String,
    pub capabilities: Option<Value>,
    pub metadata: Map<String, Value>,
}

struct TraceSlot {
    id: String,
    handle: Arc<dyn TraceHandle>,
    /// Only the creating context completes and releases a trace
    owned: bool,
}

/// Request-scoped execution context
pub struct Context {
    id: String,
    info: RequestInfo,

    /// Fires when the request is cancelled
    signal: CancellationToken,

    runtime: Arc<ExecutionRuntime>,

    memory: Memory,
    cache: Namespace,

    stacks: Arc<StackArena>,
    owns_stacks: bool,
    current_stack: RwLock<Option<String>>,
    fork_parent: Option<ForkParentInfo>,

    trace: Mutex<Option<TraceSlot>>,
    interrupt: RwLock<Option<InterruptController>>,

    output: Arc<OutputSink>,
    owns_output: bool,

    logger: RequestLogger,
    released: AtomicBool,
    created_at: DateTime<Utc>,
}

fn new_context_id() -> String {
    format!("ctx-{}", ulid::Ulid::new())
}

/// Builder for root contexts
pub struct ContextBuilder {
    runtime: Arc<ExecutionRuntime>,
    signal: CancellationToken,
    info: RequestInfo,
    output: Option<Arc<OutputSink>>,
}

impl ContextBuilder {
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_authorized(mut self, authorized: AuthorizedInfo) -> Self {
        self.info.authorized = Some(authorized);
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.info.chat_id = chat_id.into();
        self
    }

    pub fn with_assistant_id(mut self, assistant_id: impl Into<String>) -> Self {
        self.info.assistant_id = assistant_id.into();
        self
    }

    pub fn with_info(mut self, info: RequestInfo) -> Self {
        self.info = info;
        self
    }

    /// Write outward messages to this sink; the context closes it on release
    pub fn with_output(mut self, output: Arc<OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    /// Create and register the context
    ///
    /// Neither the interrupt controller nor the trace is started here.
    pub fn build(self) -> Result<Arc<Context>> {
        let id = new_context_id();
        let runtime = self.runtime;
        let info = self.info;

        let (user, team) = info
            .authorized
            .as_ref()
            .map(|a| (a.user_id.as_str(), a.team_id.as_str()))
            .unwrap_or(("", ""));
        let memory = match runtime
            .memory_manager()
            .get_or_create(user, team, &info.chat_id, &id)
        {
            Ok(memory) => memory,
            Err(e) => {
                warn!(context_id = %id, "Memory unavailable, using detached memory: {}", e);
                Memory::detached(&id)
            }
        };

        let output = match self.output {
            Some(output) => output,
            None => Arc::new(OutputSink::discard()?),
        };

        let logger = RequestLogger::new(&id, &info.chat_id, &info.assistant_id);
        let ctx = Arc::new(Context {
            cache: Namespace::new(Scope::Cache, id.clone()),
            id,
            signal: self.signal,
            memory,
            stacks: Arc::new(StackArena::new()),
            owns_stacks: true,
            current_stack: RwLock::new(None),
            fork_parent: None,
            trace: Mutex::new(None),
            interrupt: RwLock::new(None),
            output,
            owns_output: true,
            logger,
            released: AtomicBool::new(false),
            created_at: Utc::now(),
            info,
            runtime,
        });

        ctx.runtime.contexts().register(&ctx)?;
        metrics::counter!(CONTEXTS_CREATED).increment(1);
        info!(
            context_id = %ctx.id,
            chat_id = %ctx.info.chat_id,
            assistant_id = %ctx.info.assistant_id,
            "Context created"
        );
        Ok(ctx)
    }
}

impl Context {
    pub fn builder(runtime: Arc<ExecutionRuntime>) -> ContextBuilder {
        ContextBuilder {
            runtime,
            signal: CancellationToken::new(),
            info: RequestInfo::default(),
            output: None,
        }
    }

    /// Create a root context for a request
    pub fn create(
        runtime: Arc<ExecutionRuntime>,
        parent_signal: CancellationToken,
        authorized: Option<AuthorizedInfo>,
        chat_id: &str,
    ) -> Result<Arc<Context>> {
        let mut builder = Self::builder(runtime)
            .with_signal(parent_signal)
            .with_chat_id(chat_id);
        if let Some(authorized) = authorized {
            builder = builder.with_authorized(authorized);
        }
        builder.build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn runtime(&self) -> &Arc<ExecutionRuntime> {
        &self.runtime
    }

    pub fn signal(&self) -> CancellationToken {
        self.signal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn cache(&self) -> &Namespace {
        &self.cache
    }

    pub fn output(&self) -> &Arc<OutputSink> {
        &self.output
    }

    pub fn logger(&self) -> &RequestLogger {
        &self.logger
    }

    pub fn fork_parent(&self) -> Option<&ForkParentInfo> {
        self.fork_parent.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(EngineError::ContextReleased(self.id.clone()));
        }
        Ok(())
    }

    // --- fork -------------------------------------------------------------

    /// Derive a child context for a parallel sub-call
    ///
    /// The child gets its own id, `context` namespace, logger and frame
    /// pointer. It shares persistent memory, the cache, the output sink and
    /// the frame arena, and has no interrupt controller. Its cancellation
    /// token is a child of the parent's current cancellable sub-context.
    pub fn fork(self: &Arc<Self>) -> Result<Arc<Context>> {
        self.ensure_live()?;
        let id = new_context_id();

        let memory = match self.runtime.memory_manager().fork(&self.memory, &id) {
            Ok(memory) => memory,
            Err(e) => {
                warn!(
                    context_id = %self.id,
                    fork_id = %id,
                    "Memory fork failed, sharing parent memory: {}", e
                );
                self.memory.clone()
            }
        };

        let fork_parent = self
            .current_stack()
            .map(|stack| stack.fork_info())
            .or_else(|| self.fork_parent.clone());

        let child = Arc::new(Context {
            logger: RequestLogger::new(&id, &self.info.chat_id, &self.info.assistant_id),
            id,
            info: self.info.clone(),
            signal: self.cancellation_token().child_token(),
            runtime: Arc::clone(&self.runtime),
            memory,
            cache: self.cache.clone(),
            stacks: Arc::clone(&self.stacks),
            owns_stacks: false,
            current_stack: RwLock::new(None),
            fork_parent,
            trace: Mutex::new(None),
            interrupt: RwLock::new(None),
            output: Arc::clone(&self.output),
            owns_output: false,
            released: AtomicBool::new(false),
            created_at: Utc::now(),
        });

        self.runtime.contexts().register(&child)?;
        metrics::counter!(CONTEXTS_FORKED).increment(1);
        debug!(parent_id = %self.id, context_id = %child.id, "Context forked");
        Ok(child)
    }

    // --- stack ------------------------------------------------------------

    /// Push a call frame; the returned guard pops it
    ///
    /// The frame is a root when nothing is active and this context is not a
    /// fork, a child of the active frame otherwise, or a child of the fork's
    /// branch point for a fork's first frame.
    pub fn enter_stack(&self, assistant_id: &str, referer: &str, options: Value) -> StackGuard<'_> {
        let previous = self.current_stack.read().clone();
        let parent = previous.as_deref().and_then(|id| self.stacks.get(id));

        let stack = match (&parent, &self.fork_parent) {
            (Some(parent), _) => Stack::new_child(parent, assistant_id, referer, options),
            (None, Some(branch)) => Stack::from_fork_parent(branch, assistant_id, referer, options),
            (None, None) => {
                let trace_id = self.trace.lock().as_ref().map(|slot| slot.id.clone());
                Stack::new_root(trace_id, assistant_id, referer, options)
            }
        };

        let stack_id = stack.id.clone();
        let trace_id = stack.trace_id.clone();
        debug!(
            context_id = %self.id,
            stack_id = %stack_id,
            depth = stack.depth,
            "Entered stack"
        );
        self.stacks.insert(stack);
        *self.current_stack.write() = Some(stack_id.clone());

        StackGuard {
            ctx: self,
            stack_id,
            trace_id,
            previous,
            finished: false,
        }
    }

    /// The active frame
    pub fn current_stack(&self) -> Option<Stack> {
        let id = self.current_stack.read().clone()?;
        self.stacks.get(&id)
    }

    pub fn all_stacks(&self) -> Vec<Stack> {
        self.stacks.all()
    }

    pub fn stack_by_id(&self, id: &str) -> Option<Stack> {
        self.stacks.get(id)
    }

    pub fn stacks_by_trace_id(&self, trace_id: &str) -> Vec<Stack> {
        self.stacks.by_trace_id(trace_id)
    }

    pub fn root_stack(&self) -> Option<Stack> {
        self.stacks.root()
    }

    // --- trace ------------------------------------------------------------

    /// The trace for this request, created on first use and cached
    ///
    /// An already-active trace for the current frame (or the fork branch
    /// point) is loaded and shared; otherwise a new one is created with the
    /// configured driver and owned by this context.
    pub fn trace(&self) -> Result<Arc<dyn TraceHandle>> {
        self.ensure_live()?;
        let mut slot = self.trace.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(&existing.handle));
        }

        let frame_trace_id = self
            .current_stack()
            .map(|s| s.trace_id)
            .or_else(|| self.fork_parent.as_ref().map(|f| f.trace_id.clone()));
        let traces = self.runtime.trace_manager();

        if let Some(trace_id) = frame_trace_id.as_deref() {
            if let Some(handle) = traces.load(trace_id)? {
                debug!(context_id = %self.id, trace_id, "Loaded existing trace");
                *slot = Some(TraceSlot {
                    id: trace_id.to_string(),
                    handle: Arc::clone(&handle),
                    owned: false,
                });
                return Ok(handle);
            }
        }

        let config = self.runtime.config();
        let driver = TraceDriver::from_config(&config.trace)?;
        let authorized = self.info.authorized.as_ref();
        let options = TraceOptions {
            trace_id: frame_trace_id,
            created_by: authorized.map(|a| a.user_id.clone()),
            team_id: authorized.map(|a| a.team_id.clone()),
            tenant_id: authorized.map(|a| a.tenant_id.clone()),
            auto_archive: config.is_production(),
        };
        let (id, handle) = traces.create(&self.signal, &driver, options)?;
        debug!(context_id = %self.id, trace_id = %id, "Created trace");
        *slot = Some(TraceSlot {
            id,
            handle: Arc::clone(&handle),
            owned: true,
        });
        Ok(handle)
    }

    /// Id of the cached trace, if one has been created or loaded
    pub fn trace_id(&self) -> Option<String> {
        self.trace.lock().as_ref().map(|slot| slot.id.clone())
    }

    // --- interrupts -------------------------------------------------------

    /// Create and start the interrupt controller. Idempotent.
    pub fn enable_interrupts(&self) -> Result<InterruptController> {
        self.ensure_live()?;
        let mut slot = self.interrupt.write();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let controller = InterruptController::new(
            &self.runtime.config().interrupt,
            self.signal.clone(),
            Arc::downgrade(self.runtime.contexts()),
        );
        controller.start(&self.id)?;
        *slot = Some(controller.clone());
        Ok(controller)
    }

    pub fn interrupt(&self) -> Option<InterruptController> {
        self.interrupt.read().clone()
    }

    pub fn set_interrupt_handler(&self, handler: InterruptHandler) -> Result<()> {
        let controller = self
            .interrupt()
            .ok_or_else(|| EngineError::InterruptNotEnabled(self.id.clone()))?;
        controller.set_handler(handler);
        Ok(())
    }

    /// Take the next pending interrupt, if any
    pub fn check_interrupt(&self) -> Option<InterruptSignal> {
        self.interrupt().and_then(|c| c.check())
    }

    /// Take every pending interrupt, merged into one
    pub fn check_interrupt_merged(&self) -> Option<InterruptSignal> {
        self.interrupt().and_then(|c| c.check_with_merge())
    }

    pub fn pending_interrupts(&self) -> usize {
        self.interrupt().map(|c| c.pending_count()).unwrap_or(0)
    }

    pub fn is_interrupted(&self) -> bool {
        match self.interrupt() {
            Some(controller) => controller.is_interrupted(),
            None => self.signal.is_cancelled(),
        }
    }

    /// Token for work that a force interrupt should stop
    pub fn cancellation_token(&self) -> CancellationToken {
        match self.interrupt() {
            Some(controller) => controller.token(),
            None => self.signal.clone(),
        }
    }

    // --- output -----------------------------------------------------------

    /// Send one message (a string becomes a text message)
    pub fn send(&self, message: impl Into<OutputMessage>) -> Result<()> {
        self.ensure_live()?;
        let mut message = message.into();
        if message.id.is_none() {
            message.id = Some(format!("msg-{}", ulid::Ulid::new()));
        }
        self.output.send(&message)
    }

    /// Send a string or a structured JSON message
    pub fn send_value(&self, value: Value) -> Result<()> {
        self.send(OutputMessage::from_value(value)?)
    }

    /// Send related messages under one generated group id
    pub fn send_group(&self, messages: Vec<OutputMessage>) -> Result<String> {
        self.ensure_live()?;
        let group_id = format!("grp-{}", ulid::Ulid::new());
        for mut message in messages {
            message.group_id = Some(group_id.clone());
            self.send(message)?;
        }
        Ok(group_id)
    }

    pub fn flush(&self) -> Result<()> {
        self.output.flush()
    }

    // --- export -----------------------------------------------------------

    /// Populated request fields as a JSON object
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::from(self.id.clone()));

        let strings = [
            ("chat_id", &self.info.chat_id),
            ("assistant_id", &self.info.assistant_id),
            ("locale", &self.info.locale),
            ("theme", &self.info.theme),
            ("referer", &self.info.referer),
            ("route", &self.info.route),
        ];
        for (key, value) in strings {
            if !value.is_empty() {
                map.insert(key.to_string(), Value::from(value.clone()));
            }
        }

        if let Some(authorized) = &self.info.authorized {
            if let Ok(value) = serde_json::to_value(authorized) {
                map.insert("authorized".to_string(), value);
            }
        }
        if let Some(capabilities) = &self.info.capabilities {
            map.insert("capabilities".to_string(), capabilities.clone());
        }
        if !self.info.metadata.is_empty() {
            map.insert("metadata".to_string(), Value::Object(self.info.metadata.clone()));
        }
        if let Some(trace_id) = self.trace_id() {
            map.insert("trace_id".to_string(), Value::from(trace_id));
        }
        map
    }

    // --- release ----------------------------------------------------------

    /// Tear down everything this context owns. Idempotent; never fails.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.logger.release_started();

        self.runtime.contexts().unregister(&self.id);

        if let Some(controller) = self.interrupt.write().take() {
            controller.stop();
            self.logger.cleanup("interrupt");
        }

        if let Some(slot) = self.trace.lock().take() {
            if slot.owned {
                let finished = if self.signal.is_cancelled() {
                    slot.handle.mark_cancelled("context cancelled")
                } else {
                    slot.handle.mark_complete()
                };
                if let Err(e) = finished {
                    warn!(context_id = %self.id, trace_id = %slot.id, "Failed to finish trace: {}", e);
                }
                if let Err(e) = self.runtime.trace_manager().release(&slot.id) {
                    warn!(context_id = %self.id, trace_id = %slot.id, "Failed to release trace: {}", e);
                }
                self.logger.cleanup("trace");
            }
        }

        if self.memory.owns_context(&self.id) {
            self.memory.context.clear();
            self.runtime.memory_manager().release_context(&self.id);
            self.logger.cleanup("memory");
        }

        if self.owns_stacks {
            self.stacks.clear();
        }
        *self.current_stack.write() = None;

        if self.owns_output {
            self.output.close();
            self.logger.cleanup("output");
        }

        metrics::counter!(CONTEXTS_RELEASED).increment(1);
        debug!(context_id = %self.id, "Context released");
        self.logger.close();
    }
}

impl Resource for Context {
    fn kind(&self) -> &'static str {
        "context"
    }

    fn on_release(&self) {
        self.release();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("chat_id", &self.info.chat_id)
            .field("fork_parent", &self.fork_parent)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Active call frame; completes the frame and restores the previous one
/// when finished or dropped
pub struct StackGuard<'a> {
    ctx: &'a Context,
    stack_id: String,
    trace_id: String,
    previous: Option<String>,
    finished: bool,
}

impl StackGuard<'_> {
    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn complete(mut self) {
        self.finish(|s| s.complete());
    }

    pub fn fail(mut self, error: impl Into<String>) {
        let error = error.into();
        self.finish(move |s| s.fail(error));
    }

    pub fn timeout(mut self) {
        self.finish(|s| s.timeout());
    }

    fn finish<F: FnOnce(&mut Stack)>(&mut self, f: F) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ctx.stacks.update(&self.stack_id, f);
        if !self.ctx.is_released() {
            *self.ctx.current_stack.write() = self.previous.take();
        }
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.finish(|s| s.complete());
    }
}
