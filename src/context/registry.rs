// src/context/registry.rs
//! Context lookup table
//!
//! Routes external interrupts to running contexts by id. Entries are weak:
//! the table never keeps a context alive, and a context unregisters itself
//! as the first step of release.

use crate::context::Context;
use crate::interrupt::InterruptSignal;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Process-wide map of live contexts, injected through the runtime
#[derive(Default)]
pub struct ContextRegistry {
    contexts: DashMap<String, Weak<Context>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: &Arc<Context>) -> Result<()> {
        if ctx.id().is_empty() {
            return Err(EngineError::InvalidContext("context ID is empty".to_string()));
        }
        self.contexts.insert(ctx.id().to_string(), Arc::downgrade(ctx));
        debug!(context_id = ctx.id(), "Registered context");
        Ok(())
    }

    /// Remove a context; returns whether it was present
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.contexts.remove(id).is_some();
        if removed {
            debug!(context_id = id, "Unregistered context");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Result<Arc<Context>> {
        self.contexts
            .get(id)
            .and_then(|entry| entry.upgrade())
            .ok_or_else(|| EngineError::ContextNotFound(id.to_string()))
    }

    /// Deliver an interrupt to a running context
    pub async fn send_interrupt(&self, id: &str, signal: InterruptSignal) -> Result<()> {
        let ctx = self.get(id)?;
        let controller = ctx
            .interrupt()
            .ok_or_else(|| EngineError::InterruptNotEnabled(id.to_string()))?;
        controller.send_signal(signal).await
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    pub fn ids(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
