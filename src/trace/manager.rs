// src/trace/manager.rs
//! Trace manager contract and the in-process implementation

use crate::utils::config::TraceConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle state of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Cancelled,
}

/// Storage driver for new traces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceDriver {
    /// Files under a local directory
    Local { path: Option<String> },

    /// A named key-value store
    Store { store: String, prefix: Option<String> },
}

impl TraceDriver {
    /// Resolve the driver from configuration
    ///
    /// An empty driver name means `local`.
    pub fn from_config(config: &TraceConfig) -> Result<Self> {
        match config.driver.as_str() {
            "" | "local" => Ok(TraceDriver::Local {
                path: config.path.clone(),
            }),
            "store" => {
                let store = config
                    .store
                    .clone()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        EngineError::ConfigError("trace store ID not configured".to_string())
                    })?;
                Ok(TraceDriver::Store {
                    store,
                    prefix: config.prefix.clone(),
                })
            }
            other => Err(EngineError::ConfigError(format!(
                "unsupported trace driver: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TraceDriver::Local { .. } => "local",
            TraceDriver::Store { .. } => "store",
        }
    }
}

/// Options for a new trace
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Reuse this id instead of generating one
    pub trace_id: Option<String>,
    pub created_by: Option<String>,
    pub team_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Archive on completion (production mode)
    pub auto_archive: bool,
}

/// A live trace
pub trait TraceHandle: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> TraceStatus;

    fn mark_complete(&self) -> Result<()>;

    fn mark_cancelled(&self, reason: &str) -> Result<()>;
}

/// Trace backend
pub trait TraceManager: Send + Sync {
    /// Create a trace bound to the request's cancellation signal
    fn create(
        &self,
        parent: &CancellationToken,
        driver: &TraceDriver,
        options: TraceOptions,
    ) -> Result<(String, Arc<dyn TraceHandle>)>;

    /// Load an active trace by id
    fn load(&self, id: &str) -> Result<Option<Arc<dyn TraceHandle>>>;

    /// Drop a trace from the active set. Unknown ids are ignored.
    fn release(&self, id: &str) -> Result<()>;
}

/// Trace kept in process memory
#[derive(Debug)]
pub struct MemoryTrace {
    id: String,
    driver: TraceDriver,
    options: TraceOptions,
    status: RwLock<TraceStatus>,
    cancel_reason: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
    /// Fires when the owning request is cancelled
    signal: CancellationToken,
}

impl MemoryTrace {
    pub fn driver(&self) -> &TraceDriver {
        &self.driver
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.read()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.read().clone()
    }

    pub fn is_request_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    fn finish(&self, status: TraceStatus) -> bool {
        let mut current = self.status.write();
        if *current != TraceStatus::Running {
            return false;
        }
        *current = status;
        *self.finished_at.write() = Some(Utc::now());
        true
    }
}

impl TraceHandle for MemoryTrace {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> TraceStatus {
        *self.status.read()
    }

    fn mark_complete(&self) -> Result<()> {
        if self.finish(TraceStatus::Completed) {
            debug!(trace_id = %self.id, "Trace completed");
        }
        Ok(())
    }

    fn mark_cancelled(&self, reason: &str) -> Result<()> {
        if self.finish(TraceStatus::Cancelled) {
            *self.cancel_reason.write() = Some(reason.to_string());
            debug!(trace_id = %self.id, reason, "Trace cancelled");
        }
        Ok(())
    }
}

/// In-process trace manager
#[derive(Default)]
pub struct InMemoryTraceManager {
    traces: DashMap<String, Arc<MemoryTrace>>,
}

impl InMemoryTraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active (unreleased) traces
    pub fn active_count(&self) -> usize {
        self.traces.len()
    }

    /// Concrete access for inspection
    pub fn get(&self, id: &str) -> Option<Arc<MemoryTrace>> {
        self.traces.get(id).map(|t| Arc::clone(&t))
    }
}

impl TraceManager for InMemoryTraceManager {
    fn create(
        &self,
        parent: &CancellationToken,
        driver: &TraceDriver,
        options: TraceOptions,
    ) -> Result<(String, Arc<dyn TraceHandle>)> {
        let id = options
            .trace_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("trace-{}", ulid::Ulid::new()));

        let trace = self
            .traces
            .entry(id.clone())
            .or_insert_with(|| {
                info!(trace_id = %id, driver = driver.name(), "Created trace");
                Arc::new(MemoryTrace {
                    id: id.clone(),
                    driver: driver.clone(),
                    options,
                    status: RwLock::new(TraceStatus::Running),
                    cancel_reason: RwLock::new(None),
                    created_at: Utc::now(),
                    finished_at: RwLock::new(None),
                    signal: parent.child_token(),
                })
            })
            .clone();

        let handle: Arc<dyn TraceHandle> = trace;
        Ok((id, handle))
    }

    fn load(&self, id: &str) -> Result<Option<Arc<dyn TraceHandle>>> {
        Ok(self
            .traces
            .get(id)
            .map(|t| Arc::clone(&t) as Arc<dyn TraceHandle>))
    }

    fn release(&self, id: &str) -> Result<()> {
        if self.traces.remove(id).is_some() {
            debug!(trace_id = %id, "Released trace");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_config() {
        let config = TraceConfig::default();
        assert_eq!(
            TraceDriver::from_config(&config).unwrap(),
            TraceDriver::Local { path: None }
        );

        let config = TraceConfig {
            driver: "store".into(),
            store: Some("kv".into()),
            ..Default::default()
        };
        assert_eq!(TraceDriver::from_config(&config).unwrap().name(), "store");
    }

    #[test]
    fn test_driver_errors() {
        let missing_store = TraceConfig {
            driver: "store".into(),
            ..Default::default()
        };
        let err = TraceDriver::from_config(&missing_store).unwrap_err();
        assert!(err.to_string().contains("trace store ID not configured"));

        let unknown = TraceConfig {
            driver: "s3".into(),
            ..Default::default()
        };
        let err = TraceDriver::from_config(&unknown).unwrap_err();
        assert!(err.to_string().contains("unsupported trace driver"));
    }

    #[test]
    fn test_create_load_release() {
        let manager = InMemoryTraceManager::new();
        let token = CancellationToken::new();
        let driver = TraceDriver::Local { path: None };

        let (id, handle) = manager
            .create(&token, &driver, TraceOptions::default())
            .unwrap();
        assert!(id.starts_with("trace-"));
        assert_eq!(handle.status(), TraceStatus::Running);

        let loaded = manager.load(&id).unwrap().unwrap();
        assert_eq!(loaded.id(), id);

        manager.release(&id).unwrap();
        assert!(manager.load(&id).unwrap().is_none());
        manager.release(&id).unwrap();
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let manager = InMemoryTraceManager::new();
        let token = CancellationToken::new();
        let options = TraceOptions {
            trace_id: Some("trace-fixed".into()),
            ..Default::default()
        };
        let (id, handle) = manager
            .create(&token, &TraceDriver::Local { path: None }, options)
            .unwrap();
        assert_eq!(id, "trace-fixed");

        handle.mark_cancelled("client went away").unwrap();
        handle.mark_complete().unwrap();
        assert_eq!(handle.status(), TraceStatus::Cancelled);

        let trace = manager.get(&id).unwrap();
        assert_eq!(trace.cancel_reason().as_deref(), Some("client went away"));
        assert!(trace.finished_at().is_some());
    }

    #[test]
    fn test_trace_observes_request_cancellation() {
        let manager = InMemoryTraceManager::new();
        let token = CancellationToken::new();
        let (id, _) = manager
            .create(&token, &TraceDriver::Local { path: None }, TraceOptions::default())
            .unwrap();
        token.cancel();
        assert!(manager.get(&id).unwrap().is_request_cancelled());
    }
}
