// src/resources/registry.rs
//! Concurrent handle table
//!
//! ```text
//! ResourceRegistry
//! └─ DashMap<handle, Entry>
//!      ├─ release hook   (Arc<dyn Resource>)
//!      └─ typed object   (Arc<dyn Any>)
//! ```
//!
//! Release is idempotent: the entry is removed atomically, so of two racing
//! `release` calls exactly one runs the hook.

use crate::observability::RESOURCES_RELEASED;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Opaque handle issued to the consumer
pub type ResourceHandle = String;

/// A host object that can be exposed through the registry
pub trait Resource: Send + Sync + 'static {
    /// Short kind name used in logs
    fn kind(&self) -> &'static str;

    /// Called exactly once when the handle is released
    fn on_release(&self);
}

struct Entry {
    resource: Arc<dyn Resource>,
    object: Arc<dyn Any + Send + Sync>,
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct ResourceStats {
    pub registered: u64,
    pub released: u64,
    pub live: usize,
}

/// Process-wide handle table, injected through the runtime
#[derive(Default)]
pub struct ResourceRegistry {
    entries: DashMap<ResourceHandle, Entry>,
    registered: AtomicU64,
    released: AtomicU64,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object and return its handle
    pub fn register<T: Resource>(&self, object: Arc<T>) -> ResourceHandle {
        let handle = format!("res-{}", ulid::Ulid::new());
        let kind = object.kind();
        let entry = Entry {
            resource: object.clone(),
            object,
        };
        self.entries.insert(handle.clone(), entry);
        self.registered.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %handle, kind, "Registered resource");
        handle
    }

    /// Look up a handle as a concrete type
    pub fn lookup<T: Resource>(&self, handle: &str) -> Result<Arc<T>> {
        let object = self
            .entries
            .get(handle)
            .map(|entry| Arc::clone(&entry.object))
            .ok_or_else(|| EngineError::ResourceNotFound(handle.to_string()))?;

        object
            .downcast::<T>()
            .map_err(|_| EngineError::ResourceTypeMismatch {
                handle: handle.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Look up a handle without knowing its type
    pub fn lookup_dyn(&self, handle: &str) -> Option<Arc<dyn Resource>> {
        self.entries
            .get(handle)
            .map(|entry| Arc::clone(&entry.resource))
    }

    /// Release a handle. Unknown or already-released handles are a no-op.
    ///
    /// Returns whether this call performed the release.
    pub fn release(&self, handle: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(handle) else {
            return false;
        };
        // The map shard lock is dropped before the hook runs, so hooks may
        // release other handles.
        entry.resource.on_release();
        self.released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RESOURCES_RELEASED).increment(1);
        debug!(handle, kind = entry.resource.kind(), "Released resource");
        true
    }

    /// Release every live handle. Used at process shutdown.
    pub fn release_all(&self) -> usize {
        let handles: Vec<ResourceHandle> = self.entries.iter().map(|e| e.key().clone()).collect();
        handles.iter().filter(|h| self.release(h)).count()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            registered: self.registered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            live: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        releases: AtomicUsize,
    }

    impl Tracked {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                releases: AtomicUsize::new(0),
            })
        }
    }

    impl Resource for Tracked {
        fn kind(&self) -> &'static str {
            "tracked"
        }

        fn on_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Owns a child handle and releases it in turn
    struct Parent {
        registry: Arc<ResourceRegistry>,
        child: ResourceHandle,
    }

    impl Resource for Parent {
        fn kind(&self) -> &'static str {
            "parent"
        }

        fn on_release(&self) {
            self.registry.release(&self.child);
        }
    }

    #[test]
    fn test_register_lookup_release() {
        let registry = ResourceRegistry::new();
        let tracked = Tracked::new();
        let handle = registry.register(tracked.clone());

        assert!(handle.starts_with("res-"));
        assert!(registry.contains(&handle));
        let found: Arc<Tracked> = registry.lookup(&handle).unwrap();
        assert!(Arc::ptr_eq(&found, &tracked));

        assert!(registry.release(&handle));
        assert_eq!(tracked.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.lookup::<Tracked>(&handle),
            Err(EngineError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = ResourceRegistry::new();
        let tracked = Tracked::new();
        let handle = registry.register(tracked.clone());

        assert!(registry.release(&handle));
        assert!(!registry.release(&handle));
        assert!(!registry.release("res-unknown"));
        assert_eq!(tracked.releases.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().released, 1);
    }

    #[test]
    fn test_type_mismatch() {
        let registry = Arc::new(ResourceRegistry::new());
        let handle = registry.register(Tracked::new());
        let result = registry.lookup::<Parent>(&handle);
        assert!(matches!(result, Err(EngineError::ResourceTypeMismatch { .. })));
    }

    #[test]
    fn test_cascading_release() {
        let registry = Arc::new(ResourceRegistry::new());
        let tracked = Tracked::new();
        let child = registry.register(tracked.clone());
        let parent = registry.register(Arc::new(Parent {
            registry: Arc::clone(&registry),
            child: child.clone(),
        }));

        assert_eq!(registry.len(), 2);
        registry.release(&parent);
        assert!(registry.is_empty());
        assert_eq!(tracked.releases.load(Ordering::SeqCst), 1);

        // Explicit release of the already-cascaded child is a no-op
        assert!(!registry.release(&child));
        assert_eq!(tracked.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_release_runs_hook_once() {
        let registry = Arc::new(ResourceRegistry::new());
        let tracked = Tracked::new();
        let handle = registry.register(tracked.clone());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let handle = handle.clone();
                std::thread::spawn(move || registry.release(&handle))
            })
            .collect();
        let wins = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|released| *released)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(tracked.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_all() {
        let registry = ResourceRegistry::new();
        let resources: Vec<_> = (0..3).map(|_| Tracked::new()).collect();
        for tracked in &resources {
            registry.register(tracked.clone());
        }
        assert_eq!(registry.release_all(), 3);
        assert!(resources.iter().all(|p| p.releases.load(Ordering::SeqCst) == 1));
    }
}
