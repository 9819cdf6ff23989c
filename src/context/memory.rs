// src/context/memory.rs
//! Scoped key-value memory
//!
//! ```text
//! Memory
//! ├─ user     ┐
//! ├─ team     ├─ persistent, shared by every fork
//! ├─ chat     ┘
//! └─ context  ── request-scoped, one per context id
//! ```

use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Which tier a namespace belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Team,
    Chat,
    Context,
    /// Request-tree cache shared by a root and its forks
    Cache,
}

/// A thread-safe key-value namespace. Clones share storage.
#[derive(Debug, Clone)]
pub struct Namespace {
    scope: Scope,
    id: String,
    data: Arc<DashMap<String, Value>>,
}

impl Namespace {
    pub fn new(scope: Scope, id: impl Into<String>) -> Self {
        Self {
            scope,
            id: id.into(),
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    /// Store a value, returning the previous one
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Copy of the contents as a JSON object
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Whether two handles point at the same storage
    pub fn same_storage(&self, other: &Namespace) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// The four namespaces visible to one context
#[derive(Debug, Clone)]
pub struct Memory {
    pub user: Namespace,
    pub team: Namespace,
    pub chat: Namespace,
    pub context: Namespace,
}

impl Memory {
    /// Memory not backed by any manager
    pub fn detached(context_id: &str) -> Self {
        Self {
            user: Namespace::new(Scope::User, ""),
            team: Namespace::new(Scope::Team, ""),
            chat: Namespace::new(Scope::Chat, ""),
            context: Namespace::new(Scope::Context, context_id),
        }
    }

    /// Whether the `context` namespace is the one keyed by `context_id`
    pub fn owns_context(&self, context_id: &str) -> bool {
        self.context.id() == context_id
    }
}

/// Memory backend
pub trait MemoryManager: Send + Sync {
    /// Resolve the namespaces for a request
    fn get_or_create(&self, user: &str, team: &str, chat: &str, context_id: &str)
        -> Result<Memory>;

    /// Memory for a fork: same persistent tiers, fresh `context` namespace
    fn fork(&self, parent: &Memory, context_id: &str) -> Result<Memory>;

    /// Drop the request-scoped namespace for a context
    fn release_context(&self, context_id: &str);
}

/// In-process memory backend
#[derive(Default)]
pub struct InMemoryMemoryManager {
    users: DashMap<String, Namespace>,
    teams: DashMap<String, Namespace>,
    chats: DashMap<String, Namespace>,
    contexts: DashMap<String, Namespace>,
}

impl InMemoryMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty ids get a private namespace so anonymous requests never share
    fn resolve(map: &DashMap<String, Namespace>, scope: Scope, id: &str) -> Namespace {
        if id.is_empty() {
            return Namespace::new(scope, "");
        }
        map.entry(id.to_string())
            .or_insert_with(|| Namespace::new(scope, id))
            .clone()
    }

    fn context_namespace(&self, context_id: &str) -> Result<Namespace> {
        if context_id.is_empty() {
            return Err(EngineError::MemoryError(
                "context namespace requires a context id".to_string(),
            ));
        }
        Ok(Self::resolve(&self.contexts, Scope::Context, context_id))
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

impl MemoryManager for InMemoryMemoryManager {
    fn get_or_create(
        &self,
        user: &str,
        team: &str,
        chat: &str,
        context_id: &str,
    ) -> Result<Memory> {
        Ok(Memory {
            user: Self::resolve(&self.users, Scope::User, user),
            team: Self::resolve(&self.teams, Scope::Team, team),
            chat: Self::resolve(&self.chats, Scope::Chat, chat),
            context: self.context_namespace(context_id)?,
        })
    }

    fn fork(&self, parent: &Memory, context_id: &str) -> Result<Memory> {
        Ok(Memory {
            user: parent.user.clone(),
            team: parent.team.clone(),
            chat: parent.chat.clone(),
            context: self.context_namespace(context_id)?,
        })
    }

    fn release_context(&self, context_id: &str) {
        if self.contexts.remove(context_id).is_some() {
            debug!(context_id, "Dropped context memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_operations() {
        let ns = Namespace::new(Scope::Context, "ctx-1");
        assert!(ns.is_empty());
        assert_eq!(ns.set("b", json!(2)), None);
        ns.set("a", json!({"x": 1}));
        assert!(ns.has("a"));
        assert_eq!(ns.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ns.get("b"), Some(json!(2)));
        assert_eq!(ns.delete("b"), Some(json!(2)));
        assert_eq!(ns.snapshot().len(), 1);
        ns.clear();
        assert_eq!(ns.len(), 0);
    }

    #[test]
    fn test_persistent_tiers_are_shared() {
        let manager = InMemoryMemoryManager::new();
        let a = manager.get_or_create("u1", "t1", "c1", "ctx-a").unwrap();
        let b = manager.get_or_create("u1", "t1", "c1", "ctx-b").unwrap();

        a.user.set("name", json!("ada"));
        assert_eq!(b.user.get("name"), Some(json!("ada")));
        assert!(a.chat.same_storage(&b.chat));
        assert!(!a.context.same_storage(&b.context));
    }

    #[test]
    fn test_anonymous_ids_are_private() {
        let manager = InMemoryMemoryManager::new();
        let a = manager.get_or_create("", "", "", "ctx-a").unwrap();
        let b = manager.get_or_create("", "", "", "ctx-b").unwrap();
        assert!(!a.user.same_storage(&b.user));
    }

    #[test]
    fn test_fork_isolates_context_namespace() {
        let manager = InMemoryMemoryManager::new();
        let parent = manager.get_or_create("u1", "", "c1", "ctx-p").unwrap();
        parent.context.set("k", json!("parent"));

        let child = manager.fork(&parent, "ctx-c").unwrap();
        assert!(child.owns_context("ctx-c"));
        assert!(child.user.same_storage(&parent.user));
        assert!(child.context.get("k").is_none());

        child.context.set("k", json!("child"));
        assert_eq!(parent.context.get("k"), Some(json!("parent")));

        manager.release_context("ctx-c");
        assert_eq!(manager.context_count(), 1);
    }

    #[test]
    fn test_fork_requires_context_id() {
        let manager = InMemoryMemoryManager::new();
        let parent = Memory::detached("ctx-p");
        assert!(matches!(
            manager.fork(&parent, ""),
            Err(EngineError::MemoryError(_))
        ));
    }
}
