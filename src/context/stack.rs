// src/context/stack.rs
//! Call-stack frames and the shared frame arena
//!
//! Contexts hold frame ids only; frames live in a [`StackArena`] shared by a
//! root context and every fork below it. A fork records where it branched
//! off as [`ForkParentInfo`] so its first frame becomes a child of that
//! branch point.
//!
//! ```text
//! root ──▶ [A depth 0] ──▶ [B depth 1] ──┬─ fork 1 ──▶ [C depth 2, path A/B/C]
//!                                        └─ fork 2 ──▶ [D depth 2, path A/B/D]
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

/// Branch point a fork inherits from its parent's active frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkParentInfo {
    pub stack_id: String,
    pub trace_id: String,
    pub depth: usize,
    pub path: Vec<String>,
}

/// One call frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    /// Frame id
    pub id: String,

    /// Trace shared by the whole call tree
    pub trace_id: String,

    /// Assistant executing in this frame
    pub assistant_id: String,

    /// Where the call came from (api, agent, tool, ...)
    pub referer: String,

    /// 0 for the root frame
    pub depth: usize,

    pub parent_id: Option<String>,

    /// Frame ids from the root down to and including this one
    pub path: Vec<String>,

    /// Per-call options
    pub options: Value,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: StackStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

fn new_stack_id() -> String {
    format!("stk-{}", ulid::Ulid::new())
}

impl Stack {
    /// A root frame; generates a trace id when none is given
    pub fn new_root(trace_id: Option<String>, assistant_id: &str, referer: &str, options: Value) -> Self {
        let id = new_stack_id();
        let trace_id = trace_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("trace-{}", ulid::Ulid::new()));
        Self {
            path: vec![id.clone()],
            id,
            trace_id,
            assistant_id: assistant_id.to_string(),
            referer: referer.to_string(),
            depth: 0,
            parent_id: None,
            options,
            created_at: Utc::now(),
            completed_at: None,
            status: StackStatus::Running,
            error: None,
            duration_ms: None,
        }
    }

    /// A frame nested directly below `parent`
    pub fn new_child(parent: &Stack, assistant_id: &str, referer: &str, options: Value) -> Self {
        Self::from_fork_parent(&parent.fork_info(), assistant_id, referer, options)
    }

    /// A frame nested below a fork's branch point
    pub fn from_fork_parent(
        parent: &ForkParentInfo,
        assistant_id: &str,
        referer: &str,
        options: Value,
    ) -> Self {
        let id = new_stack_id();
        let mut path = parent.path.clone();
        path.push(id.clone());
        Self {
            id,
            trace_id: parent.trace_id.clone(),
            assistant_id: assistant_id.to_string(),
            referer: referer.to_string(),
            depth: parent.depth + 1,
            parent_id: Some(parent.stack_id.clone()),
            path,
            options,
            created_at: Utc::now(),
            completed_at: None,
            status: StackStatus::Running,
            error: None,
            duration_ms: None,
        }
    }

    /// Branch-point description for forks taken while this frame is active
    pub fn fork_info(&self) -> ForkParentInfo {
        ForkParentInfo {
            stack_id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            depth: self.depth,
            path: self.path.clone(),
        }
    }

    fn finish(&mut self, status: StackStatus, error: Option<String>) {
        if self.status != StackStatus::Running {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.created_at).num_milliseconds());
    }

    pub fn complete(&mut self) {
        self.finish(StackStatus::Completed, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(StackStatus::Failed, Some(error.into()));
    }

    pub fn timeout(&mut self) {
        self.finish(StackStatus::Timeout, Some("timeout".to_string()));
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.status == StackStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        !self.is_running()
    }
}

/// Frame map shared between a root context and its forks
#[derive(Debug, Default)]
pub struct StackArena {
    frames: DashMap<String, Stack>,
}

impl StackArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stack: Stack) {
        self.frames.insert(stack.id.clone(), stack);
    }

    pub fn get(&self, id: &str) -> Option<Stack> {
        self.frames.get(id).map(|s| s.value().clone())
    }

    /// Mutate a frame in place; returns false when the id is unknown
    pub fn update<F: FnOnce(&mut Stack)>(&self, id: &str, f: F) -> bool {
        match self.frames.get_mut(id) {
            Some(mut stack) => {
                f(stack.value_mut());
                true
            }
            None => false,
        }
    }

    /// All frames, ordered by depth then creation time
    pub fn all(&self) -> Vec<Stack> {
        let mut stacks: Vec<Stack> = self.frames.iter().map(|s| s.value().clone()).collect();
        stacks.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.created_at.cmp(&b.created_at)));
        stacks
    }

    pub fn by_trace_id(&self, trace_id: &str) -> Vec<Stack> {
        self.all()
            .into_iter()
            .filter(|s| s.trace_id == trace_id)
            .collect()
    }

    /// Earliest root frame
    pub fn root(&self) -> Option<Stack> {
        self.all().into_iter().find(|s| s.is_root())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_child() {
        let root = Stack::new_root(None, "assistant-a", "api", Value::Null);
        assert!(root.is_root());
        assert_eq!(root.depth, 0);
        assert!(root.trace_id.starts_with("trace-"));
        assert_eq!(root.path, vec![root.id.clone()]);

        let child = Stack::new_child(&root, "assistant-b", "agent", Value::Null);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.path, vec![root.id.clone(), child.id.clone()]);
    }

    #[test]
    fn test_root_keeps_given_trace_id() {
        let root = Stack::new_root(Some("trace-x".into()), "a", "api", Value::Null);
        assert_eq!(root.trace_id, "trace-x");
        let root = Stack::new_root(Some(String::new()), "a", "api", Value::Null);
        assert_ne!(root.trace_id, "");
    }

    #[test]
    fn test_terminal_states() {
        let mut stack = Stack::new_root(None, "a", "api", Value::Null);
        assert!(stack.is_running());
        stack.fail("boom");
        assert!(stack.is_completed());
        assert_eq!(stack.status, StackStatus::Failed);
        assert!(stack.duration_ms.is_some());

        // First terminal state wins
        stack.complete();
        assert_eq!(stack.status, StackStatus::Failed);
        assert_eq!(stack.error.as_deref(), Some("boom"));

        let mut stack = Stack::new_root(None, "a", "api", Value::Null);
        stack.timeout();
        assert_eq!(stack.status, StackStatus::Timeout);
    }

    #[test]
    fn test_arena_queries() {
        let arena = StackArena::new();
        let root = Stack::new_root(None, "a", "api", Value::Null);
        let child = Stack::new_child(&root, "b", "agent", Value::Null);
        let other = Stack::new_root(Some("trace-other".into()), "c", "api", Value::Null);
        arena.insert(root.clone());
        arena.insert(child.clone());
        arena.insert(other);

        assert_eq!(arena.len(), 3);
        assert_eq!(arena.by_trace_id(&root.trace_id).len(), 2);
        assert!(arena.root().unwrap().is_root());
        assert!(arena.update(&child.id, |s| s.complete()));
        assert!(arena.get(&child.id).unwrap().is_completed());
        assert!(!arena.update("stk-missing", |s| s.complete()));

        arena.clear();
        assert!(arena.is_empty());
    }
}
