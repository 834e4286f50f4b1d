use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Per-working-directory stacks of open session ids.
///
/// A session newly starting in a directory is assumed to be spawned by the
/// session currently on top of that directory's stack. Stacks for different
/// directories are fully independent; no cross-directory ordering exists.
#[derive(Default)]
pub struct SessionStacks {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl SessionStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a session onto its directory's stack. Idempotent: a session id
    /// already present is not pushed again.
    pub fn push_session(&self, dir: &str, session_id: &str) {
        let mut inner = self.inner.lock().expect("session stacks poisoned");
        let stack = inner.entry(dir.to_string()).or_default();
        if stack.iter().any(|s| s == session_id) {
            return;
        }
        stack.push(session_id.to_string());
        debug!(dir, session_id, depth = stack.len(), "session pushed");
    }

    /// Remove a session by value, wherever it sits in the stack. Sessions may
    /// end out of order when a nested CLI outlives its parent.
    pub fn pop_session(&self, dir: &str, session_id: &str) {
        let mut inner = self.inner.lock().expect("session stacks poisoned");
        if let Some(stack) = inner.get_mut(dir) {
            stack.retain(|s| s != session_id);
            if stack.is_empty() {
                inner.remove(dir);
            }
            debug!(dir, session_id, "session popped");
        }
    }

    /// Nearest enclosing parent for a session about to start in `dir`.
    pub fn current_parent_session(&self, dir: &str) -> Option<String> {
        let inner = self.inner.lock().expect("session stacks poisoned");
        inner.get(dir).and_then(|stack| stack.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_of_stack_is_the_parent() {
        let stacks = SessionStacks::new();
        stacks.push_session("/p", "outer");
        stacks.push_session("/p", "inner");
        assert_eq!(stacks.current_parent_session("/p").as_deref(), Some("inner"));
    }

    #[test]
    fn push_then_pop_leaves_no_parent() {
        let stacks = SessionStacks::new();
        stacks.push_session("/p", "s1");
        stacks.pop_session("/p", "s1");
        assert_eq!(stacks.current_parent_session("/p"), None);
    }

    #[test]
    fn push_is_idempotent() {
        let stacks = SessionStacks::new();
        stacks.push_session("/p", "s1");
        stacks.push_session("/p", "s1");
        stacks.pop_session("/p", "s1");
        assert_eq!(stacks.current_parent_session("/p"), None);
    }

    #[test]
    fn out_of_order_pop_removes_by_value() {
        let stacks = SessionStacks::new();
        stacks.push_session("/p", "outer");
        stacks.push_session("/p", "inner");
        stacks.pop_session("/p", "outer");
        assert_eq!(stacks.current_parent_session("/p").as_deref(), Some("inner"));
    }

    #[test]
    fn directories_are_independent() {
        let stacks = SessionStacks::new();
        stacks.push_session("/a", "s1");
        stacks.push_session("/b", "s2");
        assert_eq!(stacks.current_parent_session("/a").as_deref(), Some("s1"));
        assert_eq!(stacks.current_parent_session("/b").as_deref(), Some("s2"));
    }
}
