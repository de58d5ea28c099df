//! Lexically scoped environment frames
//!
//! Frames are heap-allocated and shared by reference so closures can
//! outlive the frames that created them. Lookups walk the parent chain;
//! definitions mutate the current frame only.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    bindings: Mutex<HashMap<String, Value>>,
    parent: Option<Env>,
}

impl Env {
    /// A fresh root frame.
    pub fn root() -> Self {
        Self {
            inner: Arc::new(EnvInner {
                bindings: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// A child frame whose parent is this frame.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                bindings: Mutex::new(HashMap::new()),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Bind in the current frame, shadowing any parent binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner
            .bindings
            .lock()
            .unwrap()
            .insert(name.into(), value);
    }

    /// Walk the parent chain for a binding.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut frame = Some(self.clone());
        while let Some(env) = frame {
            if let Some(value) = env.inner.bindings.lock().unwrap().get(name) {
                return Some(value.clone());
            }
            frame = env.inner.parent.clone();
        }
        None
    }

    /// Whether a binding exists anywhere in the chain.
    pub fn is_bound(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Two handles to the same frame.
    pub fn same_frame(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup() {
        let env = Env::root();
        env.define("x", Value::Int(1));
        assert_eq!(env.lookup("x"), Some(Value::Int(1)));
        assert_eq!(env.lookup("y"), None);
    }

    #[test]
    fn child_sees_parent_bindings() {
        let parent = Env::root();
        parent.define("x", Value::Int(1));
        let child = parent.child();
        assert_eq!(child.lookup("x"), Some(Value::Int(1)));
    }

    #[test]
    fn child_shadows_without_mutating_parent() {
        let parent = Env::root();
        parent.define("x", Value::Int(1));
        let child = parent.child();
        child.define("x", Value::Int(2));
        assert_eq!(child.lookup("x"), Some(Value::Int(2)));
        assert_eq!(parent.lookup("x"), Some(Value::Int(1)));
    }

    #[test]
    fn frames_are_shared_by_reference() {
        let env = Env::root();
        let alias = env.clone();
        alias.define("x", Value::Int(7));
        assert_eq!(env.lookup("x"), Some(Value::Int(7)));
        assert!(env.same_frame(&alias));
        assert!(!env.same_frame(&env.child()));
    }
}
