// Lexical scope chain for variable bindings
// Frames are Rc-linked to their parent; closures share the frame they were defined in

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::sequence::Sequence;

pub type Env = Rc<Environment>;

/// One binding frame.
///
/// Creating a child frame is O(1); lookups walk the chain outward and the
/// first match wins. A frame only ever points at its parent, never at its
/// children.
#[derive(Debug, Default)]
pub struct Environment {
    bindings: RefCell<HashMap<String, Sequence>>,
    parent: Option<Env>,
}

impl Environment {
    /// Create a new root frame with no parent
    pub fn new() -> Env {
        Rc::new(Environment::default())
    }

    /// Create a child frame that inherits from `parent`
    pub fn extend(parent: &Env) -> Env {
        Rc::new(Environment {
            bindings: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    /// Insert or replace a binding in this frame
    pub fn bind(&self, name: impl Into<String>, value: Sequence) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look up a variable, walking the scope chain. Unbound names are absent.
    pub fn lookup(&self, name: &str) -> Sequence {
        let mut frame = self;
        loop {
            if let Some(value) = frame.bindings.borrow().get(name) {
                return value.clone();
            }
            match &frame.parent {
                Some(parent) => frame = parent,
                None => return Sequence::Absent,
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let mut frame = self;
        loop {
            if frame.bindings.borrow().contains_key(name) {
                return true;
            }
            match &frame.parent {
                Some(parent) => frame = parent,
                None => return false,
            }
        }
    }

    /// Drop every binding held by this frame
    pub fn clear(&self) {
        self.bindings.borrow_mut().clear();
    }
}

/// Frames that received a function binding, cleared when the guard drops.
///
/// A lambda bound into the frame it captured (directly or through a child
/// frame) forms an `Rc` cycle with it. Clearing the frame's bindings breaks
/// the cycle, so frames are cleared once no closure can run in them again.
#[derive(Debug, Default)]
pub struct FrameGuard {
    frames: Vec<Weak<Environment>>,
}

impl FrameGuard {
    pub fn watch(&mut self, frame: &Env) {
        if !self.frames.iter().any(|f| f.as_ptr() == Rc::as_ptr(frame)) {
            self.frames.push(Rc::downgrade(frame));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            if let Some(frame) = frame.upgrade() {
                frame.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::JValue;

    #[test]
    fn test_lookup_walks_outward() {
        let root = Environment::new();
        root.bind("x", Sequence::from(JValue::from(1i64)));
        let child = Environment::extend(&root);
        child.bind("y", Sequence::from(JValue::from(2i64)));

        assert_eq!(child.lookup("x"), Sequence::from(JValue::from(1i64)));
        assert_eq!(child.lookup("y"), Sequence::from(JValue::from(2i64)));
        assert!(root.lookup("y").is_absent());
        assert!(child.lookup("z").is_absent());
    }

    #[test]
    fn test_inner_binding_shadows_outer() {
        let root = Environment::new();
        root.bind("x", Sequence::from(JValue::from("outer")));
        let child = Environment::extend(&root);
        child.bind("x", Sequence::from(JValue::from("inner")));

        assert_eq!(child.lookup("x"), Sequence::from(JValue::from("inner")));
        assert_eq!(root.lookup("x"), Sequence::from(JValue::from("outer")));
    }

    #[test]
    fn test_clear_only_affects_own_frame() {
        let root = Environment::new();
        root.bind("x", Sequence::from(JValue::from(1i64)));
        let child = Environment::extend(&root);
        child.bind("y", Sequence::from(JValue::from(2i64)));
        child.clear();

        assert!(!child.contains("y"));
        assert!(child.contains("x"));
    }

    #[test]
    fn test_guard_clears_frames_on_drop() {
        let root = Environment::new();
        let frame = Environment::extend(&root);
        frame.bind("f", Sequence::from(JValue::from(1i64)));

        let mut guard = FrameGuard::default();
        guard.watch(&frame);
        guard.watch(&frame);
        assert_eq!(guard.frames.len(), 1);
        assert!(frame.contains("f"));

        drop(guard);
        assert!(!frame.contains("f"));
    }
}
