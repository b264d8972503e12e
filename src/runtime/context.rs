//! Execution contexts: per-run cancellation state and handler resolution.
//!
//! Contexts form a tree. Each run gets a fresh root; forks and scopes
//! derive children. A context is cancelled when its own flag is set or any
//! ancestor is cancelled, and `cancel` propagates strictly downward:
//! ancestors never become cancelled because of a child.
//!
//! Children are held weakly. A child context lives exactly as long as the
//! run (or fiber) that allocated it; once that run completes and drops its
//! strong reference, the parent's entry goes stale and is pruned on the
//! next cancellation sweep. Ownership therefore points only upward and
//! per-run contexts are freed when the run completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::capability::CapabilityHandler;

/// A node in the context tree.
///
/// Immutable except for the cancellation flag and the child list, both of
/// which are safe to touch from any task sharing the context.
pub struct ExecutionContext {
    parent: Option<Arc<ExecutionContext>>,
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<ExecutionContext>>>,
    handler: Option<Arc<dyn CapabilityHandler>>,
}

impl ExecutionContext {
    /// Allocates a fresh root context with no handler bound.
    #[must_use]
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            handler: None,
        })
    }

    /// Derives a child context, inheriting the bound handler.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Arc::new(Self {
            parent: Some(self.clone()),
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            handler: self.handler.clone(),
        });
        self.children.lock().push(Arc::downgrade(&child));
        child
    }

    /// Derives a sibling sharing this context's parent, with the given
    /// handler installed.
    #[must_use]
    pub fn with_handler(self: &Arc<Self>, handler: Arc<dyn CapabilityHandler>) -> Arc<Self> {
        let sibling = Arc::new(Self {
            parent: self.parent.clone(),
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            handler: Some(handler),
        });
        if let Some(parent) = &sibling.parent {
            parent.children.lock().push(Arc::downgrade(&sibling));
        }
        sibling
    }

    /// `true` when this context or any ancestor has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        let mut ancestor = self.parent.as_deref();
        while let Some(context) = ancestor {
            if context.cancelled.load(Ordering::Acquire) {
                return true;
            }
            ancestor = context.parent.as_deref();
        }
        false
    }

    /// Cancels this context and, transitively, every live descendant.
    ///
    /// Idempotent; already-cancelled subtrees are not walked again. Stale
    /// child entries are pruned along the way.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut pending: Vec<Arc<ExecutionContext>> = {
            let mut children = self.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };

        while let Some(context) = pending.pop() {
            if context
                .cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let mut children = context.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            pending.extend(children.iter().filter_map(Weak::upgrade));
        }
    }

    /// Resolves the nearest bound capability handler, walking up the
    /// parent chain.
    #[must_use]
    pub fn resolve_handler(&self) -> Option<Arc<dyn CapabilityHandler>> {
        if let Some(handler) = &self.handler {
            return Some(handler.clone());
        }
        let mut ancestor = self.parent.as_deref();
        while let Some(context) = ancestor {
            if let Some(handler) = &context.handler {
                return Some(handler.clone());
            }
            ancestor = context.parent.as_deref();
        }
        None
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionContext")
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .field("has_parent", &self.parent.is_some())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{AnyCapability, HandlerOutcome};
    use rstest::rstest;

    struct NullHandler;

    impl CapabilityHandler for NullHandler {
        fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
            HandlerOutcome::Rejected(capability)
        }
    }

    #[rstest]
    fn fresh_root_is_not_cancelled() {
        let root = ExecutionContext::root();
        assert!(!root.is_cancelled());
        assert!(root.resolve_handler().is_none());
    }

    #[rstest]
    fn cancellation_propagates_downward_only() {
        let root = ExecutionContext::root();
        let child = root.child();
        let grandchild = child.child();

        child.cancel();

        assert!(!root.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[rstest]
    fn child_cancellation_does_not_reach_parent() {
        let root = ExecutionContext::root();
        let child = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[rstest]
    fn cancellation_is_monotonic_for_later_children() {
        let root = ExecutionContext::root();
        root.cancel();
        root.cancel();

        // Derived after the fact, observes cancellation immediately.
        let child = root.child();
        assert!(child.is_cancelled());
    }

    #[rstest]
    fn handler_is_inherited_by_children() {
        let root = ExecutionContext::root();
        let with_handler = root.with_handler(Arc::new(NullHandler));
        let child = with_handler.child();
        let grandchild = child.child();

        assert!(with_handler.resolve_handler().is_some());
        assert!(child.resolve_handler().is_some());
        assert!(grandchild.resolve_handler().is_some());
        assert!(root.resolve_handler().is_none());
    }

    #[rstest]
    fn with_handler_shares_the_parent() {
        let root = ExecutionContext::root();
        let child = root.child();
        let sibling = child.with_handler(Arc::new(NullHandler));

        // The sibling hangs off root, so cancelling child does not touch it.
        child.cancel();
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
    }

    #[rstest]
    fn dropped_children_are_pruned_on_cancel() {
        let root = ExecutionContext::root();
        for _ in 0..64 {
            drop(root.child());
        }
        let survivor = root.child();
        root.cancel();
        assert!(survivor.is_cancelled());
    }
}
