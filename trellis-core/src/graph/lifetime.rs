//! Ownership Graph
//!
//! Scopes live in an arena owned by the runtime. Each scope holds cleanup
//! functions and links to child scopes. Finalizing a scope runs its own
//! finalizers, then finalizes its children.
//!
//! # How Finalization Works
//!
//! 1. The scope is removed from the arena before any of its finalizers run.
//!    Its slot gets a new generation, so every outstanding handle goes stale
//!    and a second `finalize` finds nothing to do.
//!
//! 2. The scope is unlinked from its owners and from its children's owner
//!    sets. A child with several owners is finalized by whichever owner goes
//!    first; the other owners simply lose the edge.
//!
//! 3. Finalizers run in registration order, then children are visited in
//!    link order (pre-order, with an explicit stack). No arena borrow is held
//!    while a finalizer runs, so finalizers may register, link and finalize
//!    freely.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Weak;
use std::thread;

use tracing::{debug, warn};

use super::node::{Finalizer, HasLifetime, LifetimeId, LifetimeNode, Slot};
use crate::reactive::runtime::RuntimeInner;
use crate::reactive::{Detach, Runtime};

/// Result of adding an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkOutcome {
    Linked,
    /// Self-link or finalized child: nothing to do.
    Ignored,
    /// The parent is gone; the child must be finalized now.
    ParentFinalized,
}

/// Arena of lifetime scopes.
#[derive(Default)]
pub(crate) struct LifetimeGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    next_finalizer: u64,
}

impl LifetimeGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate(&mut self) -> LifetimeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.reoccupy();
            return slot.handle(index);
        }

        let index = u32::try_from(self.slots.len()).expect("lifetime arena exhausted");
        self.slots.push(Slot::occupied());
        self.slots[index as usize].handle(index)
    }

    fn node(&self, id: LifetimeId) -> Option<&LifetimeNode> {
        self.slots.get(id.index() as usize)?.get(id)
    }

    fn node_mut(&mut self, id: LifetimeId) -> Option<&mut LifetimeNode> {
        self.slots.get_mut(id.index() as usize)?.get_mut(id)
    }

    pub(crate) fn is_live(&self, id: LifetimeId) -> bool {
        self.node(id).is_some()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }

    /// Register a finalizer. Hands it back if the scope is already gone.
    pub(crate) fn add_finalizer(
        &mut self,
        id: LifetimeId,
        finalizer: Finalizer,
    ) -> Result<u64, Finalizer> {
        let key = self.next_finalizer;
        match self.node_mut(id) {
            Some(node) => {
                node.finalizers.insert(key, finalizer);
                self.next_finalizer += 1;
                Ok(key)
            }
            None => Err(finalizer),
        }
    }

    pub(crate) fn remove_finalizer(&mut self, id: LifetimeId, key: u64) -> Option<Finalizer> {
        self.node_mut(id)?.finalizers.shift_remove(&key)
    }

    pub(crate) fn link(&mut self, parent: LifetimeId, child: LifetimeId) -> LinkOutcome {
        if parent == child || !self.is_live(child) {
            return LinkOutcome::Ignored;
        }
        let Some(parent_node) = self.node_mut(parent) else {
            return LinkOutcome::ParentFinalized;
        };
        parent_node.children.insert(child);
        if let Some(child_node) = self.node_mut(child) {
            child_node.owners.insert(parent);
        }
        LinkOutcome::Linked
    }

    pub(crate) fn unlink(&mut self, parent: LifetimeId, child: LifetimeId) -> bool {
        let removed = self
            .node_mut(parent)
            .map(|node| node.children.shift_remove(&child))
            .unwrap_or(false);
        if let Some(child_node) = self.node_mut(child) {
            child_node.owners.shift_remove(&parent);
        }
        removed
    }

    pub(crate) fn children(&self, id: LifetimeId) -> Vec<LifetimeId> {
        self.node(id)
            .map(|node| node.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Take a scope out of the arena and detach it from its neighbours.
    ///
    /// Returns `None` if the scope was already finalized.
    pub(crate) fn begin_finalize(&mut self, id: LifetimeId) -> Option<LifetimeNode> {
        let node = self.slots.get_mut(id.index() as usize)?.vacate(id)?;
        self.free.push(id.index());
        self.live -= 1;

        for owner in &node.owners {
            if let Some(owner_node) = self.node_mut(*owner) {
                owner_node.children.shift_remove(&id);
            }
        }
        for child in &node.children {
            if let Some(child_node) = self.node_mut(*child) {
                child_node.owners.shift_remove(&id);
            }
        }
        Some(node)
    }
}

impl fmt::Debug for LifetimeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeGraph")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .finish()
    }
}

/// Ownership operations of one runtime.
///
/// Obtained from [`Runtime::lifetime`].
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use trellis_core::reactive::Runtime;
///
/// let rt = Runtime::new();
/// let lifetime = rt.lifetime();
/// let parent = lifetime.scope();
/// let child = lifetime.scope();
/// lifetime.link(parent, child);
///
/// let closed = Rc::new(Cell::new(0));
/// let counter = closed.clone();
/// lifetime.on_cleanup(child, move || counter.set(counter.get() + 1));
///
/// lifetime.finalize(parent);
/// lifetime.finalize(parent);
/// assert_eq!(closed.get(), 1);
/// assert!(lifetime.is_finalized(child));
/// ```
#[derive(Clone)]
pub struct Lifetime {
    runtime: Runtime,
}

impl Lifetime {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    fn graph(&self) -> &RefCell<LifetimeGraph> {
        &self.runtime.inner.lifetimes
    }

    /// Allocate a new, empty scope.
    pub fn scope(&self) -> LifetimeId {
        self.graph().borrow_mut().allocate()
    }

    /// Allocate a new scope linked under `parent`.
    pub fn child_of(&self, parent: impl HasLifetime) -> LifetimeId {
        let child = self.scope();
        self.link(parent, child);
        child
    }

    /// Make `child` finalize whenever `parent` does.
    ///
    /// A child may have several owners. Linking under an already finalized
    /// parent finalizes the child immediately; linking a finalized child is a
    /// no-op.
    pub fn link(&self, parent: impl HasLifetime, child: impl HasLifetime) -> Unlink {
        let (parent, child) = (parent.lifetime_id(), child.lifetime_id());
        let outcome = self.graph().borrow_mut().link(parent, child);
        if outcome == LinkOutcome::ParentFinalized {
            debug!(%parent, %child, "linked under finalized parent");
            self.finalize(child);
        }
        Unlink {
            runtime: self.runtime.downgrade(),
            parent,
            child,
            detached: Cell::new(false),
        }
    }

    /// Remove the edge between `parent` and `child`. Returns whether there
    /// was one.
    pub fn unlink(&self, parent: impl HasLifetime, child: impl HasLifetime) -> bool {
        self.graph()
            .borrow_mut()
            .unlink(parent.lifetime_id(), child.lifetime_id())
    }

    /// Register `finalizer` to run when `scope` is finalized.
    ///
    /// On an already finalized scope the finalizer runs right away.
    pub fn on_cleanup<F>(&self, scope: impl HasLifetime, finalizer: F) -> CleanupHandle
    where
        F: FnOnce() + 'static,
    {
        let scope = scope.lifetime_id();
        let added = self
            .graph()
            .borrow_mut()
            .add_finalizer(scope, Box::new(finalizer));
        let key = match added {
            Ok(key) => Some(key),
            Err(finalizer) => {
                finalizer();
                None
            }
        };
        CleanupHandle {
            runtime: self.runtime.downgrade(),
            scope,
            key,
            detached: Cell::new(false),
        }
    }

    /// Finalize `scope` and, transitively, everything linked under it.
    ///
    /// Every finalizer runs at most once; finalizing twice is a no-op.
    ///
    /// # Panics
    ///
    /// If a finalizer panics, the remaining finalizers and children still
    /// run. With `isolate_panics` set the first panic is resumed afterwards;
    /// without it the panic propagates at once and the rest of the subtree
    /// is finalized while it unwinds.
    pub fn finalize(&self, scope: impl HasLifetime) {
        let root = scope.lifetime_id();
        let mut run = Finalization {
            lifetime: self,
            isolate: self.runtime.config().isolate_panics,
            pending: vec![root],
            current: None,
            first_panic: None,
            scopes: 0,
            finalizers: 0,
        };
        run.run();

        if run.scopes > 0 {
            debug!(root = %root, scopes = run.scopes, finalizers = run.finalizers, "lifetime finalized");
        }
        if let Some(payload) = run.first_panic.take() {
            panic::resume_unwind(payload);
        }
    }

    /// Whether `scope` has been finalized.
    pub fn is_finalized(&self, scope: impl HasLifetime) -> bool {
        !self.graph().borrow().is_live(scope.lifetime_id())
    }

    /// Children of `scope`, in link order.
    pub fn children(&self, scope: impl HasLifetime) -> Vec<LifetimeId> {
        self.graph().borrow().children(scope.lifetime_id())
    }
}

/// Traversal state of one [`Lifetime::finalize`] call.
///
/// If a finalizer unwinds out of `run` (panics not isolated), dropping the
/// state finishes the traversal, so the rest of the subtree is not left
/// live with its owner edges already cut.
struct Finalization<'a> {
    lifetime: &'a Lifetime,
    isolate: bool,
    pending: Vec<LifetimeId>,
    current: Option<(LifetimeId, indexmap::map::IntoIter<u64, Finalizer>)>,
    first_panic: Option<Box<dyn Any + Send>>,
    scopes: usize,
    finalizers: usize,
}

impl Finalization<'_> {
    fn run(&mut self) {
        loop {
            if let Some((id, finalizers)) = &mut self.current {
                let id = *id;
                if let Some((_, finalizer)) = finalizers.next() {
                    self.finalizers += 1;
                    self.call(id, finalizer);
                    continue;
                }
                self.current = None;
            }

            let Some(id) = self.pending.pop() else {
                break;
            };
            let taken = self.lifetime.graph().borrow_mut().begin_finalize(id);
            let Some(node) = taken else {
                continue;
            };
            self.scopes += 1;
            self.pending.extend(node.children.into_iter().rev());
            self.current = Some((id, node.finalizers.into_iter()));
        }
    }

    fn call(&mut self, id: LifetimeId, finalizer: Finalizer) {
        if !self.isolate {
            finalizer();
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(finalizer)) {
            warn!(scope = %id, "finalizer panicked");
            self.first_panic.get_or_insert(payload);
        }
    }
}

impl Drop for Finalization<'_> {
    fn drop(&mut self) {
        if !thread::panicking() || (self.current.is_none() && self.pending.is_empty()) {
            return;
        }
        warn!("finalizer unwound; finishing the remaining scopes");
        self.isolate = true;
        self.run();
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("graph", &*self.graph().borrow())
            .finish()
    }
}

/// Token returned by [`Lifetime::link`].
pub struct Unlink {
    runtime: Weak<RuntimeInner>,
    parent: LifetimeId,
    child: LifetimeId,
    detached: Cell<bool>,
}

impl Detach for Unlink {
    fn detach(&self) {
        if self.detached.replace(true) {
            return;
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.lifetimes.borrow_mut().unlink(self.parent, self.child);
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

impl fmt::Debug for Unlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unlink")
            .field("parent", &self.parent)
            .field("child", &self.child)
            .field("detached", &self.detached.get())
            .finish()
    }
}

/// Token returned by [`Lifetime::on_cleanup`]. Detaching drops the
/// finalizer without running it.
pub struct CleanupHandle {
    runtime: Weak<RuntimeInner>,
    scope: LifetimeId,
    /// `None` when the finalizer already ran at registration.
    key: Option<u64>,
    detached: Cell<bool>,
}

impl CleanupHandle {
    /// The scope the finalizer was registered on.
    pub fn scope(&self) -> LifetimeId {
        self.scope
    }
}

impl Detach for CleanupHandle {
    fn detach(&self) {
        if self.detached.replace(true) {
            return;
        }
        let (Some(runtime), Some(key)) = (self.runtime.upgrade(), self.key) else {
            return;
        };
        let removed = runtime.lifetimes.borrow_mut().remove_finalizer(self.scope, key);
        drop(removed);
    }

    fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

impl fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("scope", &self.scope)
            .field("detached", &self.detached.get())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
