//! Lifetime Nodes
//!
//! This module defines the handles and arena slots of the ownership graph.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

/// Generation counter of an arena slot.
///
/// Bumped every time the slot is freed, so handles to a previous occupant
/// stop matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(u32);

impl Generation {
    /// The generation of a freshly created slot.
    pub const FIRST: Generation = Generation(0);

    /// Get the raw generation value.
    pub fn get(self) -> u32 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Handle to a lifetime scope.
///
/// Handles are `Copy` and never keep anything alive. Once the scope is
/// finalized the handle goes stale and every operation on it behaves as on
/// a finalized scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LifetimeId {
    index: u32,
    generation: Generation,
}

impl LifetimeId {
    /// Arena slot index.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued for.
    pub fn generation(self) -> Generation {
        self.generation
    }
}

impl fmt::Display for LifetimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lifetime#{}v{}", self.index, self.generation.0)
    }
}

/// Anything that owns a lifetime scope.
pub trait HasLifetime {
    /// The scope's handle.
    fn lifetime_id(&self) -> LifetimeId;
}

impl HasLifetime for LifetimeId {
    fn lifetime_id(&self) -> LifetimeId {
        *self
    }
}

impl<T: HasLifetime + ?Sized> HasLifetime for &T {
    fn lifetime_id(&self) -> LifetimeId {
        (**self).lifetime_id()
    }
}

/// A cleanup function registered on a scope.
pub(crate) type Finalizer = Box<dyn FnOnce()>;

/// A live scope: its finalizers and its edges.
#[derive(Default)]
pub(crate) struct LifetimeNode {
    /// Finalizers keyed by registration number, in registration order.
    pub(crate) finalizers: IndexMap<u64, Finalizer>,
    /// Scopes finalized together with this one, in link order.
    pub(crate) children: IndexSet<LifetimeId>,
    /// Scopes this one is linked under.
    pub(crate) owners: IndexSet<LifetimeId>,
}

impl fmt::Debug for LifetimeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeNode")
            .field("finalizers", &self.finalizers.len())
            .field("children", &self.children)
            .field("owners", &self.owners)
            .finish()
    }
}

/// One arena slot. `node` is `None` once the occupant has been finalized.
#[derive(Debug)]
pub(crate) struct Slot {
    generation: Generation,
    node: Option<LifetimeNode>,
}

impl Slot {
    pub(crate) fn occupied() -> Self {
        Self {
            generation: Generation::FIRST,
            node: Some(LifetimeNode::default()),
        }
    }

    /// Handle for the current occupant of slot `index`.
    pub(crate) fn handle(&self, index: u32) -> LifetimeId {
        LifetimeId {
            index,
            generation: self.generation,
        }
    }

    /// Put a fresh node into a freed slot.
    pub(crate) fn reoccupy(&mut self) {
        debug_assert!(self.node.is_none(), "reoccupying a live slot");
        self.node = Some(LifetimeNode::default());
    }

    /// The live node, if `id` refers to the current occupant.
    pub(crate) fn get(&self, id: LifetimeId) -> Option<&LifetimeNode> {
        if id.generation == self.generation {
            self.node.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, id: LifetimeId) -> Option<&mut LifetimeNode> {
        if id.generation == self.generation {
            self.node.as_mut()
        } else {
            None
        }
    }

    /// Remove the occupant and invalidate its handles.
    pub(crate) fn vacate(&mut self, id: LifetimeId) -> Option<LifetimeNode> {
        if id.generation != self.generation {
            return None;
        }
        let node = self.node.take()?;
        self.generation = self.generation.next();
        Some(node)
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self) -> bool {
        self.node.is_some()
    }
}
