//! Subscriptions
//!
//! A subscription pairs a tag with a "ready" callback. The callback tells
//! external code (a renderer, a store adapter) that the value behind the tag
//! may have changed and is worth re-polling. Nothing is recomputed eagerly.
//!
//! # Indexing
//!
//! Cell writes are what trigger notifications, so each subscription is
//! indexed under every tag reachable from its root tag at subscribe time:
//! the root itself, intermediate formulas and the leaf cells. A write to a
//! cell finds its subscribers with one lookup.
//!
//! Formulas change shape between evaluations. After a formula replaces its
//! dependency set, every subscription whose reachable set contains that
//! formula is re-walked from its root and re-indexed. This happens
//! synchronously inside the evaluation, before anything else can write.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::runtime::RuntimeInner;
use super::tag::{Tag, TagId};
use crate::error::BoxError;

/// Unique identifier for a subscription within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Callback stored for a subscription.
pub(crate) type ReadyCallback = Rc<dyn Fn() -> Result<(), BoxError>>;

struct Subscription {
    root: Tag,
    callback: ReadyCallback,
    /// Every tag reachable from `root` when last synchronized.
    reachable: IndexSet<TagId>,
}

/// A subscription selected for delivery during a flush.
pub(crate) struct Ready {
    pub(crate) id: SubscriptionId,
    pub(crate) description: String,
    pub(crate) callback: ReadyCallback,
}

/// Subscriptions of one runtime, indexed by reachable tag.
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: IndexMap<SubscriptionId, Subscription>,
    by_tag: HashMap<TagId, IndexSet<SubscriptionId>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            subscriptions: IndexMap::new(),
            by_tag: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, root: Tag, callback: ReadyCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let reachable: IndexSet<TagId> = root.reachable().into_keys().collect();
        for tag_id in &reachable {
            self.by_tag.entry(*tag_id).or_default().insert(id);
        }
        debug!(subscription = %id, root = %root.id(), watched = reachable.len(), "subscribed");

        self.subscriptions.insert(
            id,
            Subscription {
                root,
                callback,
                reachable,
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.shift_remove(&id) else {
            return false;
        };
        for tag_id in &subscription.reachable {
            self.unindex(*tag_id, id);
        }
        debug!(subscription = %id, "unsubscribed");
        true
    }

    fn unindex(&mut self, tag_id: TagId, id: SubscriptionId) {
        if let Some(ids) = self.by_tag.get_mut(&tag_id) {
            ids.shift_remove(&id);
            if ids.is_empty() {
                self.by_tag.remove(&tag_id);
            }
        }
    }

    /// Re-walk every subscription that reaches `changed` and fix the index.
    pub(crate) fn resync(&mut self, changed: TagId) {
        let Some(affected) = self.by_tag.get(&changed).cloned() else {
            return;
        };

        for id in affected {
            let Some(subscription) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            let next: IndexSet<TagId> = subscription.root.reachable().into_keys().collect();
            let previous = std::mem::replace(&mut subscription.reachable, next.clone());

            for tag_id in next.difference(&previous) {
                self.by_tag.entry(*tag_id).or_default().insert(id);
            }
            for tag_id in previous.difference(&next) {
                self.unindex(*tag_id, id);
            }
        }
    }

    /// The first subscription reachable from `batch` that has not fired yet.
    ///
    /// Subscriptions are visited in batch order, then subscription order,
    /// so delivery is deterministic.
    pub(crate) fn next_ready(
        &self,
        batch: &IndexSet<TagId>,
        fired: &IndexSet<SubscriptionId>,
    ) -> Option<Ready> {
        batch
            .iter()
            .filter_map(|tag_id| self.by_tag.get(tag_id))
            .flat_map(|ids| ids.iter())
            .find(|id| !fired.contains(*id))
            .and_then(|id| {
                self.subscriptions.get(id).map(|subscription| Ready {
                    id: *id,
                    description: subscription.root.description().to_string(),
                    callback: Rc::clone(&subscription.callback),
                })
            })
    }

    /// Subscriptions indexed under `tag_id`.
    #[cfg(test)]
    pub(crate) fn watching(&self, tag_id: TagId) -> Vec<SubscriptionId> {
        self.by_tag
            .get(&tag_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Common interface of the idempotent tokens returned by `subscribe`,
/// `link` and `on_cleanup`.
///
/// Detaching twice, or after the underlying registration is already gone,
/// is a no-op. Dropping a token does **not** detach it.
pub trait Detach {
    /// Undo the registration.
    fn detach(&self);

    /// Whether [`detach`](Detach::detach) has been called.
    fn is_detached(&self) -> bool;
}

/// Token returned by [`Runtime::subscribe`](super::Runtime::subscribe).
pub struct Unsubscribe {
    runtime: Weak<RuntimeInner>,
    id: SubscriptionId,
    detached: Cell<bool>,
}

impl Unsubscribe {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, id: SubscriptionId) -> Self {
        Self {
            runtime,
            id,
            detached: Cell::new(false),
        }
    }

    /// The subscription's ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription. Same as [`Detach::detach`].
    pub fn unsubscribe(&self) {
        self.detach();
    }
}

impl Detach for Unsubscribe {
    fn detach(&self) {
        if self.detached.replace(true) {
            return;
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.subscriptions.borrow_mut().remove(self.id);
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("detached", &self.detached.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::clock::Timestamp;
    use crate::reactive::tag::DependencySet;

    fn noop() -> ReadyCallback {
        Rc::new(|| Ok(()))
    }

    #[test]
    fn subscription_ids_are_unique() {
        let mut registry = SubscriptionRegistry::new();
        let tag = Tag::cell("x", Timestamp::INITIAL);
        let a = registry.insert(tag.clone(), noop());
        let b = registry.insert(tag, noop());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn subscription_is_indexed_under_leaves() {
        let mut registry = SubscriptionRegistry::new();
        let x = Tag::cell("x", Timestamp::INITIAL);
        let formula = Tag::formula("f");
        formula.set_dependencies(DependencySet::from_unique(vec![x.clone()]));

        let id = registry.insert(formula.clone(), noop());
        assert_eq!(registry.watching(x.id()), vec![id]);
        assert_eq!(registry.watching(formula.id()), vec![id]);
    }

    #[test]
    fn resync_follows_dependency_changes() {
        let mut registry = SubscriptionRegistry::new();
        let x = Tag::cell("x", Timestamp::INITIAL);
        let y = Tag::cell("y", Timestamp::INITIAL);
        let formula = Tag::formula("branch");
        formula.set_dependencies(DependencySet::from_unique(vec![x.clone()]));

        let id = registry.insert(formula.clone(), noop());
        formula.set_dependencies(DependencySet::from_unique(vec![y.clone()]));
        registry.resync(formula.id());

        assert!(registry.watching(x.id()).is_empty());
        assert_eq!(registry.watching(y.id()), vec![id]);
    }

    #[test]
    fn remove_clears_index() {
        let mut registry = SubscriptionRegistry::new();
        let x = Tag::cell("x", Timestamp::INITIAL);
        let id = registry.insert(x.clone(), noop());

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.watching(x.id()).is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn next_ready_skips_fired() {
        let mut registry = SubscriptionRegistry::new();
        let x = Tag::cell("x", Timestamp::INITIAL);
        let a = registry.insert(x.clone(), noop());
        let b = registry.insert(x.clone(), noop());

        let batch: IndexSet<TagId> = [x.id()].into_iter().collect();
        let mut fired = IndexSet::new();

        let first = registry.next_ready(&batch, &fired).unwrap();
        assert_eq!(first.id, a);
        fired.insert(first.id);

        let second = registry.next_ready(&batch, &fired).unwrap();
        assert_eq!(second.id, b);
        fired.insert(second.id);

        assert!(registry.next_ready(&batch, &fired).is_none());
    }
}
