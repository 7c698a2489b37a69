//! Tracked Collections
//!
//! [`TrackedMap`] is a map whose reads and writes go through tags, so
//! formulas reading it are invalidated precisely.
//!
//! # Tags
//!
//! - Each key has its own cell tag, created on the first tracked point read
//!   (`get`, `contains_key`). The read consumes it whether or not the key is
//!   present, so a formula that saw a key missing is invalidated when it is
//!   inserted. A key tag only lives while some dependency set holds it; the
//!   map drops tags nothing else refers to.
//! - One iteration tag covers whole-map reads (`len`, `keys`, `values`,
//!   `entries`). Every write updates it.
//!
//! Each write bumps the clock once, however many tags it touches.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;

use super::runtime::Runtime;
use super::tag::{Tag, Tagged};

/// Key tag count below which creating a tag never sweeps.
const MIN_SWEEP: usize = 32;

struct TrackedMapInner<K, V> {
    runtime: Runtime,
    description: String,
    entries: RefCell<IndexMap<K, V>>,
    key_tags: RefCell<HashMap<K, Tag>>,
    /// Sweep unreferenced key tags when `key_tags` reaches this size.
    sweep_at: Cell<usize>,
    iteration: Tag,
}

/// A map with per-key dependency tracking.
///
/// Entries keep insertion order. Cloning a `TrackedMap` creates a new handle
/// to the **same** map.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{Formula, Runtime, TrackedMap};
///
/// let rt = Runtime::new();
/// let scores: TrackedMap<&str, u32> = TrackedMap::new(&rt);
/// let alice = {
///     let scores = scores.clone();
///     Formula::new(&rt, move || scores.get(&"alice").unwrap_or(0))
/// };
///
/// assert_eq!(alice.current(), 0);
/// scores.insert("bob", 3);
/// assert!(!alice.is_stale());
/// scores.insert("alice", 7);
/// assert_eq!(alice.current(), 7);
/// ```
pub struct TrackedMap<K: 'static, V: 'static> {
    inner: Rc<TrackedMapInner<K, V>>,
}

impl<K, V> TrackedMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: 'static,
{
    /// Create an empty map.
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_description(runtime, "map")
    }

    /// Create an empty map with a description used in logs.
    pub fn with_description(runtime: &Runtime, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            inner: Rc::new(TrackedMapInner {
                iteration: Tag::cell(format!("{description}.iter"), runtime.now()),
                runtime: runtime.clone(),
                description,
                entries: RefCell::new(IndexMap::new()),
                key_tags: RefCell::new(HashMap::new()),
                sweep_at: Cell::new(MIN_SWEEP),
            }),
        }
    }

    fn key_tag(&self, key: &K) -> Tag {
        let mut tags = self.inner.key_tags.borrow_mut();
        if let Some(tag) = tags.get(key) {
            return tag.clone();
        }
        if tags.len() >= self.inner.sweep_at.get() {
            tags.retain(|_, tag| tag.handle_count() > 1);
            self.inner.sweep_at.set((tags.len() * 2).max(MIN_SWEEP));
        }
        let tag = Tag::cell(
            format!("{}.entry", self.inner.description),
            self.inner.runtime.now(),
        );
        tags.insert(key.clone(), tag.clone());
        tag
    }

    /// The key's tag, if anything has tracked the key.
    fn existing_key_tag(&self, key: &K) -> Option<Tag> {
        self.inner.key_tags.borrow().get(key).cloned()
    }

    /// Stamp the given key tags and the iteration tag with one write, then
    /// drop the key tags only the map still holds.
    fn write(&self, keys: Vec<(K, Tag)>) {
        let mut refs: Vec<&Tag> = keys.iter().map(|(_, tag)| tag).collect();
        refs.push(&self.inner.iteration);
        self.inner.runtime.record_write(&refs);
        drop(refs);

        let mut tags = self.inner.key_tags.borrow_mut();
        for (key, tag) in keys {
            drop(tag);
            if tags.get(&key).is_some_and(|tag| tag.handle_count() == 1) {
                tags.remove(&key);
            }
        }
    }

    fn consume_key(&self, key: &K) {
        if self.inner.runtime.is_tracking() {
            let tag = self.key_tag(key);
            self.inner.runtime.consume(&tag);
        }
    }

    fn consume_iteration(&self) {
        self.inner.runtime.consume(&self.inner.iteration);
    }

    /// The value for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.consume_key(key);
        self.inner.entries.borrow().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.consume_key(key);
        self.inner.entries.borrow().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.consume_iteration();
        self.inner.entries.borrow().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys, in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.consume_iteration();
        self.inner.entries.borrow().keys().cloned().collect()
    }

    /// Snapshot of the values, in insertion order.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.consume_iteration();
        self.inner.entries.borrow().values().cloned().collect()
    }

    /// Snapshot of the entries, in insertion order.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.consume_iteration();
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert or replace the value for `key`, returning the previous one.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let tagged: Vec<(K, Tag)> = self
            .existing_key_tag(&key)
            .map(|tag| (key.clone(), tag))
            .into_iter()
            .collect();
        let previous = self.inner.entries.borrow_mut().insert(key, value);
        self.write(tagged);
        previous
    }

    /// Remove `key`, returning its value. Removing an absent key is not a
    /// write.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.entries.borrow_mut().shift_remove(key);
        if removed.is_some() {
            let tagged: Vec<(K, Tag)> = self
                .existing_key_tag(key)
                .map(|tag| (key.clone(), tag))
                .into_iter()
                .collect();
            self.write(tagged);
        }
        removed
    }

    /// Remove every entry. Clearing an empty map is not a write.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.inner.entries.borrow_mut());
        if drained.is_empty() {
            return;
        }
        let tagged: Vec<(K, Tag)> = drained
            .into_keys()
            .filter_map(|key| self.existing_key_tag(&key).map(|tag| (key, tag)))
            .collect();
        self.write(tagged);
    }
}

impl<K: 'static, V: 'static> Tagged for TrackedMap<K, V> {
    /// The iteration tag: every write to the map updates it.
    fn tag(&self) -> Tag {
        self.inner.iteration.clone()
    }
}

impl<K: 'static, V: 'static> Clone for TrackedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: Debug + 'static, V: Debug + 'static> Debug for TrackedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedMap")
            .field("description", &self.inner.description)
            .field("entries", &*self.inner.entries.borrow())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Formula;

    fn map(rt: &Runtime) -> TrackedMap<String, i32> {
        TrackedMap::with_description(rt, "scores")
    }

    #[test]
    fn basic_map_operations() {
        let rt = Runtime::new();
        let scores = map(&rt);
        assert!(scores.is_empty());

        assert_eq!(scores.insert("a".into(), 1), None);
        assert_eq!(scores.insert("b".into(), 2), None);
        assert_eq!(scores.insert("a".into(), 3), Some(1));
        assert_eq!(scores.get(&"a".into()), Some(3));
        assert_eq!(scores.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(scores.remove(&"a".into()), Some(3));
        assert_eq!(scores.entries(), vec![("b".to_string(), 2)]);
    }

    #[test]
    fn point_read_ignores_other_keys() {
        let rt = Runtime::new();
        let scores = map(&rt);
        scores.insert("a".into(), 1);
        let a = {
            let scores = scores.clone();
            Formula::new(&rt, move || scores.get(&"a".to_string()))
        };

        assert_eq!(a.current(), Some(1));
        scores.insert("b".into(), 2);
        scores.remove(&"b".into());
        assert!(!a.is_stale());

        scores.insert("a".into(), 5);
        assert_eq!(a.current(), Some(5));
        assert_eq!(a.evaluations(), 2);
    }

    #[test]
    fn observed_absence_is_invalidated_by_insert() {
        let rt = Runtime::new();
        let scores = map(&rt);
        let has_c = {
            let scores = scores.clone();
            Formula::new(&rt, move || scores.contains_key(&"c".to_string()))
        };

        assert!(!has_c.current());
        scores.insert("c".into(), 0);
        assert!(has_c.current());
    }

    #[test]
    fn key_tags_are_dropped_once_unreferenced() {
        let rt = Runtime::new();
        let scores: TrackedMap<u32, u32> = TrackedMap::new(&rt);

        for k in 0..1000 {
            scores.insert(k, k);
            scores.remove(&k);
            let missing = {
                let scores = scores.clone();
                Formula::new(&rt, move || scores.get(&(k + 100_000)))
            };
            assert_eq!(missing.current(), None);
        }
        assert!(scores.is_empty());
        assert!(scores.inner.key_tags.borrow().len() <= MIN_SWEEP);

        // A tag still held by a live formula survives sweeps and removal.
        scores.insert(7, 1);
        let seven = {
            let scores = scores.clone();
            Formula::new(&rt, move || scores.get(&7))
        };
        assert_eq!(seven.current(), Some(1));
        for k in 0..(MIN_SWEEP as u32 * 4) {
            let other = {
                let scores = scores.clone();
                Formula::new(&rt, move || scores.contains_key(&(k + 500)))
            };
            other.current();
        }
        scores.remove(&7);
        assert!(scores.inner.key_tags.borrow().contains_key(&7));
        assert_eq!(seven.current(), None);
        scores.insert(7, 2);
        assert_eq!(seven.current(), Some(2));
    }

    #[test]
    fn iteration_reads_see_every_write() {
        let rt = Runtime::new();
        let scores = map(&rt);
        let total = {
            let scores = scores.clone();
            Formula::new(&rt, move || scores.values().iter().sum::<i32>())
        };

        assert_eq!(total.current(), 0);
        scores.insert("a".into(), 4);
        assert_eq!(total.current(), 4);
        scores.insert("a".into(), 6);
        assert_eq!(total.current(), 6);
        scores.clear();
        assert_eq!(total.current(), 0);
    }

    #[test]
    fn no_op_writes_do_not_bump() {
        let rt = Runtime::new();
        let scores = map(&rt);
        let now = rt.now();

        assert_eq!(scores.remove(&"missing".into()), None);
        scores.clear();
        assert_eq!(rt.now(), now);
    }

    #[test]
    fn each_write_bumps_once() {
        let rt = Runtime::new();
        let scores = map(&rt);
        let before = rt.now().get();

        scores.insert("a".into(), 1);
        scores.insert("b".into(), 2);
        scores.clear();
        assert_eq!(rt.now().get(), before + 3);
    }

    #[test]
    fn subscribers_hear_every_write() {
        let rt = Runtime::new();
        let scores = map(&rt);
        let fired = Rc::new(std::cell::Cell::new(0));
        let seen = fired.clone();
        let _sub = rt.subscribe(&scores, move || seen.set(seen.get() + 1));

        scores.insert("a".into(), 1);
        rt.flush().unwrap();
        assert_eq!(fired.get(), 1);
    }
}
