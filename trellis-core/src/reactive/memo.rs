//! Memoized Getters
//!
//! A `Memoized` wraps a getter function `Fn(&O) -> T` so that calling it on
//! an instance behaves like reading a formula: the result is cached per
//! instance and recomputed only when a tracked value the getter read has
//! changed.
//!
//! # How It Works
//!
//! 1. The first `get` for an instance creates a [`Formula`] over a weak
//!    reference to that instance and stores it in a side table keyed by the
//!    instance's address.
//!
//! 2. Later calls find the formula and read it, so the usual staleness
//!    rules apply.
//!
//! 3. The table never keeps an instance alive. Entries whose instance has
//!    been dropped are pruned whenever a new entry is added, and an entry is
//!    only reused if its weak reference still points at the same live
//!    instance.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use super::formula::Formula;
use super::runtime::Runtime;
use super::tag::{Tag, Tagged};

struct Entry<O, T: 'static> {
    instance: Weak<O>,
    formula: Formula<Option<T>>,
}

/// A getter whose result is memoized per instance.
///
/// # Example
///
/// ```rust
/// use std::rc::Rc;
///
/// use trellis_core::reactive::{Cell, Memoized, Runtime};
///
/// struct Person {
///     first: Cell<String>,
///     last: Cell<String>,
/// }
///
/// let rt = Runtime::new();
/// let full_name = Memoized::new(&rt, |p: &Person| {
///     format!("{} {}", p.first.current(), p.last.current())
/// });
///
/// let tom = Rc::new(Person {
///     first: Cell::new(&rt, "Tom".to_string()),
///     last: Cell::new(&rt, "Dale".to_string()),
/// });
///
/// assert_eq!(full_name.get(&tom), "Tom Dale");
/// tom.first.set("Thomas".to_string()).unwrap();
/// assert_eq!(full_name.get(&tom), "Thomas Dale");
/// ```
pub struct Memoized<O: 'static, T: 'static> {
    runtime: Runtime,
    description: String,
    getter: Rc<dyn Fn(&O) -> T>,
    table: RefCell<HashMap<usize, Entry<O, T>>>,
}

impl<O: 'static, T: 'static> Memoized<O, T> {
    /// Wrap `getter`.
    pub fn new<F>(runtime: &Runtime, getter: F) -> Self
    where
        F: Fn(&O) -> T + 'static,
    {
        Self::with_description(runtime, "getter", getter)
    }

    /// Wrap `getter`, naming the per-instance formulas for logs.
    pub fn with_description<F>(runtime: &Runtime, description: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&O) -> T + 'static,
    {
        Self {
            runtime: runtime.clone(),
            description: description.into(),
            getter: Rc::new(getter),
            table: RefCell::new(HashMap::new()),
        }
    }

    /// Read the getter for `instance`, recomputing only if stale.
    pub fn get(&self, instance: &Rc<O>) -> T
    where
        T: Clone,
    {
        self.formula_for(instance)
            .current()
            .expect("instance is alive while borrowed")
    }

    /// The tag of `instance`'s formula, for subscribing.
    pub fn tag_for(&self, instance: &Rc<O>) -> Tag {
        self.formula_for(instance).tag()
    }

    /// Number of live instances with a cached formula.
    pub fn cached(&self) -> usize {
        let mut table = self.table.borrow_mut();
        table.retain(|_, entry| entry.instance.strong_count() > 0);
        table.len()
    }

    fn formula_for(&self, instance: &Rc<O>) -> Formula<Option<T>> {
        let key = Rc::as_ptr(instance) as *const () as usize;
        let mut table = self.table.borrow_mut();

        if let Some(entry) = table.get(&key) {
            let same = entry
                .instance
                .upgrade()
                .is_some_and(|live| Rc::ptr_eq(&live, instance));
            if same {
                return entry.formula.clone();
            }
        }

        table.retain(|_, entry| entry.instance.strong_count() > 0);
        let weak = Rc::downgrade(instance);
        let getter = Rc::clone(&self.getter);
        let formula = {
            let weak = weak.clone();
            Formula::with_description(&self.runtime, self.description.clone(), move || {
                weak.upgrade().map(|live| getter(&live))
            })
        };
        table.insert(
            key,
            Entry {
                instance: weak,
                formula: formula.clone(),
            },
        );
        formula
    }
}

impl<O: 'static, T: 'static> fmt::Debug for Memoized<O, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("description", &self.description)
            .field("entries", &self.table.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
