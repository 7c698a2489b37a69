//! Cell Implementation
//!
//! A Cell is the mutable leaf of the reactive graph. It holds a value and a
//! cell tag.
//!
//! # How Cells Work
//!
//! 1. Reading a cell inside a tracking frame records its tag as a
//!    dependency of the running computation.
//!
//! 2. Writing a cell stores the value immediately, bumps the clock, stamps
//!    the tag and enqueues a notification. Subscribers hear about it at the
//!    next flush; formulas notice on their next read.
//!
//! 3. A frozen cell can never be written again, and stops being recorded
//!    as a dependency.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::runtime::Runtime;
use super::tag::{Tag, TagId, Tagged};
use crate::error::FrozenWriteError;

struct CellInner<T> {
    runtime: Runtime,
    tag: Tag,
    value: RefCell<T>,
}

/// A mutable, tracked value.
///
/// Cloning a `Cell` creates a new handle to the **same** value.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{Cell, Runtime};
///
/// let rt = Runtime::new();
/// let count = Cell::new(&rt, 0);
///
/// count.set(5).unwrap();
/// count.update(|n| n + 1).unwrap();
/// assert_eq!(count.current(), 6);
///
/// count.freeze();
/// assert!(count.set(7).is_err());
/// ```
pub struct Cell<T: 'static> {
    inner: Rc<CellInner<T>>,
}

impl<T: 'static> Cell<T> {
    /// Create a cell with the given initial value.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self::with_description(runtime, value, "cell")
    }

    /// Create a cell with a description used in errors and logs.
    pub fn with_description(runtime: &Runtime, value: T, description: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(CellInner {
                runtime: runtime.clone(),
                tag: Tag::cell(description, runtime.now()),
                value: RefCell::new(value),
            }),
        }
    }

    /// The cell tag's ID.
    pub fn id(&self) -> TagId {
        self.inner.tag.id()
    }

    /// Get the current value and record the read.
    pub fn current(&self) -> T
    where
        T: Clone,
    {
        self.inner.runtime.consume(&self.inner.tag);
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value and record the read.
    ///
    /// # Panics
    ///
    /// Writing this cell from inside `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.runtime.consume(&self.inner.tag);
        f(&self.inner.value.borrow())
    }

    /// Get the current value without recording the read.
    pub fn untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Store a new value.
    ///
    /// The value is visible to reads immediately. Subscribers are notified
    /// at the next flush.
    pub fn set(&self, value: T) -> Result<(), FrozenWriteError> {
        if self.inner.tag.is_frozen() {
            return Err(FrozenWriteError::new(self.inner.tag.description()));
        }

        let previous = self.inner.value.replace(value);
        self.inner.runtime.record_write(&[&self.inner.tag]);
        drop(previous);
        Ok(())
    }

    /// Store a value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<(), FrozenWriteError> {
        if self.inner.tag.is_frozen() {
            return Err(FrozenWriteError::new(self.inner.tag.description()));
        }

        let next = f(&self.inner.value.borrow());
        self.set(next)
    }

    /// Make the cell permanently read-only. Idempotent.
    pub fn freeze(&self) {
        self.inner.tag.freeze();
    }

    /// Whether the cell has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.inner.tag.is_frozen()
    }
}

impl<T: 'static> Tagged for Cell<T> {
    fn tag(&self) -> Tag {
        self.inner.tag.clone()
    }
}

impl<T: 'static> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug + 'static> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.tag.id())
            .field("description", &self.inner.tag.description())
            .field("value", &*self.inner.value.borrow())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
