//! Formula Implementation
//!
//! A Formula is a memoized derived value. It re-runs its body only when one
//! of the tags it read last time has changed since then.
//!
//! # How Formulas Work
//!
//! 1. On first read, the body runs inside a fresh tracking frame. The value,
//!    the frame's dependency set and the clock's current time are recorded.
//!
//! 2. On later reads, the formula compares the newest `last_updated` among
//!    its dependencies with the time it was validated. If nothing is newer,
//!    the cached value is returned and the body does not run.
//!
//! 3. Otherwise the body runs again and the dependency set is **replaced**,
//!    not merged, so a branch that stopped reading a cell stops depending
//!    on it.
//!
//! Every read also records the formula's own tag in the enclosing frame, so
//! formulas compose. Staleness is decided purely by timestamps: a re-run
//! that produces an equal value still counts as a re-run.
//!
//! # Failure
//!
//! A body created with [`Formula::try_new`] may return an error. The error
//! is handed to the reader and nothing is cached: the previous value and
//! dependencies stay in place and the next read retries.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::rc::Rc;

use tracing::trace;

use super::clock::Timestamp;
use super::runtime::Runtime;
use super::tag::{Tag, TagId, Tagged};
use crate::error::EvaluationError;

/// Observable state of a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaState {
    /// The body has never completed successfully.
    Uninitialized,

    /// The cached value is up-to-date.
    Fresh,

    /// A dependency changed after the cached value was computed.
    Stale,
}

enum Slot<T> {
    Uninitialized,
    Valid { value: T, validated_at: Timestamp },
}

impl<T> Slot<T> {
    fn value(&self) -> Option<&T> {
        match self {
            Slot::Valid { value, .. } => Some(value),
            Slot::Uninitialized => None,
        }
    }
}

struct FormulaInner<T, E> {
    runtime: Runtime,
    tag: Tag,
    compute: Box<dyn Fn() -> Result<T, E>>,
    slot: RefCell<Slot<T>>,
    evaluating: Cell<bool>,
    evaluations: Cell<u64>,
}

/// Clears the re-entrancy flag even if the body panics.
struct EvaluatingGuard<'a>(&'a Cell<bool>);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A memoized value derived from other tracked values.
///
/// Cloning a `Formula` creates a new handle to the **same** cache.
///
/// # Type Parameters
///
/// - `T`: the computed value.
/// - `E`: the body's error type; [`Infallible`] for formulas built with
///   [`Formula::new`].
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{Cell, Formula, Runtime};
///
/// let rt = Runtime::new();
/// let a = Cell::new(&rt, 2);
/// let doubled = {
///     let a = a.clone();
///     Formula::new(&rt, move || a.current() * 2)
/// };
///
/// assert_eq!(doubled.current(), 4);
/// assert_eq!(doubled.current(), 4);
/// assert_eq!(doubled.evaluations(), 1);
/// ```
pub struct Formula<T: 'static, E: 'static = Infallible> {
    inner: Rc<FormulaInner<T, E>>,
}

impl<T: 'static, E: 'static> Formula<T, E> {
    /// Create a formula whose body can fail.
    ///
    /// The body is not run until the formula is first read.
    pub fn try_new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> Result<T, E> + 'static,
    {
        Self::try_with_description(runtime, "formula", compute)
    }

    /// Create a fallible formula with a description used in errors and logs.
    pub fn try_with_description<F>(
        runtime: &Runtime,
        description: impl Into<String>,
        compute: F,
    ) -> Self
    where
        F: Fn() -> Result<T, E> + 'static,
    {
        Self {
            inner: Rc::new(FormulaInner {
                runtime: runtime.clone(),
                tag: Tag::formula(description),
                compute: Box::new(compute),
                slot: RefCell::new(Slot::Uninitialized),
                evaluating: Cell::new(false),
                evaluations: Cell::new(0),
            }),
        }
    }

    /// The formula tag's ID.
    pub fn id(&self) -> TagId {
        self.inner.tag.id()
    }

    /// Get the current value, re-running the body if it is stale, and
    /// record the read.
    ///
    /// # Panics
    ///
    /// Panics if the body reads this formula (a dependency cycle).
    pub fn try_current(&self) -> Result<T, EvaluationError<E>>
    where
        T: Clone,
    {
        self.try_with(T::clone)
    }

    /// Like [`try_current`](Formula::try_current), borrowing the value for
    /// `f` instead of cloning it.
    ///
    /// # Panics
    ///
    /// Panics if `f` causes this formula to re-evaluate.
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, EvaluationError<E>> {
        self.validate()?;
        self.inner.runtime.consume(&self.inner.tag);
        let slot = self.inner.slot.borrow();
        let value = slot.value().expect("validated formula holds a value");
        Ok(f(value))
    }

    /// The last computed value, without validating or tracking.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.slot.borrow().value().cloned()
    }

    /// Current state, without re-running anything.
    pub fn state(&self) -> FormulaState {
        match &*self.inner.slot.borrow() {
            Slot::Uninitialized => FormulaState::Uninitialized,
            Slot::Valid { validated_at, .. } => {
                if self.inner.tag.last_updated() > *validated_at {
                    FormulaState::Stale
                } else {
                    FormulaState::Fresh
                }
            }
        }
    }

    /// Whether the next read will run the body.
    pub fn is_stale(&self) -> bool {
        self.state() != FormulaState::Fresh
    }

    /// How many times the body has run, including failed runs.
    pub fn evaluations(&self) -> u64 {
        self.inner.evaluations.get()
    }

    fn validate(&self) -> Result<(), EvaluationError<E>> {
        if !self.is_stale() {
            return Ok(());
        }

        let inner = &*self.inner;
        assert!(
            !inner.evaluating.get(),
            "dependency cycle: formula `{}` read itself while evaluating",
            inner.tag.description()
        );
        inner.evaluating.set(true);
        let _guard = EvaluatingGuard(&inner.evaluating);

        let started = inner.runtime.now();
        let frame = inner.runtime.start(inner.tag.description());
        let result = (inner.compute)();
        let dependencies = frame.done();
        inner.evaluations.set(inner.evaluations.get() + 1);

        match result {
            Ok(value) => {
                trace!(
                    formula = %inner.tag.id(),
                    dependencies = dependencies.len(),
                    at = %started,
                    "formula evaluated"
                );
                inner.tag.set_dependencies(dependencies);
                let previous = inner.slot.replace(Slot::Valid {
                    value,
                    validated_at: started,
                });
                inner.runtime.resync(&inner.tag);
                drop(previous);
                Ok(())
            }
            Err(source) => Err(EvaluationError::new(inner.tag.description(), source)),
        }
    }
}

impl<T: 'static> Formula<T, Infallible> {
    /// Create a formula. The body is not run until the formula is first read.
    pub fn new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self::with_description(runtime, "formula", compute)
    }

    /// Create a formula with a description used in logs.
    pub fn with_description<F>(runtime: &Runtime, description: impl Into<String>, compute: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self::try_with_description(runtime, description, move || Ok(compute()))
    }

    /// Get the current value, re-running the body if it is stale, and
    /// record the read.
    pub fn current(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Borrow the current value for `f`.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match self.try_with(f) {
            Ok(result) => result,
            Err(err) => match err.into_inner() {},
        }
    }
}

impl<T: 'static, E: 'static> Tagged for Formula<T, E> {
    fn tag(&self) -> Tag {
        self.inner.tag.clone()
    }
}

impl<T: 'static, E: 'static> Clone for Formula<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug + 'static, E: 'static> Debug for Formula<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("id", &self.inner.tag.id())
            .field("description", &self.inner.tag.description())
            .field("state", &self.state())
            .field("value", &self.inner.slot.borrow().value())
            .field("evaluations", &self.evaluations())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
