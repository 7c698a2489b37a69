//! Resource Implementation
//!
//! A Resource is a formula whose body acquires something that must be
//! released: a timer, a connection, a listener. Each run of the body gets
//! its own lifetime scope for registering cleanup.
//!
//! # How Resources Work
//!
//! 1. The resource allocates a scope linked under the caller's owner scope.
//!
//! 2. Every run of `setup` allocates a run scope linked under the resource
//!    scope and hands it to `setup` through a [`ResourceRun`].
//!
//! 3. When a value read by `setup` changes, the next read re-runs `setup`.
//!    The previous run scope is finalized first, so its cleanup always
//!    happens before the new setup starts.
//!
//! 4. Finalizing the owner finalizes the resource scope and with it the
//!    current run. From then on the resource returns its last value and
//!    never runs `setup` again.

use std::cell::Cell;
use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::rc::Rc;

use tracing::trace;

use super::formula::Formula;
use super::runtime::Runtime;
use super::tag::{Tag, Tagged};
use crate::error::EvaluationError;
use crate::graph::{CleanupHandle, HasLifetime, Lifetime, LifetimeId, Unlink};

/// Handle passed to a resource's setup function for one run.
pub struct ResourceRun {
    lifetime: Lifetime,
    runtime: Runtime,
    scope: LifetimeId,
    number: u64,
}

impl ResourceRun {
    /// Register cleanup for this run. It runs before the next run's setup,
    /// or when the resource's owner is finalized.
    pub fn on_cleanup<F>(&self, finalizer: F) -> CleanupHandle
    where
        F: FnOnce() + 'static,
    {
        self.lifetime.on_cleanup(self.scope, finalizer)
    }

    /// Tie another scope to this run.
    pub fn link(&self, child: impl HasLifetime) -> Unlink {
        self.lifetime.link(self.scope, child)
    }

    /// This run's scope.
    pub fn scope(&self) -> LifetimeId {
        self.scope
    }

    /// The runtime the resource belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// 1 for the first run, 2 for the second, and so on.
    pub fn number(&self) -> u64 {
        self.number
    }
}

impl Debug for ResourceRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRun")
            .field("scope", &self.scope)
            .field("number", &self.number)
            .finish()
    }
}

struct ResourceState {
    scope: LifetimeId,
    current_run: Cell<Option<LifetimeId>>,
    runs: Cell<u64>,
}

/// A reactive value with setup and cleanup bound to a lifetime.
///
/// Cloning a `Resource` creates a new handle to the **same** resource.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell as Counter;
/// use std::rc::Rc;
///
/// use trellis_core::reactive::{Cell, Resource, Runtime};
///
/// let rt = Runtime::new();
/// let owner = rt.lifetime().scope();
/// let port = Cell::new(&rt, 8080);
/// let open = Rc::new(Counter::new(0));
///
/// let listener = {
///     let (port, open) = (port.clone(), open.clone());
///     Resource::new(&rt, owner, move |run| {
///         open.set(open.get() + 1);
///         let closing = open.clone();
///         run.on_cleanup(move || closing.set(closing.get() - 1));
///         format!("listening on {}", port.current())
///     })
/// };
///
/// assert_eq!(listener.current(), "listening on 8080");
/// port.set(9090).unwrap();
/// assert_eq!(listener.current(), "listening on 9090");
/// assert_eq!(open.get(), 1);
///
/// rt.lifetime().finalize(owner);
/// assert_eq!(open.get(), 0);
/// ```
pub struct Resource<T: 'static, E: 'static = Infallible> {
    lifetime: Lifetime,
    state: Rc<ResourceState>,
    formula: Formula<T, E>,
}

impl<T: 'static, E: 'static> Resource<T, E> {
    /// Create a resource whose setup can fail.
    ///
    /// A failed setup finalizes the scope of that run before the error is
    /// returned. Nothing runs until the resource is first read.
    pub fn try_new<F>(runtime: &Runtime, owner: impl HasLifetime, setup: F) -> Self
    where
        F: Fn(&ResourceRun) -> Result<T, E> + 'static,
    {
        let lifetime = runtime.lifetime();
        let scope = lifetime.child_of(owner);
        let state = Rc::new(ResourceState {
            scope,
            current_run: Cell::new(None),
            runs: Cell::new(0),
        });

        let body = {
            let (runtime, lifetime, state) = (runtime.clone(), lifetime.clone(), state.clone());
            move || {
                if let Some(previous) = state.current_run.take() {
                    runtime.untracked(|| lifetime.finalize(previous));
                }

                let number = state.runs.get() + 1;
                state.runs.set(number);
                let run = ResourceRun {
                    lifetime: lifetime.clone(),
                    runtime: runtime.clone(),
                    scope: lifetime.child_of(state.scope),
                    number,
                };
                state.current_run.set(Some(run.scope));
                trace!(resource = %state.scope, run = number, "resource setup");

                let result = setup(&run);
                if result.is_err() {
                    state.current_run.set(None);
                    runtime.untracked(|| lifetime.finalize(run.scope));
                }
                result
            }
        };

        Self {
            formula: Formula::try_with_description(runtime, "resource", body),
            lifetime,
            state,
        }
    }

    /// Get the current value, re-running setup if a value it read changed,
    /// and record the read.
    ///
    /// Once the owner is finalized this returns the last value without
    /// running setup.
    pub fn try_current(&self) -> Result<T, EvaluationError<E>>
    where
        T: Clone,
    {
        if self.is_finalized() {
            if let Some(value) = self.formula.peek() {
                return Ok(value);
            }
        }
        self.formula.try_current()
    }

    /// The last produced value, without running setup or tracking.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.formula.peek()
    }

    /// How many times setup has run.
    pub fn runs(&self) -> u64 {
        self.state.runs.get()
    }

    /// Scope of the current run, if one is active.
    pub fn current_run(&self) -> Option<LifetimeId> {
        self.state
            .current_run
            .get()
            .filter(|run| !self.lifetime.is_finalized(*run))
    }

    /// Whether the resource's scope has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.lifetime.is_finalized(self.state.scope)
    }

    /// Whether the next read would re-run setup.
    pub fn is_stale(&self) -> bool {
        !self.is_finalized() && self.formula.is_stale()
    }
}

impl<T: 'static> Resource<T, Infallible> {
    /// Create a resource. Nothing runs until the resource is first read.
    pub fn new<F>(runtime: &Runtime, owner: impl HasLifetime, setup: F) -> Self
    where
        F: Fn(&ResourceRun) -> T + 'static,
    {
        Self::try_new(runtime, owner, move |run| Ok(setup(run)))
    }

    /// Get the current value. See [`try_current`](Resource::try_current).
    pub fn current(&self) -> T
    where
        T: Clone,
    {
        match self.try_current() {
            Ok(value) => value,
            Err(err) => match err.into_inner() {},
        }
    }
}

impl<T: 'static, E: 'static> HasLifetime for Resource<T, E> {
    fn lifetime_id(&self) -> LifetimeId {
        self.state.scope
    }
}

impl<T: 'static, E: 'static> Tagged for Resource<T, E> {
    fn tag(&self) -> Tag {
        self.formula.tag()
    }
}

impl<T: 'static, E: 'static> Clone for Resource<T, E> {
    fn clone(&self) -> Self {
        Self {
            lifetime: self.lifetime.clone(),
            state: Rc::clone(&self.state),
            formula: self.formula.clone(),
        }
    }
}

impl<T: Debug + 'static, E: 'static> Debug for Resource<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("scope", &self.state.scope)
            .field("runs", &self.runs())
            .field("finalized", &self.is_finalized())
            .field("formula", &self.formula)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::{Cell as Counter, RefCell};

    use super::*;
    use crate::reactive::Cell;

    #[test]
    fn setup_runs_lazily_once() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let resource = Resource::new(&rt, owner, |_| 5);

        assert_eq!(resource.runs(), 0);
        assert_eq!(resource.current(), 5);
        assert_eq!(resource.current(), 5);
        assert_eq!(resource.runs(), 1);
    }

    #[test]
    fn rerun_keeps_one_live_acquisition() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, 0);
        let live = Rc::new(Counter::new(0));

        let resource = {
            let (input, live) = (input.clone(), live.clone());
            Resource::new(&rt, owner, move |run| {
                live.set(live.get() + 1);
                let release = live.clone();
                run.on_cleanup(move || release.set(release.get() - 1));
                input.current()
            })
        };

        assert_eq!(resource.current(), 0);
        for n in 1..=3 {
            input.set(n).unwrap();
            assert!(resource.is_stale());
            assert_eq!(resource.current(), n);
            assert_eq!(live.get(), 1);
        }
        assert_eq!(resource.runs(), 4);

        rt.lifetime().finalize(owner);
        assert_eq!(live.get(), 0);
        assert!(resource.is_finalized());
        assert!(resource.current_run().is_none());
    }

    #[test]
    fn previous_cleanup_precedes_next_setup() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, 0);
        let events: Rc<RefCell<Vec<String>>> = Rc::default();

        let resource = {
            let (input, events) = (input.clone(), events.clone());
            Resource::new(&rt, owner, move |run| {
                let value = input.current();
                events.borrow_mut().push(format!("setup {}", run.number()));
                let events = events.clone();
                let number = run.number();
                run.on_cleanup(move || events.borrow_mut().push(format!("cleanup {number}")));
                value
            })
        };

        resource.current();
        input.set(1).unwrap();
        resource.current();
        assert_eq!(
            *events.borrow(),
            vec!["setup 1", "cleanup 1", "setup 2"]
        );
    }

    #[test]
    fn finalized_owner_freezes_the_value() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, 1);
        let resource = {
            let input = input.clone();
            Resource::new(&rt, owner, move |_| input.current() * 100)
        };

        assert_eq!(resource.current(), 100);
        rt.lifetime().finalize(owner);
        input.set(2).unwrap();

        assert!(!resource.is_stale());
        assert_eq!(resource.current(), 100);
        assert_eq!(resource.runs(), 1);
    }

    #[test]
    fn failed_setup_releases_its_scope() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, -1);
        let released = Rc::new(Counter::new(0));

        let resource = {
            let (input, released) = (input.clone(), released.clone());
            Resource::try_new(&rt, owner, move |run| {
                let released = released.clone();
                run.on_cleanup(move || released.set(released.get() + 1));
                let value = input.current();
                if value < 0 {
                    Err("negative")
                } else {
                    Ok(value)
                }
            })
        };

        let err = resource.try_current().unwrap_err();
        assert_eq!(*err.inner(), "negative");
        assert_eq!(released.get(), 1);
        assert!(resource.current_run().is_none());

        input.set(4).unwrap();
        assert_eq!(resource.try_current().unwrap(), 4);
        assert!(resource.current_run().is_some());
        assert_eq!(resource.runs(), 2);
    }

    #[test]
    fn resource_tracks_into_enclosing_formula() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, 2);
        let resource = {
            let input = input.clone();
            Resource::new(&rt, owner, move |_| input.current())
        };
        let squared = {
            let resource = resource.clone();
            Formula::new(&rt, move || resource.current() * resource.current())
        };

        assert_eq!(squared.current(), 4);
        input.set(3).unwrap();
        assert_eq!(squared.current(), 9);
        assert_eq!(resource.runs(), 2);
    }

    #[test]
    fn cleanup_reads_do_not_become_dependencies() {
        let rt = Runtime::new();
        let owner = rt.lifetime().scope();
        let input = Cell::new(&rt, 0);
        let audit = Cell::new(&rt, 0);

        let resource = {
            let (input, audit) = (input.clone(), audit.clone());
            Resource::new(&rt, owner, move |run| {
                let audit = audit.clone();
                run.on_cleanup(move || {
                    audit.current();
                });
                input.current()
            })
        };

        resource.current();
        input.set(1).unwrap();
        resource.current();

        let deps = resource.tag().dependencies();
        let set = deps.as_set().unwrap();
        assert!(set.contains(input.id()));
        assert!(!set.contains(audit.id()));
    }

    #[test]
    fn run_scope_can_own_other_scopes() {
        let rt = Runtime::new();
        let lifetime = rt.lifetime();
        let owner = lifetime.scope();
        let extra = lifetime.scope();
        let resource = Resource::new(&rt, owner, move |run| {
            run.link(extra);
            run.number()
        });

        assert_eq!(resource.current(), 1);
        lifetime.finalize(&resource);
        assert!(lifetime.is_finalized(extra));
    }
}
