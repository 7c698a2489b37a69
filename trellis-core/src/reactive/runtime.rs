//! Reactive Runtime
//!
//! The runtime is the context object every primitive is created against. It
//! owns all of the shared bookkeeping:
//!
//! - the logical [`Clock`],
//! - the autotracking stack,
//! - the subscription registry and the pending notification queue,
//! - the lifetime (ownership) graph.
//!
//! # How It Works
//!
//! 1. Reading a cell or formula calls [`Runtime::consume`], which records the
//!    tag in the innermost tracking frame.
//!
//! 2. Writing a cell bumps the clock, stamps the cell's tag and enqueues the
//!    tag for notification. Nothing is recomputed.
//!
//! 3. Reading a formula compares its dependencies' timestamps with the
//!    timestamp it was last validated at, and re-runs its body only when one
//!    of them is newer.
//!
//! 4. Pending notifications are delivered in batches by [`Runtime::flush`]
//!    (see the scheduler module).
//!
//! # Threading
//!
//! A runtime is single-threaded (`!Send`). Runtimes are isolated from each
//! other, so tests can create one each. Every public entry point can be
//! called re-entrantly from inside formula bodies, subscriber callbacks and
//! finalizers: no internal borrow is held while user code runs.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use super::clock::{Clock, Timestamp};
use super::context::{TrackingFrame, TrackingStack};
use super::scheduler::NotificationQueue;
use super::subscriber::{SubscriptionRegistry, Unsubscribe};
use super::tag::{Tag, TagKind, Tagged};
use crate::config::RuntimeConfig;
use crate::error::BoxError;
use crate::graph::{Lifetime, LifetimeGraph};

/// Shared state behind a [`Runtime`] handle.
pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) clock: Clock,
    pub(crate) tracking: RefCell<TrackingStack>,
    pub(crate) subscriptions: RefCell<SubscriptionRegistry>,
    pub(crate) queue: RefCell<NotificationQueue>,
    pub(crate) lifetimes: RefCell<LifetimeGraph>,
    /// Signalled by the first write of each batch; awaited by
    /// [`Runtime::drive`].
    pub(crate) flush_signal: Notify,
}

/// Handle to a reactive runtime.
///
/// Cloning a `Runtime` creates a new handle to the **same** runtime.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{Cell, Formula, Runtime};
///
/// let rt = Runtime::new();
/// let name = Cell::new(&rt, "Tom".to_string());
///
/// let greeting = {
///     let name = name.clone();
///     Formula::new(&rt, move || format!("Hi {}", name.current()))
/// };
///
/// assert_eq!(greeting.current(), "Hi Tom");
/// name.set("Thomas".to_string()).unwrap();
/// assert_eq!(greeting.current(), "Hi Thomas");
/// ```
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                clock: Clock::new(),
                tracking: RefCell::new(TrackingStack::default()),
                subscriptions: RefCell::new(SubscriptionRegistry::new()),
                queue: RefCell::new(NotificationQueue::new()),
                lifetimes: RefCell::new(LifetimeGraph::new()),
                flush_signal: Notify::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// The current logical time.
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Advance the logical clock and return the new timestamp.
    pub fn bump(&self) -> Timestamp {
        self.inner.clock.bump()
    }

    // ------------------------------------------------------------------
    // Autotracking
    // ------------------------------------------------------------------

    /// Push a new tracking frame.
    ///
    /// Reads performed until the returned frame's
    /// [`done`](TrackingFrame::done) is called are collected into its
    /// dependency set. Frames must complete synchronously.
    pub fn start(&self, description: impl Into<String>) -> TrackingFrame {
        TrackingFrame::enter(Rc::clone(&self.inner), description.into(), true)
    }

    /// Record a read of `tag` in the innermost active frame.
    ///
    /// A no-op outside any frame and for constant tags.
    pub fn consume(&self, tag: &Tag) {
        if !self.inner.tracking.borrow().is_recording() {
            return;
        }
        if tag.is_constant() {
            return;
        }
        self.inner.tracking.borrow_mut().consume(tag);
    }

    /// Run `f` without recording any of its reads in the enclosing frame.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let frame = TrackingFrame::enter(Rc::clone(&self.inner), "untracked".to_string(), false);
        let result = f();
        frame.done();
        result
    }

    /// Whether a recording frame is active.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracking.borrow().is_recording()
    }

    // ------------------------------------------------------------------
    // Writes and subscriptions
    // ------------------------------------------------------------------

    /// Record one logical write covering every tag in `tags`.
    ///
    /// Bumps the clock once, stamps each cell tag with the new timestamp and
    /// enqueues each for notification. Custom primitives built on
    /// [`Tag::cell`] call this from their mutators.
    pub fn record_write(&self, tags: &[&Tag]) -> Timestamp {
        let now = self.bump();
        for tag in tags {
            if tag.kind() == TagKind::Cell {
                tag.update(now);
                trace!(runtime = %self.inner.config.name, tag = %tag.id(), at = %now, "cell written");
                self.notify(tag);
            }
        }
        now
    }

    /// Enqueue `tag` for delivery at the next flush.
    pub(crate) fn notify(&self, tag: &Tag) {
        let first_of_batch = self.inner.queue.borrow_mut().enqueue(tag.id());
        if first_of_batch {
            self.inner.flush_signal.notify_one();
        }
    }

    /// Re-synchronize subscriptions that reach `tag` after its dependency
    /// set was replaced.
    pub(crate) fn resync(&self, tag: &Tag) {
        self.inner.subscriptions.borrow_mut().resync(tag.id());
    }

    /// Register `on_ready` to be called, at the next flush, after any cell
    /// reachable from `tagged` is written.
    ///
    /// Subscribing never evaluates anything. A subscription to a formula
    /// that has not been evaluated yet starts watching its cells as soon as
    /// the formula is first read. Subscribing to a constant tag is legal and
    /// never fires.
    pub fn subscribe<F>(&self, tagged: &impl Tagged, on_ready: F) -> Unsubscribe
    where
        F: Fn() + 'static,
    {
        self.try_subscribe(tagged, move || {
            on_ready();
            Ok(())
        })
    }

    /// Like [`subscribe`](Runtime::subscribe), with a callback that can fail.
    ///
    /// Failures are collected and reported by [`flush`](Runtime::flush).
    pub fn try_subscribe<F>(&self, tagged: &impl Tagged, on_ready: F) -> Unsubscribe
    where
        F: Fn() -> Result<(), BoxError> + 'static,
    {
        let tag = tagged.tag();
        let id = self
            .inner
            .subscriptions
            .borrow_mut()
            .insert(tag, Rc::new(on_ready));
        Unsubscribe::new(self.downgrade(), id)
    }

    // ------------------------------------------------------------------
    // Lifetimes
    // ------------------------------------------------------------------

    /// The ownership graph of this runtime.
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.clone())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot of the runtime's bookkeeping.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            name: self.inner.config.name.clone(),
            now: self.now(),
            subscriptions: self.inner.subscriptions.borrow().len(),
            pending_notifications: self.inner.queue.borrow().len(),
            live_lifetimes: self.inner.lifetimes.borrow().live_count(),
            tracking_depth: self.inner.tracking.borrow().depth(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .field("now", &self.now())
            .finish()
    }
}

/// Serializable snapshot returned by [`Runtime::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Configured runtime name.
    pub name: String,
    /// Current logical time.
    pub now: Timestamp,
    /// Active subscriptions.
    pub subscriptions: usize,
    /// Tags waiting for the next flush.
    pub pending_notifications: usize,
    /// Lifetime scopes that have not been finalized.
    pub live_lifetimes: usize,
    /// Active tracking frames.
    pub tracking_depth: usize,
}
