//! Reactive Primitives
//!
//! This module implements the core reactive system: tags, cells, formulas,
//! subscriptions and resources. These primitives form the foundation of
//! Trellis's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Tags
//!
//! Every reactive value exposes a [`Tag`]. The runtime reasons only about
//! tags: which tags a computation read, and when each tag last changed
//! according to the logical [`Clock`].
//!
//! ## Cells
//!
//! A [`Cell`] is a container for mutable state. Reading it inside a tracking
//! frame records its tag. Writing it bumps the clock.
//!
//! ## Formulas
//!
//! A [`Formula`] is a derived value that caches its result. It re-evaluates
//! only when one of the tags it read has a newer timestamp than its cache.
//! Nothing is pushed to formulas; they check on read.
//!
//! ## Subscriptions
//!
//! [`Runtime::subscribe`] registers a callback that is told, in batches,
//! when something reachable from a tag was written. Callbacks are a signal
//! to re-read, not a value stream.
//!
//! ## Resources
//!
//! A [`Resource`] is a formula with setup and cleanup bound to the
//! ownership graph in [`crate::graph`].
//!
//! # Implementation Notes
//!
//! Dependencies are detected automatically: a per-runtime stack of tracking
//! frames collects every tag read while a formula body runs, and the
//! formula replaces its dependency set with what was collected.
//!
//! Everything is single-threaded and built on `Rc`/`RefCell`.

mod cell;
pub(crate) mod clock;
mod collections;
mod context;
mod formula;
mod memo;
mod resource;
pub(crate) mod runtime;
mod scheduler;
mod subscriber;
pub(crate) mod tag;

pub use cell::Cell;
pub use clock::{Clock, Timestamp};
pub use collections::TrackedMap;
pub use context::TrackingFrame;
pub use formula::{Formula, FormulaState};
pub use memo::Memoized;
pub use resource::{Resource, ResourceRun};
pub use runtime::{Runtime, RuntimeStats};
pub use scheduler::FlushReport;
pub use subscriber::{Detach, SubscriptionId, Unsubscribe};
pub use tag::{Dependencies, DependencySet, Tag, TagId, TagKind, Tagged};
