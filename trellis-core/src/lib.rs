//! Trellis Core
//!
//! This crate provides the runtime for Trellis, a fine-grained reactive
//! dependency tracking engine. It implements:
//!
//! - Tags, a logical clock and autotracking
//! - Cells and lazily validated, memoized formulas
//! - Batched subscriptions for pushing "something changed" to hosts
//! - An ownership graph for deterministic cleanup, and resources built on it
//!
//! The crate is the substrate that UI and store integration layers build
//! on. It has no rendering or host bindings of its own.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives and dependency tracking
//! - `graph`: Lifetime (ownership) graph
//! - `error`: Error types
//! - `config`: Runtime configuration
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell as Counter;
//! use std::rc::Rc;
//!
//! use trellis_core::reactive::{Cell, Formula, Runtime};
//!
//! let rt = Runtime::new();
//!
//! // Create a cell
//! let count = Cell::new(&rt, 0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     Formula::new(&rt, move || count.current() * 2)
//! };
//!
//! assert_eq!(doubled.current(), 0);
//!
//! // Subscribe to changes
//! let notified = Rc::new(Counter::new(0));
//! let seen = notified.clone();
//! let _subscription = rt.subscribe(&doubled, move || seen.set(seen.get() + 1));
//!
//! // Update the cell; subscribers hear about it at the next flush
//! count.set(5).unwrap();
//! rt.flush().unwrap();
//! assert_eq!(notified.get(), 1);
//! assert_eq!(doubled.current(), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{
    BoxError, CallbackFailure, EvaluationError, FrozenWriteError, ReactiveError, Result,
};
pub use graph::{HasLifetime, Lifetime, LifetimeId};
pub use reactive::{Cell, Formula, Resource, Runtime, Tag, Tagged};
