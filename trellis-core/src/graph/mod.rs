//! Ownership Graph
//!
//! This module implements the lifetime graph that decides when cleanup code
//! runs.
//!
//! # Overview
//!
//! The graph is a directed graph of scopes where:
//!
//! - Nodes are scopes holding cleanup functions ("finalizers")
//! - Edges are ownership: if A owns B, finalizing A finalizes B
//!
//! Ownership is not a tree. A scope may have several owners, and it is
//! finalized exactly once, by whichever owner is finalized first.
//!
//! # Design Decisions
//!
//! 1. Scopes live in an arena of slots addressed by generational
//!    [`LifetimeId`] handles. The arena never holds the objects a scope
//!    cleans up after, only the finalizers registered for them.
//!
//! 2. The arena is indexed by slot for O(1) lookups, and freed slots are
//!    reused under a new generation.
//!
//! 3. We keep both forward (children) and reverse (owners) edges so a
//!    finalized scope can be removed from every owner in one pass.

mod lifetime;
mod node;

pub use lifetime::{CleanupHandle, Lifetime, Unlink};
pub use node::{Generation, HasLifetime, LifetimeId};

pub(crate) use lifetime::LifetimeGraph;
