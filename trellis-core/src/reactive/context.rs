//! Autotracking Context
//!
//! The tracking stack records which tags are read while a computation runs.
//!
//! # Implementation
//!
//! Each runtime owns a stack of frames. Starting a computation pushes an
//! empty frame; every tracked read adds its tag to the innermost frame;
//! finishing the computation pops the frame and freezes what it collected
//! into a [`DependencySet`].
//!
//! Frames nest (a formula that reads another formula). A read is recorded
//! only in the innermost frame: the inner formula records the cell, and the
//! outer formula records the inner formula's tag. Tags that can never change
//! (static tags, frozen cells, formulas over nothing but those) are not
//! recorded at all.
//!
//! Reads outside any frame are not tracked. Frames opened with
//! [`Runtime::untracked`](super::Runtime::untracked) swallow reads.

use std::rc::Rc;

use indexmap::IndexMap;
use tracing::warn;

use super::runtime::RuntimeInner;
use super::tag::{DependencySet, Tag, TagId};

/// One entry in the tracking stack. A frame pushed at depth `d` lives at
/// index `d`.
#[derive(Debug)]
struct Frame {
    /// Description of the computation, for diagnostics.
    description: String,
    /// False for untracked frames.
    recording: bool,
    /// Tags consumed so far, in first-read order.
    consumed: IndexMap<TagId, Tag>,
}

/// The per-runtime stack of active tracking frames.
#[derive(Debug, Default)]
pub(crate) struct TrackingStack {
    frames: Vec<Frame>,
}

impl TrackingStack {
    fn push(&mut self, description: String, recording: bool) -> usize {
        let depth = self.frames.len();
        self.frames.push(Frame {
            description,
            recording,
            consumed: IndexMap::new(),
        });
        depth
    }

    /// Pop the frame pushed at `depth`.
    ///
    /// Frames still open above it were leaked by an out-of-order drop and are
    /// discarded with it. Returns `None` if the frame is already gone.
    fn pop(&mut self, depth: usize) -> Option<Frame> {
        if self.frames.len() <= depth {
            return None;
        }
        for leaked in self.frames.drain(depth + 1..) {
            warn!(
                frame = %leaked.description,
                depth,
                "tracking frame closed out of order"
            );
        }
        self.frames.pop()
    }

    /// Record a read in the innermost frame.
    pub(crate) fn consume(&mut self, tag: &Tag) {
        if let Some(frame) = self.frames.last_mut() {
            if frame.recording {
                frame
                    .consumed
                    .entry(tag.id())
                    .or_insert_with(|| tag.clone());
            }
        }
    }

    /// Whether reads are currently being recorded.
    pub(crate) fn is_recording(&self) -> bool {
        self.frames.last().is_some_and(|frame| frame.recording)
    }

    /// Number of active frames.
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Guard for an active tracking frame.
///
/// Call [`done`](TrackingFrame::done) to pop the frame and obtain the
/// dependencies it collected. Dropping the guard without calling `done`
/// (for example when the computation panics) pops and discards the frame,
/// so the stack stays balanced.
pub struct TrackingFrame {
    runtime: Rc<RuntimeInner>,
    depth: usize,
    finished: bool,
}

impl TrackingFrame {
    pub(crate) fn enter(runtime: Rc<RuntimeInner>, description: String, recording: bool) -> Self {
        let depth = runtime.tracking.borrow_mut().push(description, recording);
        Self {
            runtime,
            depth,
            finished: false,
        }
    }

    /// Pop the frame and return the tags read while it was active.
    pub fn done(mut self) -> DependencySet {
        self.finished = true;
        let frame = self.runtime.tracking.borrow_mut().pop(self.depth);
        match frame {
            Some(frame) => DependencySet::from_unique(frame.consumed.into_values().collect()),
            None => DependencySet::empty(),
        }
    }
}

impl Drop for TrackingFrame {
    fn drop(&mut self) {
        if !self.finished {
            self.runtime.tracking.borrow_mut().pop(self.depth);
        }
    }
}
