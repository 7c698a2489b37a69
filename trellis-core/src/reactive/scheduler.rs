//! Notification Scheduler
//!
//! Cell writes do not call subscribers synchronously. They enqueue the
//! written tag, and the queue is delivered in one batch at the next tick
//! boundary.
//!
//! # Algorithm
//!
//! 1. The first write of a batch finds the queue empty, enqueues its tag and
//!    signals the flush driver. Further writes in the same turn join the
//!    batch (the queue is a set, so repeated writes to one cell collapse).
//! 2. `flush` drains the queue. Writes performed by callbacks from now on
//!    start the next batch.
//! 3. Subscriptions reachable from the batch are fired one at a time, each
//!    at most once. The next subscription is looked up after every
//!    callback, so a subscription removed by an earlier callback is
//!    skipped, and one registered by an earlier callback joins this flush
//!    only if its tags are already in the batch.
//! 4. A callback that fails (returns an error or panics) is recorded; the
//!    remaining callbacks still run. Failures are reported when the batch
//!    is done.
//!
//! # Tick boundaries
//!
//! Hosts with their own loop call [`Runtime::flush`] once per frame. Async
//! hosts spawn [`Runtime::drive`] on a `tokio::task::LocalSet`; it flushes
//! once per batch, the next time the executor gets control after the batch
//! started.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use indexmap::IndexSet;
use tracing::{debug, error, warn};

use super::runtime::Runtime;
use super::subscriber::{Ready, SubscriptionId};
use super::tag::TagId;
use crate::error::{CallbackFailure, ReactiveError, Result};

/// Set of tags written since the last flush.
#[derive(Debug, Default)]
pub(crate) struct NotificationQueue {
    pending: IndexSet<TagId>,
}

impl NotificationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a tag. Returns true when this starts a new batch.
    pub(crate) fn enqueue(&mut self, tag: TagId) -> bool {
        let first = self.pending.is_empty();
        self.pending.insert(tag);
        first
    }

    pub(crate) fn drain(&mut self) -> IndexSet<TagId> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Summary of one delivered batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct tags in the batch.
    pub tags: usize,
    /// Callbacks invoked.
    pub fired: usize,
}

impl Runtime {
    /// Deliver the pending batch.
    ///
    /// Returns [`ReactiveError::Callbacks`] if any callback failed; all
    /// other callbacks in the batch have still been invoked.
    pub fn flush(&self) -> Result<FlushReport> {
        let batch = self.inner.queue.borrow_mut().drain();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        debug!(runtime = %self.inner.config.name, tags = batch.len(), "flushing notification batch");

        let mut fired: IndexSet<SubscriptionId> = IndexSet::new();
        let mut failures = Vec::new();

        loop {
            let next = self.inner.subscriptions.borrow().next_ready(&batch, &fired);
            let Some(ready) = next else {
                break;
            };
            fired.insert(ready.id);
            if let Err(failure) = self.invoke(&ready) {
                warn!(
                    runtime = %self.inner.config.name,
                    subscription = %failure.subscription,
                    message = %failure.message,
                    "subscriber callback failed"
                );
                failures.push(failure);
            }
        }

        let report = FlushReport {
            tags: batch.len(),
            fired: fired.len(),
        };
        debug!(runtime = %self.inner.config.name, fired = report.fired, failed = failures.len(), "flush complete");

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ReactiveError::Callbacks {
                fired: report.fired,
                failures,
            })
        }
    }

    fn invoke(&self, ready: &Ready) -> std::result::Result<(), CallbackFailure> {
        let callback = &ready.callback;
        let outcome = if self.inner.config.isolate_panics {
            panic::catch_unwind(AssertUnwindSafe(|| callback()))
        } else {
            Ok(callback())
        };

        let message = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        Err(CallbackFailure {
            subscription: ready.id,
            description: ready.description.clone(),
            message,
        })
    }

    /// Flush repeatedly until no notifications are pending.
    ///
    /// Returns the number of passes performed. Callback failures from all
    /// passes are collected into one [`ReactiveError::Callbacks`]. Fails
    /// with [`ReactiveError::SettleLimit`] if the queue is still refilling
    /// after [`RuntimeConfig::settle_limit`](crate::RuntimeConfig) passes.
    pub fn settle(&self) -> Result<usize> {
        let limit = self.inner.config.settle_limit;
        let mut passes = 0;
        let mut fired = 0;
        let mut failures = Vec::new();

        while !self.inner.queue.borrow().is_empty() {
            if passes == limit {
                warn!(runtime = %self.inner.config.name, passes, "notification queue did not settle");
                return Err(ReactiveError::SettleLimit { passes });
            }
            passes += 1;
            match self.flush() {
                Ok(report) => fired += report.fired,
                Err(ReactiveError::Callbacks {
                    fired: count,
                    failures: batch,
                }) => {
                    fired += count;
                    failures.extend(batch);
                }
                Err(other) => return Err(other),
            }
        }

        if failures.is_empty() {
            Ok(passes)
        } else {
            Err(ReactiveError::Callbacks { fired, failures })
        }
    }

    /// Yield to the executor once, then flush.
    pub async fn tick(&self) -> Result<FlushReport> {
        tokio::task::yield_now().await;
        self.flush()
    }

    /// Flush every batch as it starts, forever.
    ///
    /// The runtime is `!Send`, so spawn this with
    /// `tokio::task::spawn_local` inside a `LocalSet`. Callback failures are
    /// logged.
    pub async fn drive(self) {
        loop {
            self.inner.flush_signal.notified().await;
            if let Err(err) = self.flush() {
                error!(runtime = %self.inner.config.name, error = %err, "notification flush failed");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell as Counter;
    use std::rc::Rc;

    use super::*;
    use crate::reactive::{Cell, Detach, Formula};

    fn counter() -> Rc<Counter<u32>> {
        Rc::new(Counter::new(0))
    }

    #[test]
    fn queue_reports_first_of_batch() {
        let mut queue = NotificationQueue::new();
        let a = crate::reactive::Tag::new_static("a").id();
        let b = crate::reactive::Tag::new_static("b").id();

        assert!(queue.enqueue(a));
        assert!(!queue.enqueue(b));
        assert!(!queue.enqueue(a));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.enqueue(a));
    }

    #[test]
    fn writes_are_delivered_only_on_flush() {
        let rt = Runtime::new();
        let cell = Cell::new(&rt, 0);
        let fired = counter();
        let seen = fired.clone();
        let _sub = rt.subscribe(&cell, move || seen.set(seen.get() + 1));

        cell.set(1).unwrap();
        assert_eq!(fired.get(), 0);

        let report = rt.flush().unwrap();
        assert_eq!(report, FlushReport { tags: 1, fired: 1 });
        assert_eq!(fired.get(), 1);

        // Nothing pending: no second delivery.
        assert_eq!(rt.flush().unwrap(), FlushReport::default());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn several_writes_fire_once() {
        let rt = Runtime::new();
        let a = Cell::new(&rt, 1);
        let b = Cell::new(&rt, 2);
        let sum = {
            let (a, b) = (a.clone(), b.clone());
            Formula::new(&rt, move || a.current() + b.current())
        };
        assert_eq!(sum.current(), 3);

        let fired = counter();
        let seen = fired.clone();
        let _sub = rt.subscribe(&sum, move || seen.set(seen.get() + 1));

        a.set(10).unwrap();
        b.set(20).unwrap();
        a.set(11).unwrap();
        rt.flush().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn reading_does_not_notify() {
        let rt = Runtime::new();
        let cell = Cell::new(&rt, 5);
        let fired = counter();
        let seen = fired.clone();
        let _sub = rt.subscribe(&cell, move || seen.set(seen.get() + 1));

        assert_eq!(cell.current(), 5);
        rt.flush().unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn failing_callback_does_not_block_others() {
        let rt = Runtime::new();
        let cell = Cell::with_description(&rt, 0, "count");
        let fired = counter();

        let first = fired.clone();
        let _a = rt.subscribe(&cell, move || first.set(first.get() + 1));
        let _b = rt.try_subscribe(&cell, || Err("refused".into()));
        let _c = rt.subscribe(&cell, || panic!("exploded"));
        let last = fired.clone();
        let _d = rt.subscribe(&cell, move || last.set(last.get() + 1));

        cell.set(1).unwrap();
        let err = rt.flush().unwrap_err();
        match err {
            ReactiveError::Callbacks { fired: count, failures } => {
                assert_eq!(count, 4);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].message, "refused");
                assert_eq!(failures[0].description, "count");
                assert!(failures[1].message.contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn unsubscribed_during_flush_is_skipped() {
        let rt = Runtime::new();
        let cell = Cell::new(&rt, 0);
        let fired = counter();

        let victim_fired = fired.clone();
        let victim = Rc::new(rt.subscribe(&cell, move || victim_fired.set(victim_fired.get() + 1)));
        // The killer watches a tag that is earlier in the batch, so it runs first.
        let early = Cell::new(&rt, 0);
        let target = Rc::clone(&victim);
        let _killer = rt.subscribe(&early, move || target.detach());

        early.set(1).unwrap();
        cell.set(1).unwrap();
        rt.flush().unwrap();
        assert_eq!(fired.get(), 0);
        assert!(victim.is_detached());
    }

    #[test]
    fn writes_during_flush_join_next_batch() {
        let rt = Runtime::new();
        let source = Cell::new(&rt, 0);
        let echo = Cell::new(&rt, 0);
        let echo_fired = counter();

        let writer = {
            let (input, echo) = (source.clone(), echo.clone());
            rt.subscribe(&source, move || echo.set(input.untracked()).unwrap())
        };
        let seen = echo_fired.clone();
        let _reader = rt.subscribe(&echo, move || seen.set(seen.get() + 1));

        source.set(7).unwrap();
        rt.flush().unwrap();
        assert_eq!(echo_fired.get(), 0);
        assert_eq!(rt.stats().pending_notifications, 1);

        rt.flush().unwrap();
        assert_eq!(echo_fired.get(), 1);
        assert_eq!(echo.untracked(), 7);
        writer.unsubscribe();
    }

    #[test]
    fn subscription_added_during_flush_joins_if_tag_queued() {
        let rt = Runtime::new();
        let queued = Cell::new(&rt, 0);
        let idle = Cell::new(&rt, 0);
        let late_queued = counter();
        let late_idle = counter();

        let holder: Rc<std::cell::RefCell<Vec<crate::reactive::Unsubscribe>>> = Rc::default();
        let _registrar = {
            let (rt2, watched, idle) = (rt.clone(), queued.clone(), idle.clone());
            let (late_queued, late_idle, holder) =
                (late_queued.clone(), late_idle.clone(), holder.clone());
            rt.subscribe(&queued, move || {
                if !holder.borrow().is_empty() {
                    return;
                }
                let a = late_queued.clone();
                let b = late_idle.clone();
                holder.borrow_mut().push(rt2.subscribe(&watched, move || a.set(a.get() + 1)));
                holder.borrow_mut().push(rt2.subscribe(&idle, move || b.set(b.get() + 1)));
            })
        };

        queued.set(1).unwrap();
        rt.flush().unwrap();
        assert_eq!(late_queued.get(), 1);
        assert_eq!(late_idle.get(), 0);
    }

    #[test]
    fn settle_drains_cascading_writes() {
        let rt = Runtime::new();
        let a = Cell::new(&rt, 0);
        let b = Cell::new(&rt, 0);
        let b_fired = counter();

        let _forward = {
            let (input, b) = (a.clone(), b.clone());
            rt.subscribe(&a, move || b.set(input.untracked() * 2).unwrap())
        };
        let seen = b_fired.clone();
        let _observe = rt.subscribe(&b, move || seen.set(seen.get() + 1));

        a.set(4).unwrap();
        assert_eq!(rt.settle().unwrap(), 2);
        assert_eq!(b.untracked(), 8);
        assert_eq!(b_fired.get(), 1);
    }

    #[test]
    fn settle_gives_up_on_feedback_loops() {
        let rt = Runtime::with_config(crate::RuntimeConfig::default().with_settle_limit(5));
        let cell = Cell::new(&rt, 0);
        let _loop = {
            let cell = cell.clone();
            rt.subscribe(&cell.clone(), move || cell.update(|v| v + 1).unwrap())
        };

        cell.set(1).unwrap();
        let err = rt.settle().unwrap_err();
        assert!(matches!(err, ReactiveError::SettleLimit { passes: 5 }));
    }

    #[test]
    fn panic_message_handles_payload_kinds() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
