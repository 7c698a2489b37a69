//! Logical Clock
//!
//! Every write in a runtime advances a single monotonic counter. Cells stamp
//! their tag with the value produced by their write, and formulas remember
//! the value observed when they were last validated. Staleness is then a
//! plain comparison of two timestamps.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A point on the runtime's logical clock.
///
/// Timestamps start at [`Timestamp::INITIAL`] and are totally ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The value of a freshly created clock.
    pub const INITIAL: Timestamp = Timestamp(1);

    /// Get the raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Monotonic logical clock owned by a runtime.
#[derive(Debug)]
pub struct Clock {
    now: Cell<Timestamp>,
}

impl Clock {
    /// Create a clock at [`Timestamp::INITIAL`].
    pub fn new() -> Self {
        Self {
            now: Cell::new(Timestamp::INITIAL),
        }
    }

    /// The current timestamp. Does not advance the clock.
    pub fn now(&self) -> Timestamp {
        self.now.get()
    }

    /// Advance the clock and return the new timestamp.
    pub fn bump(&self) -> Timestamp {
        let next = self.now.get().next();
        self.now.set(next);
        next
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_starts_at_initial() {
        let clock = Clock::new();
        assert_eq!(clock.now(), Timestamp::INITIAL);
        assert_eq!(clock.now().get(), 1);
    }

    #[test]
    fn bump_strictly_increases() {
        let clock = Clock::new();
        let mut previous = clock.now();
        for _ in 0..10 {
            let next = clock.bump();
            assert!(next > previous);
            assert_eq!(clock.now(), next);
            previous = next;
        }
    }

    #[test]
    fn now_does_not_advance() {
        let clock = Clock::new();
        clock.bump();
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, b);
    }
}
