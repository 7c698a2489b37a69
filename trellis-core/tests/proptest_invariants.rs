//! Property-based invariant tests for the reactive runtime.
//!
//! These tests verify structural invariants that must hold for any sequence
//! of operations:
//!
//! 1. The clock strictly increases on every write and never decreases.
//! 2. A formula re-runs on read iff something it read last time was written
//!    since, and always returns the value a fresh computation would.
//! 3. Finalizing scopes in any order runs every finalizer at most once,
//!    and finalizing a scope finalizes everything linked below it.

use std::cell::Cell as Counter;
use std::rc::Rc;

use proptest::prelude::*;
use trellis_core::reactive::{Cell, Formula, Runtime};

// ── Helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Write { cell: usize, value: i32 },
    Read,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, -5i32..5).prop_map(|(cell, value)| Op::Write { cell, value }),
        Just(Op::Read),
    ]
}

/// Which cells the branching formula reads for a given selector value.
fn reads_for(selector: i32) -> [usize; 2] {
    if selector % 2 == 0 {
        [0, 1]
    } else {
        [0, 2]
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Clock monotonicity
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn clock_strictly_increases(writes in proptest::collection::vec((0usize..4, any::<i16>()), 1..64)) {
        let rt = Runtime::new();
        let cells: Vec<Cell<i16>> = (0..4).map(|_| Cell::new(&rt, 0)).collect();
        let mut last = rt.now();

        for (index, value) in writes {
            cells[index].set(value).unwrap();
            let now = rt.now();
            prop_assert!(now > last, "clock went from {} to {}", last, now);
            prop_assert_eq!(cells[index].untracked(), value);
            last = now;

            cells[index].current();
            prop_assert_eq!(rt.now(), last);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Glitch-free memoization over a branching formula
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn formula_reruns_exactly_when_a_read_dependency_changed(
        ops in proptest::collection::vec(op_strategy(), 1..80)
    ) {
        let rt = Runtime::new();
        let cells: Vec<Cell<i32>> = (0..3).map(|_| Cell::new(&rt, 0)).collect();
        let formula = {
            let cells = cells.clone();
            Formula::new(&rt, move || {
                let [a, b] = reads_for(cells[0].current());
                cells[a].current() + cells[b].current()
            })
        };

        let mut model = [0i32; 3];
        let mut model_deps: Option<[usize; 2]> = None;
        let mut dirty = [false; 3];
        let mut expected_runs = 0u64;

        for op in ops {
            match op {
                Op::Write { cell, value } => {
                    cells[cell].set(value).unwrap();
                    model[cell] = value;
                    dirty[cell] = true;
                }
                Op::Read => {
                    let must_run = match model_deps {
                        None => true,
                        Some(deps) => deps.iter().any(|d| dirty[*d]),
                    };
                    prop_assert_eq!(formula.is_stale(), must_run);
                    if must_run {
                        expected_runs += 1;
                        model_deps = Some(reads_for(model[0]));
                        dirty = [false; 3];
                    }

                    let [a, b] = reads_for(model[0]);
                    prop_assert_eq!(formula.current(), model[a] + model[b]);
                    prop_assert_eq!(formula.evaluations(), expected_runs);
                }
            }
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Idempotent finalization over arbitrary ownership graphs
// ═════════════════════════════════════════════════════════════════════════

fn graph_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<usize>)> {
    (2usize..24).prop_flat_map(|n| {
        (
            Just(n),
            proptest::collection::vec((0..n, 0..n), 0..n * 2),
            proptest::collection::vec(0..n, 1..n * 2),
        )
    })
}

fn reachable(from: usize, edges: &[(usize, usize)], n: usize) -> Vec<bool> {
    let mut seen = vec![false; n];
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        stack.extend(edges.iter().filter(|(p, _)| *p == node).map(|(_, c)| *c));
    }
    seen
}

proptest! {
    #[test]
    fn finalizers_run_at_most_once((n, edges, order) in graph_strategy()) {
        let rt = Runtime::new();
        let lifetime = rt.lifetime();
        let scopes: Vec<_> = (0..n).map(|_| lifetime.scope()).collect();
        let runs: Vec<Rc<Counter<u32>>> = (0..n).map(|_| Rc::new(Counter::new(0))).collect();

        for (scope, count) in scopes.iter().zip(&runs) {
            let count = count.clone();
            lifetime.on_cleanup(*scope, move || count.set(count.get() + 1));
        }
        for (parent, child) in &edges {
            lifetime.link(scopes[*parent], scopes[*child]);
        }

        for target in order {
            lifetime.finalize(scopes[target]);
            for (index, below) in reachable(target, &edges, n).into_iter().enumerate() {
                if below {
                    prop_assert!(lifetime.is_finalized(scopes[index]));
                    prop_assert_eq!(runs[index].get(), 1);
                }
            }
            for count in &runs {
                prop_assert!(count.get() <= 1);
            }
        }

        for scope in &scopes {
            lifetime.finalize(*scope);
        }
        for count in &runs {
            prop_assert_eq!(count.get(), 1);
        }
        prop_assert_eq!(rt.stats().live_lifetimes, 0);
    }
}
