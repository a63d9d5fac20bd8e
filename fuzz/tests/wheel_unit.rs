//! Deterministic companion tests to the bolero harness in `wheel.rs`.
//!
//! `wheel.rs` is registered with `harness = false` so it can define its own
//! `fn main` as a bolero fuzz entry point; that means a `#[test]` fn placed
//! there never runs under `cargo test`. This file uses the default libtest
//! harness so these deterministic cases actually execute.

use carousel_fuzz::wheel_model::{execute_and_verify, WheelOp, MIN_UNITS};

#[test]
fn tiny_arena_churn() {
    // Deterministic companion to the generated runs: the smallest arena,
    // where every second slice wraps.
    let mut ops = Vec::new();
    for _ in 0..50 {
        ops.push(WheelOp::Alloc(20));
        ops.push(WheelOp::Commit);
        ops.push(WheelOp::Drain);
    }
    execute_and_verify(MIN_UNITS, &ops).unwrap();
}

#[test]
fn staggered_fill_and_drain() {
    let mut ops = Vec::new();
    for i in 0..100u16 {
        ops.push(WheelOp::Alloc(30 + (i % 5) * 64));
        ops.push(WheelOp::Commit);
        if i % 3 == 0 {
            ops.push(WheelOp::Drain);
        }
    }
    for _ in 0..100 {
        ops.push(WheelOp::Drain);
    }
    execute_and_verify(16, &ops).unwrap();
}
