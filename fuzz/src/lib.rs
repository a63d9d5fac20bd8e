//! Property-based harnesses for the carousel wheel.
//!
//! The wheel itself is exercised directly (no reimplemented model of the
//! allocator): [`wheel_model`] drives a real wheel over a heap region with
//! arbitrary operation sequences and checks the structural invariants after
//! every step.

pub mod wheel_model;
