//! Bolero harness for wheel operation sequences.
//!
//! Properties checked (see `wheel_model::verify_invariants`):
//! - live slices never leave the arena and never overlap
//! - the packed head/last pair is the sentinel exactly when nothing is live
//! - peek yields the oldest committed slice with its exact bytes
//! - a fitting allocation on an empty wheel never fails

use bolero::check;
use carousel_fuzz::wheel_model::{execute_and_verify, WheelOp, MAX_UNITS, MIN_UNITS};

fn decode_ops(raw: &[(u8, u16)]) -> Vec<WheelOp> {
    raw.iter()
        .map(|&(kind, size)| match kind % 4 {
            // Bias toward allocation so sequences actually fill the arena.
            0 | 1 => WheelOp::Alloc(size % 2048),
            2 => WheelOp::Commit,
            _ => WheelOp::Drain,
        })
        .collect()
}

fn main() {
    check!()
        .with_type::<(u8, Vec<(u8, u16)>)>()
        .for_each(|(units_byte, raw_ops)| {
            let units = MIN_UNITS + (*units_byte as u32) % (MAX_UNITS - MIN_UNITS + 1);
            let ops = decode_ops(raw_ops);
            // Run and verify - panics are caught by bolero
            if let Err(e) = execute_and_verify(units, &ops) {
                panic!("invariant violated: {e}");
            }
        });
}

// Deterministic companion unit tests live in `wheel_unit.rs`: this file's
// `[[test]] harness = false` makes it a bolero fuzz entry point, so a
// `#[cfg(test)] mod tests` here would never run under `cargo test`.
