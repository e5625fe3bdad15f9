//! Source-level security invariants for the payment channel workspace.
//!
//! This crate has no runtime code. Its tests in `tests/` scan the other
//! crates' production sources and fail the build when a settlement or
//! signature-handling invariant regresses.
