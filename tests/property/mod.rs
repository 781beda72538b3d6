// tests/property/mod.rs

//! Property-based tests for the replication engine.
//!
//! These verify invariants that must hold for arbitrary inputs: slot
//! determinism, record-number and synced-position monotonicity, the log cap,
//! conflict-resolution symmetry, and persistence/wire round-trips.

pub mod conflict_test;
pub mod log_test;
pub mod slot_test;
pub mod wire_test;
