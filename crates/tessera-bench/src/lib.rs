//! Tessera Benchmark Suite
//!
//! Criterion benchmarks for the sparse read engines.
//!
//! # Benchmark Categories
//!
//! - **Global order**: multi-fragment merge with deduplication, buffer and
//!   budget sweeps
//! - **Unordered**: streaming reads over arrays with duplicates

pub mod fixtures;
pub mod harness;

pub use fixtures::{generate_fragment, Scale};
pub use harness::{read_all, BenchContext};
