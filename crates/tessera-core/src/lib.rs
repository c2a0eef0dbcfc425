//! Tessera Core - sparse multi-fragment read engine.
//!
//! This crate merges the immutable fragments of a sparse array into one
//! ordered, deduplicated stream of result cells, within a memory budget and
//! resumable across submits when the output buffers are too small.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod aggregate;
pub mod buffer;
pub mod condition;
pub mod config;
pub mod error;
pub mod fragment;
pub mod order;
pub mod query;
pub mod reader;
pub mod schema;
pub mod stats;
pub mod subarray;
pub mod tile;

pub use aggregate::{Aggregate, AggregateFunction, AggregateValue, Aggregator};
pub use buffer::QueryBuffer;
pub use condition::{Condition, DeleteCondition, QueryCondition, Value};
pub use config::{OffsetsMode, ReaderConfig};
pub use error::{Error, Result};
pub use fragment::{FragmentMetadata, MemFragment, MemFragmentBuilder, MemTileSource};
pub use order::{GlobalOrder, Hilbert};
pub use query::{CancelHandle, QueryLayout, QueryStatus, SparseQuery};
pub use reader::{FragIdx, MemoryUsage, ReaderPhase};
pub use schema::{ArraySchema, Attribute, Datatype, Dimension, Layout};
pub use stats::{ReaderStats, SharedReaderStats};
pub use subarray::{CoordRange, Subarray};
pub use tile::{TileSource, TileTuple};
