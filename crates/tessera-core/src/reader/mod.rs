//! Sparse read engines.
//!
//! A read runs in rounds. Each round loads as many coordinate tiles as the
//! memory budget allows, selects result cells, and copies them into the
//! user buffers. Reads resume across submits from per-fragment cursors.

mod bitmap;
mod budget;
mod context;
mod copy;
mod global_order;
mod heap;
mod loader;
mod read_state;
mod result_tile;
mod unordered;

use serde::Serialize;

pub use bitmap::{BitmapWeight, GlobalOrderResultTile, ResultTileWithBitmap, SlabTile};
pub use budget::{MemoryLedger, MemoryUsage};
pub use context::ReadContext;
pub use copy::OutputField;
pub use read_state::{FragIdx, ReadState};
pub use result_tile::{CellView, CoordStorage, ResultTile};

pub(crate) use context::DeleteHandling;
pub(crate) use copy::Output;
pub(crate) use global_order::GlobalOrderReader;
pub(crate) use unordered::UnorderedReader;

use crate::error::Result;

/// Step a reader is in, reported for progress and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderPhase {
    Idle,
    AddingResultTiles,
    Merging,
    /// Building slabs straight from resident tiles.
    Streaming,
    Copying,
}

/// Result of one round.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RoundOutcome {
    /// Cells written this round.
    pub cells: u64,
    /// A user buffer ran out of room.
    pub buffers_full: bool,
}

/// A read engine producing result cells round by round.
pub(crate) trait ReadEngine: Send + std::fmt::Debug {
    /// Load, select and copy one batch of cells.
    fn run_round(&mut self, out: &mut Output<'_>) -> Result<RoundOutcome>;

    /// Whether every result was copied.
    fn done(&self) -> bool;

    fn phase(&self) -> ReaderPhase;

    fn read_state(&self) -> &ReadState;
}
