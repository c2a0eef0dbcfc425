//! Fragment metadata.
//!
//! Fragments are immutable, time-stamped units of written data. The read
//! core only queries their metadata; tile contents come from a
//! [`crate::tile::TileSource`].

mod memory;

pub use memory::{MemFragment, MemFragmentBuilder, MemTileSource};

use std::fmt;

use crate::error::Result;
use crate::subarray::CoordRange;

/// Read-only metadata of one fragment.
///
/// Tile offsets are loaded and freed explicitly so the reader can keep
/// their memory inside its budget; [`FragmentMetadata::tile_size`] is only
/// valid while they are loaded.
pub trait FragmentMetadata: Send + Sync + fmt::Debug {
    /// Fragment name, used in log messages.
    fn name(&self) -> &str;

    /// Format version the fragment was written with.
    fn format_version(&self) -> u32;

    /// Inclusive timestamp range of the writes in the fragment.
    fn timestamp_range(&self) -> (u64, u64);

    /// Whether every cell carries its own timestamp.
    fn has_timestamps(&self) -> bool;

    /// Number of tiles.
    fn tile_num(&self) -> u64;

    /// Number of cells in `tile`.
    fn cell_num(&self, tile: u64) -> u64;

    /// Bounding box of `tile`, one range per dimension.
    fn mbr(&self, tile: u64) -> &[CoordRange];

    /// Bounding box of the whole fragment.
    fn non_empty_domain(&self) -> &[CoordRange];

    /// Markers of delete conditions already applied to this fragment.
    fn delete_condition_markers(&self) -> &[String];

    /// Bytes needed to hold the tile offsets of `fields`.
    fn tile_offsets_size(&self, fields: &[String]) -> u64;

    /// Load the tile offsets of `fields`.
    fn load_tile_offsets(&self, fields: &[String]) -> Result<()>;

    /// Release all loaded tile offsets.
    fn free_tile_offsets(&self);

    /// Whether tile offsets are loaded.
    fn tile_offsets_loaded(&self) -> bool;

    /// In-memory size of `field` in `tile`, including var data and
    /// validity. Zero for fields the fragment does not store.
    fn tile_size(&self, field: &str, tile: u64) -> Result<u64>;

    /// Timestamp assigned to cells without their own.
    fn fragment_timestamp(&self) -> u64 {
        self.timestamp_range().0
    }
}
