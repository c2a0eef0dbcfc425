//! Per-cell selection bitmaps.
//!
//! A bitmap holds one weight per cell. With `u8` weights selection is
//! exclusive (0 or 1); with `u64` weights a cell covered by several
//! overlapping subarray ranges is selected once per covering range. An
//! empty bitmap means every cell is selected exactly once.

use std::fmt;
use std::ops::{Deref, DerefMut};

use super::result_tile::{CellView, ResultTile};
use crate::order::CellCoords;

/// Weight type of a bitmap.
pub trait BitmapWeight: Copy + Default + Eq + Send + Sync + fmt::Debug + 'static {
    /// Whether weights are capped at one.
    const EXCLUSIVE: bool;

    /// Weight for a selection count.
    fn from_count(count: u64) -> Self;

    /// Selection count of the weight.
    fn count(self) -> u64;
}

impl BitmapWeight for u8 {
    const EXCLUSIVE: bool = true;

    fn from_count(count: u64) -> Self {
        u8::from(count > 0)
    }

    fn count(self) -> u64 {
        u64::from(self)
    }
}

impl BitmapWeight for u64 {
    const EXCLUSIVE: bool = false;

    fn from_count(count: u64) -> Self {
        count
    }

    fn count(self) -> u64 {
        self
    }
}

/// A resident tile with its selection bitmap.
#[derive(Debug, Clone)]
pub struct ResultTileWithBitmap<W> {
    tile: ResultTile,
    bitmap: Vec<W>,
    result_num: u64,
    memory: u64,
}

impl<W: BitmapWeight> ResultTileWithBitmap<W> {
    /// Wrap a tile with every cell selected once.
    pub fn new(tile: ResultTile) -> Self {
        let result_num = tile.cell_num();
        Self {
            tile,
            bitmap: Vec::new(),
            result_num,
            memory: 0,
        }
    }

    /// The underlying tile.
    pub fn tile(&self) -> &ResultTile {
        &self.tile
    }

    /// Whether a bitmap was allocated.
    pub fn has_bitmap(&self) -> bool {
        !self.bitmap.is_empty()
    }

    /// Allocate the bitmap with every cell selected once.
    pub fn alloc_bitmap(&mut self) {
        if self.bitmap.is_empty() {
            self.bitmap = vec![W::from_count(1); self.tile.cell_num() as usize];
        }
    }

    /// The bitmap; empty when every cell is selected.
    pub fn bitmap(&self) -> &[W] {
        &self.bitmap
    }

    /// Total selection count.
    pub fn result_num(&self) -> u64 {
        self.result_num
    }

    /// Selection count of cell `pos`.
    pub fn weight(&self, pos: u64) -> u64 {
        if self.bitmap.is_empty() {
            1
        } else {
            self.bitmap[pos as usize].count()
        }
    }

    /// Overwrite the bitmap from a per-cell count function and recount.
    pub fn compute_bitmap(&mut self, count: impl Fn(u64) -> u64) {
        self.alloc_bitmap();
        for (pos, w) in self.bitmap.iter_mut().enumerate() {
            *w = W::from_count(count(pos as u64));
        }
        self.count_cells();
    }

    /// Zero out cell `pos`.
    pub fn clear_cell(&mut self, pos: u64) {
        self.alloc_bitmap();
        let w = &mut self.bitmap[pos as usize];
        self.result_num -= w.count();
        *w = W::default();
    }

    /// Recompute `result_num` from the bitmap.
    pub fn count_cells(&mut self) {
        self.result_num = if self.bitmap.is_empty() {
            self.tile.cell_num()
        } else {
            self.bitmap.iter().map(|w| w.count()).sum()
        };
    }

    /// Selection count of cells in `[start, end)`.
    pub fn result_num_between_pos(&self, start: u64, end: u64) -> u64 {
        if self.bitmap.is_empty() {
            return end - start;
        }
        self.bitmap[start as usize..end as usize]
            .iter()
            .map(|w| w.count())
            .sum()
    }

    /// First position `p >= start` such that cells `[start, p]` add up to
    /// at least `n` results. The last cell when the tile holds fewer.
    pub fn pos_with_given_result_sum(&self, start: u64, n: u64) -> u64 {
        let last = self.tile.cell_num().saturating_sub(1);
        if self.bitmap.is_empty() {
            return (start + n).saturating_sub(1).min(last);
        }
        let mut sum = 0;
        for pos in start..self.tile.cell_num() {
            sum += self.bitmap[pos as usize].count();
            if sum >= n {
                return pos;
            }
        }
        last
    }

    /// Longest run `[start, end)` inside `[start, limit)` whose results fit
    /// `max_results`, never splitting a cell's weight. Returns the end and
    /// the results it holds.
    pub fn cells_within(&self, start: u64, limit: u64, max_results: u64) -> (u64, u64) {
        if self.bitmap.is_empty() {
            let len = (limit - start).min(max_results);
            return (start + len, len);
        }
        let mut sum = 0;
        for pos in start..limit {
            let w = self.bitmap[pos as usize].count();
            if sum + w > max_results {
                return (pos, sum);
            }
            sum += w;
        }
        (limit, sum)
    }

    /// Whether the whole tile can be copied in one block.
    pub fn copy_full_tile(&self) -> bool {
        if self.bitmap.is_empty() {
            return true;
        }
        W::EXCLUSIVE && self.result_num == self.tile.cell_num()
    }

    /// Next selected cell at or after `from`.
    pub fn next_selected(&self, from: u64) -> Option<u64> {
        let end = self.tile.cell_num();
        if self.bitmap.is_empty() {
            return (from < end).then_some(from);
        }
        (from..end).find(|&pos| self.bitmap[pos as usize].count() > 0)
    }

    /// First selected cell.
    pub fn first_cell_in_bitmap(&self) -> Option<u64> {
        self.next_selected(0)
    }

    /// Last selected cell.
    pub fn last_cell_in_bitmap(&self) -> Option<u64> {
        let end = self.tile.cell_num();
        if self.bitmap.is_empty() {
            return end.checked_sub(1);
        }
        (0..end).rev().find(|&pos| self.bitmap[pos as usize].count() > 0)
    }

    /// Bytes charged to the memory ledger for this tile.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub(crate) fn set_memory(&mut self, bytes: u64) {
        self.memory = bytes;
    }
}

impl<W> Deref for ResultTileWithBitmap<W> {
    type Target = ResultTile;

    fn deref(&self) -> &ResultTile {
        &self.tile
    }
}

/// A resident tile in the global-order reader.
///
/// Adds Hilbert values, the delete bookkeeping used by consolidation and a
/// flag telling whether the merge consumed any of its cells.
#[derive(Debug, Clone)]
pub struct GlobalOrderResultTile<W> {
    inner: ResultTileWithBitmap<W>,
    hilbert_values: Vec<u64>,
    post_dedup_bitmap: Option<Vec<u8>>,
    delete_timestamps: Option<Vec<u64>>,
    delete_condition_idx: Option<Vec<u64>>,
    used: bool,
}

impl<W: BitmapWeight> GlobalOrderResultTile<W> {
    pub fn new(tile: ResultTile) -> Self {
        Self {
            inner: ResultTileWithBitmap::new(tile),
            hilbert_values: Vec::new(),
            post_dedup_bitmap: None,
            delete_timestamps: None,
            delete_condition_idx: None,
            used: false,
        }
    }

    /// Hilbert value of cell `pos`, zero when not computed.
    pub fn hilbert(&self, pos: u64) -> u64 {
        self.hilbert_values.get(pos as usize).copied().unwrap_or(0)
    }

    pub fn set_hilbert_values(&mut self, values: Vec<u64>) {
        self.hilbert_values = values;
    }

    /// Cell `pos` as a comparable view.
    pub fn cell(&self, pos: u64) -> CellView<'_> {
        CellView {
            tile: self.inner.tile(),
            pos,
            hilbert: self.hilbert(pos),
        }
    }

    /// Mark cell `pos` deleted without unselecting it.
    pub fn mark_deleted(&mut self, pos: u64) {
        let cell_num = self.cell_num() as usize;
        self.post_dedup_bitmap.get_or_insert_with(|| vec![1; cell_num])[pos as usize] = 0;
    }

    /// Whether cell `pos` survives delete processing.
    pub fn post_dedup_selected(&self, pos: u64) -> bool {
        self.post_dedup_bitmap
            .as_ref()
            .map_or(true, |b| b[pos as usize] != 0)
    }

    /// Record the delete covering cell `pos`.
    pub fn set_delete_meta(&mut self, pos: u64, timestamp: u64, condition_idx: u64) {
        let cell_num = self.cell_num() as usize;
        self.delete_timestamps
            .get_or_insert_with(|| vec![crate::schema::NOT_DELETED; cell_num])[pos as usize] =
            timestamp;
        self.delete_condition_idx
            .get_or_insert_with(|| vec![crate::schema::NOT_DELETED; cell_num])[pos as usize] =
            condition_idx;
    }

    /// Timestamp of the delete covering cell `pos`.
    pub fn delete_timestamp(&self, pos: u64) -> u64 {
        self.delete_timestamps
            .as_ref()
            .map_or(crate::schema::NOT_DELETED, |v| v[pos as usize])
    }

    /// Index of the delete condition covering cell `pos`.
    pub fn delete_condition_index(&self, pos: u64) -> u64 {
        self.delete_condition_idx
            .as_ref()
            .map_or(crate::schema::NOT_DELETED, |v| v[pos as usize])
    }

    pub fn used(&self) -> bool {
        self.used
    }

    pub fn set_used(&mut self) {
        self.used = true;
    }
}

impl<W> Deref for GlobalOrderResultTile<W> {
    type Target = ResultTileWithBitmap<W>;

    fn deref(&self) -> &ResultTileWithBitmap<W> {
        &self.inner
    }
}

impl<W> DerefMut for GlobalOrderResultTile<W> {
    fn deref_mut(&mut self) -> &mut ResultTileWithBitmap<W> {
        &mut self.inner
    }
}

/// Resident tile wrapper the copy engine reads from.
pub trait SlabTile: Sync {
    /// The underlying tile.
    fn result_tile(&self) -> &ResultTile;

    /// Selection count of cell `pos`.
    fn weight(&self, pos: u64) -> u64;

    /// Whether every cell has weight one.
    fn copy_full_tile(&self) -> bool;

    /// Results in `[start, end)`.
    fn result_num_between_pos(&self, start: u64, end: u64) -> u64;

    /// See [`ResultTileWithBitmap::cells_within`].
    fn cells_within(&self, start: u64, limit: u64, max_results: u64) -> (u64, u64);

    /// Delete timestamp of cell `pos`, if tracked.
    fn delete_timestamp(&self, _pos: u64) -> u64 {
        crate::schema::NOT_DELETED
    }

    /// Delete condition index of cell `pos`, if tracked.
    fn delete_condition_index(&self, _pos: u64) -> u64 {
        crate::schema::NOT_DELETED
    }
}

impl<W: BitmapWeight> SlabTile for ResultTileWithBitmap<W> {
    fn result_tile(&self) -> &ResultTile {
        self.tile()
    }

    fn weight(&self, pos: u64) -> u64 {
        ResultTileWithBitmap::weight(self, pos)
    }

    fn copy_full_tile(&self) -> bool {
        ResultTileWithBitmap::copy_full_tile(self)
    }

    fn result_num_between_pos(&self, start: u64, end: u64) -> u64 {
        ResultTileWithBitmap::result_num_between_pos(self, start, end)
    }

    fn cells_within(&self, start: u64, limit: u64, max_results: u64) -> (u64, u64) {
        ResultTileWithBitmap::cells_within(self, start, limit, max_results)
    }
}

impl<W: BitmapWeight> SlabTile for GlobalOrderResultTile<W> {
    fn result_tile(&self) -> &ResultTile {
        self.inner.tile()
    }

    fn weight(&self, pos: u64) -> u64 {
        self.inner.weight(pos)
    }

    fn copy_full_tile(&self) -> bool {
        self.inner.copy_full_tile()
    }

    fn result_num_between_pos(&self, start: u64, end: u64) -> u64 {
        self.inner.result_num_between_pos(start, end)
    }

    fn cells_within(&self, start: u64, limit: u64, max_results: u64) -> (u64, u64) {
        self.inner.cells_within(start, limit, max_results)
    }

    fn delete_timestamp(&self, pos: u64) -> u64 {
        GlobalOrderResultTile::delete_timestamp(self, pos)
    }

    fn delete_condition_index(&self, pos: u64) -> u64 {
        GlobalOrderResultTile::delete_condition_index(self, pos)
    }
}

impl<W: BitmapWeight> CellCoords for (&GlobalOrderResultTile<W>, u64) {
    fn coord(&self, dim: usize) -> &[u8] {
        self.0.coord(self.1, dim)
    }

    fn hilbert(&self) -> u64 {
        self.0.hilbert(self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::result_tile::CoordStorage;
    use crate::schema::{encode_values, ArraySchema, Datatype, Dimension, Layout};
    use crate::tile::TileTuple;

    fn tile(cells: &[i32]) -> ResultTile {
        let schema = ArraySchema::new(Layout::RowMajor)
            .with_dimension(Dimension::new("x", Datatype::Int32, [0.0, 100.0]));
        let coords = CoordStorage::unzipped(&schema, vec![TileTuple::fixed(encode_values(cells))]);
        ResultTile::new(0, 0, cells.len() as u64, 1, coords)
    }

    #[test]
    fn test_no_bitmap_means_all_selected() {
        let t = ResultTileWithBitmap::<u8>::new(tile(&[1, 2, 3, 4]));
        assert!(!t.has_bitmap());
        assert_eq!(t.result_num(), 4);
        assert_eq!(t.result_num_between_pos(1, 3), 2);
        assert_eq!(t.pos_with_given_result_sum(1, 2), 2);
        assert!(t.copy_full_tile());
        assert_eq!(t.last_cell_in_bitmap(), Some(3));
    }

    #[test]
    fn test_clear_cell() {
        let mut t = ResultTileWithBitmap::<u8>::new(tile(&[1, 2, 3, 4]));
        t.alloc_bitmap();
        assert!(t.copy_full_tile());
        t.clear_cell(1);
        assert_eq!(t.result_num(), 3);
        assert_eq!(t.bitmap(), &[1, 0, 1, 1]);
        assert!(!t.copy_full_tile());
        assert_eq!(t.next_selected(1), Some(2));
        assert_eq!(t.pos_with_given_result_sum(0, 2), 2);
    }

    #[test]
    fn test_counted_bitmap() {
        let mut t = ResultTileWithBitmap::<u64>::new(tile(&[1, 2, 3, 4]));
        t.compute_bitmap(|pos| [2, 0, 1, 3][pos as usize]);
        assert_eq!(t.result_num(), 6);
        assert!(!t.copy_full_tile());
        assert_eq!(t.result_num_between_pos(0, 3), 3);
        // Cells [0, 2] reach 3 results.
        assert_eq!(t.pos_with_given_result_sum(0, 3), 2);
        // 4 results cannot take the weight-3 cell at position 3.
        assert_eq!(t.cells_within(0, 4, 4), (3, 3));
        assert_eq!(t.cells_within(0, 4, 1), (0, 0));
        assert_eq!(t.first_cell_in_bitmap(), Some(0));
        assert_eq!(t.last_cell_in_bitmap(), Some(3));
    }

    #[test]
    fn test_exclusive_bitmap_caps_weights() {
        let mut t = ResultTileWithBitmap::<u8>::new(tile(&[1, 2]));
        t.compute_bitmap(|_| 5);
        assert_eq!(t.bitmap(), &[1, 1]);
        assert_eq!(t.result_num(), 2);
        assert!(t.copy_full_tile());
    }

    #[test]
    fn test_global_tile_delete_meta() {
        let mut t = GlobalOrderResultTile::<u8>::new(tile(&[1, 2, 3]));
        assert!(t.post_dedup_selected(1));
        t.mark_deleted(1);
        assert!(!t.post_dedup_selected(1));
        assert!(t.post_dedup_selected(0));

        assert_eq!(t.delete_timestamp(2), crate::schema::NOT_DELETED);
        t.set_delete_meta(2, 50, 0);
        assert_eq!(t.delete_timestamp(2), 50);
        assert_eq!(t.delete_condition_index(2), 0);

        t.clear_cell(0);
        assert_eq!(t.result_num(), 2);
        assert_eq!((&t, 2u64).coord(0), &3i32.to_le_bytes());
    }
}
