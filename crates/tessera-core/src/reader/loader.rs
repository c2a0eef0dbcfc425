//! Tile selection, loading and per-tile filtering.
//!
//! The loader owns the list of tiles each fragment still has to visit. The
//! global-order reader consumes them in the merged order of their bounding
//! box lower corners, the unordered reader fragment by fragment. Loading a
//! tile charges the memory ledger; a tile that cannot fit on its own is a
//! fatal budget error.

use std::ops::Range;

use rayon::prelude::*;
use tracing::{debug, trace, warn};

use super::context::ReadContext;
use super::heap::MinHeap;
use super::result_tile::{CellView, CoordStorage, ResultTile};
use crate::error::{Error, Result};
use crate::order::MbrLowerCorner;
use crate::schema::{COORDS, TIMESTAMPS};

/// Bytes a tile charges while resident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TileCost {
    /// Coordinates, timestamps and per-cell bookkeeping.
    pub coords: u64,
    /// Condition fields, released once conditions are applied.
    pub condition: u64,
}

/// A tile picked for loading, already charged to the ledger.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedTile {
    pub frag: usize,
    pub tile: u64,
    pub cost: TileCost,
}

/// Tiles picked for one global-order round.
#[derive(Debug, Default)]
pub(crate) struct GlobalPlan {
    pub tiles: Vec<PlannedTile>,
    /// Index into `needed` of the first fragment whose tile did not fit.
    pub blocked: Option<usize>,
}

/// Per-cell bookkeeping a loaded tile needs beyond its buffers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CellOverhead {
    /// Bitmap weight size.
    pub bitmap: u64,
    /// Hilbert value size, zero unless the order is Hilbert.
    pub hilbert: u64,
    /// Post-deduplication bitmap size, zero unless purging deletes.
    pub post_dedup: u64,
}

impl CellOverhead {
    fn per_cell(&self) -> u64 {
        self.bitmap + self.hilbert + self.post_dedup
    }
}

#[derive(Debug)]
pub(crate) struct TileLoader {
    /// Tiles intersecting the subarray, per fragment, in fragment order.
    tile_lists: Vec<Vec<u64>>,
    /// Position of the next tile to load in each list.
    next: Vec<usize>,
    /// All tiles as `(fragment, list position)` in merged lower-corner order.
    merged_order: Vec<(usize, usize)>,
    /// Index into `merged_order` of each list position.
    merged_rank: Vec<Vec<usize>>,
    merged_pos: usize,
    overhead: CellOverhead,
}

impl TileLoader {
    /// Compute the tile lists and charge them to the ledger.
    ///
    /// With `merge` set the lists are also merged into global order of
    /// their bounding boxes.
    pub fn new(ctx: &ReadContext, overhead: CellOverhead, merge: bool) -> Result<Self> {
        let _timer = ctx.stats.timer("compute_tile_lists");
        let tile_lists: Vec<Vec<u64>> = ctx
            .fragments
            .par_iter()
            .enumerate()
            .map(|(f, frag)| {
                if !ctx.included[f] {
                    return Vec::new();
                }
                (0..frag.tile_num())
                    .filter(|&t| {
                        ctx.subarray.is_default() || ctx.subarray.overlaps_mbr(&ctx.schema, frag.mbr(t))
                    })
                    .collect()
            })
            .collect();

        let entries: u64 = tile_lists.iter().map(|l| l.len() as u64).sum();
        ctx.ledger.reserve_tile_ranges(entries * 8)?;
        debug!(tiles = entries, "Computed tile lists");

        let merged_order = if merge {
            merge_tile_lists(ctx, &tile_lists)
        } else {
            Vec::new()
        };
        let mut merged_rank: Vec<Vec<usize>> = tile_lists.iter().map(|l| vec![0; l.len()]).collect();
        for (rank, &(f, pos)) in merged_order.iter().enumerate() {
            merged_rank[f][pos] = rank;
        }

        Ok(Self {
            next: vec![0; tile_lists.len()],
            tile_lists,
            merged_order,
            merged_rank,
            merged_pos: 0,
            overhead,
        })
    }

    /// Next tile of fragment `f` not loaded yet.
    pub fn next_tile(&self, f: usize) -> Option<u64> {
        self.tile_lists[f].get(self.next[f]).copied()
    }

    /// Whether every tile of fragment `f` was loaded.
    pub fn fragment_done(&self, f: usize) -> bool {
        self.next[f] >= self.tile_lists[f].len()
    }

    /// Whether every tile of every fragment was loaded.
    pub fn all_loaded(&self) -> bool {
        (0..self.tile_lists.len()).all(|f| self.fragment_done(f))
    }

    /// Position of tile `t` in the merged order, `usize::MAX` if unknown.
    pub fn merged_rank(&self, f: usize, t: u64) -> usize {
        self.tile_lists[f]
            .binary_search(&t)
            .ok()
            .and_then(|pos| self.merged_rank[f].get(pos).copied())
            .unwrap_or(usize::MAX)
    }

    /// Put tile `t` of fragment `f` and every later tile back on the list.
    ///
    /// The caller releases the memory the tile was charged.
    pub fn rewind(&mut self, f: usize, t: u64) {
        let Ok(pos) = self.tile_lists[f].binary_search(&t) else {
            return;
        };
        if pos >= self.next[f] {
            return;
        }
        self.next[f] = pos;
        if let Some(&rank) = self.merged_rank[f].get(pos) {
            self.merged_pos = self.merged_pos.min(rank);
        }
        trace!(fragment = f, tile = t, "Rewound tile list");
    }

    /// Memory a tile would take once loaded.
    pub fn tile_cost(&self, ctx: &ReadContext, f: usize, t: u64) -> Result<TileCost> {
        let frag = &ctx.fragments[f];
        let mut coords = frag.cell_num(t) * self.overhead.per_cell();
        for field in ctx.coord_fields(f) {
            coords += frag.tile_size(&field, t)?;
        }
        let mut condition = 0;
        for field in &ctx.condition_fields {
            condition += frag.tile_size(field, t)?;
        }
        Ok(TileCost { coords, condition })
    }

    /// Charge the next tile of `f` if it fits. Fails if it never can.
    fn try_take(&mut self, ctx: &ReadContext, f: usize) -> Result<Option<PlannedTile>> {
        let Some(t) = self.next_tile(f) else {
            return Ok(None);
        };
        let cost = self.tile_cost(ctx, f, t)?;
        ctx.ledger.check_tile_fits(cost.coords, cost.condition)?;
        if !ctx.ledger.try_reserve_tile(cost.coords, cost.condition) {
            ctx.stats.record_budget_stop();
            return Ok(None);
        }
        self.next[f] += 1;
        Ok(Some(PlannedTile { frag: f, tile: t, cost }))
    }

    /// Pick tiles for the global-order merge.
    ///
    /// Fragments in `needed` get their next tile first; then tiles follow
    /// the merged bounding-box order until the budget is full. Planning
    /// stops at the first needed tile that does not fit.
    pub fn plan_global(&mut self, ctx: &ReadContext, needed: &[usize]) -> Result<GlobalPlan> {
        let mut plan = GlobalPlan::default();
        for (i, &f) in needed.iter().enumerate() {
            match self.try_take(ctx, f)? {
                Some(tile) => plan.tiles.push(tile),
                None if !self.fragment_done(f) => {
                    trace!(fragment = f, "Needed tile does not fit yet");
                    plan.blocked = Some(i);
                    return Ok(plan);
                }
                None => {}
            }
        }

        while let Some(&(f, pos)) = self.merged_order.get(self.merged_pos) {
            if pos < self.next[f] {
                self.merged_pos += 1;
                continue;
            }
            match self.try_take(ctx, f)? {
                Some(tile) => {
                    plan.tiles.push(tile);
                    self.merged_pos += 1;
                }
                None => break,
            }
        }
        Ok(plan)
    }

    /// Pick tiles fragment by fragment, within `window`.
    pub fn plan_unordered(&mut self, ctx: &ReadContext, window: Range<usize>) -> Result<Vec<PlannedTile>> {
        let mut planned = Vec::new();
        for f in window {
            while !self.fragment_done(f) {
                match self.try_take(ctx, f)? {
                    Some(tile) => planned.push(tile),
                    None => return Ok(planned),
                }
            }
        }
        Ok(planned)
    }
}

/// Merge per-fragment tile lists by bounding-box lower corner.
fn merge_tile_lists(ctx: &ReadContext, tile_lists: &[Vec<u64>]) -> Vec<(usize, usize)> {
    let _timer = ctx.stats.timer("merge_tile_lists");
    // Hilbert values of the lower corners, computed per fragment in parallel.
    let hilbert: Vec<Vec<u64>> = tile_lists
        .par_iter()
        .enumerate()
        .map(|(f, tiles)| {
            if !ctx.order.is_hilbert() {
                return Vec::new();
            }
            tiles
                .iter()
                .map(|&t| {
                    let corner = MbrLowerCorner::new(ctx.fragments[f].mbr(t), 0);
                    ctx.order.hilbert_value(&corner)
                })
                .collect()
        })
        .collect();

    let corner = |f: usize, pos: usize| {
        let t = tile_lists[f][pos];
        MbrLowerCorner::new(
            ctx.fragments[f].mbr(t),
            hilbert[f].get(pos).copied().unwrap_or(0),
        )
    };
    let less = |a: &(usize, usize), b: &(usize, usize)| {
        ctx.order
            .compare_mbrs(&corner(a.0, a.1), &corner(b.0, b.1))
            .then_with(|| a.0.cmp(&b.0))
            .is_lt()
    };

    let total = tile_lists.iter().map(|l| l.len()).sum();
    let mut merged = Vec::with_capacity(total);
    let mut heap = MinHeap::with_capacity(tile_lists.len());
    for (f, tiles) in tile_lists.iter().enumerate() {
        if !tiles.is_empty() {
            heap.push((f, 0), less);
        }
    }
    while let Some((f, pos)) = heap.pop(less) {
        merged.push((f, pos));
        if pos + 1 < tile_lists[f].len() {
            heap.push((f, pos + 1), less);
        }
    }
    merged
}

/// Read the coordinate, timestamp and condition tiles of planned tiles.
pub(crate) fn read_tiles(ctx: &ReadContext, planned: &[PlannedTile]) -> Result<Vec<ResultTile>> {
    let _timer = ctx.stats.timer("read_tiles");
    let tiles = planned
        .par_iter()
        .map(|p| read_tile(ctx, p.frag, p.tile))
        .collect::<Result<Vec<_>>>()?;
    ctx.stats.record_tiles_loaded(tiles.len() as u64);
    Ok(tiles)
}

fn read_tile(ctx: &ReadContext, f: usize, t: u64) -> Result<ResultTile> {
    let frag = &ctx.fragments[f];
    let coords = if ctx.zipped(f) {
        CoordStorage::zipped(&ctx.schema, ctx.source.unfilter(f, t, COORDS)?)
    } else {
        let dims = ctx
            .schema
            .dimensions
            .iter()
            .map(|d| ctx.source.unfilter(f, t, &d.name))
            .collect::<Result<Vec<_>>>()?;
        CoordStorage::unzipped(&ctx.schema, dims)
    };
    let mut tile = ResultTile::new(f, t, frag.cell_num(t), frag.fragment_timestamp(), coords);
    if frag.has_timestamps() {
        tile = tile.with_timestamps(ctx.source.unfilter(f, t, TIMESTAMPS)?);
    }
    for field in &ctx.condition_fields {
        tile.set_field(field.clone(), ctx.source.unfilter(f, t, field)?);
    }
    Ok(tile)
}

/// Outcome of filtering one tile.
#[derive(Debug, Default)]
pub(crate) struct TileFilter {
    /// Selection count per cell; `None` when every cell is selected once.
    pub counts: Option<Vec<u64>>,
    /// Selected cells matched by a delete: `(pos, delete timestamp, delete index)`.
    pub deletes: Vec<(u64, u64, u64)>,
}

/// Apply subarray ranges, the timestamp window, the query condition and
/// delete conditions to a tile. Runs before deduplication.
pub(crate) fn filter_tile(ctx: &ReadContext, tile: &ResultTile) -> Result<TileFilter> {
    let n = tile.cell_num() as usize;
    let f = tile.frag_idx();
    let mut filter = TileFilter::default();

    if !ctx.subarray.is_default() {
        filter.counts = Some(
            (0..n as u64)
                .map(|pos| ctx.subarray.cell_count(&ctx.schema, &CellView::new(tile, pos)))
                .collect(),
        );
    }

    if ctx.partial_window[f] && tile.has_timestamps() {
        let (start, end) = (ctx.config.timestamp_start, ctx.config.timestamp_end);
        let counts = filter.counts.get_or_insert_with(|| vec![1; n]);
        for (pos, count) in counts.iter_mut().enumerate() {
            let ts = tile.timestamp(pos as u64);
            if ts < start || ts > end {
                *count = 0;
            }
        }
    }

    if let Some(condition) = &ctx.condition {
        let pass = evaluate(ctx, condition.as_ref(), tile)?;
        let counts = filter.counts.get_or_insert_with(|| vec![1; n]);
        for (count, pass) in counts.iter_mut().zip(pass) {
            if pass == 0 {
                *count = 0;
            }
        }
    }

    let frag = &ctx.fragments[f];
    let (frag_start, _) = frag.timestamp_range();
    let mut deleted = vec![false; if ctx.delete_conditions.is_empty() { 0 } else { n }];
    for (idx, delete) in ctx.delete_conditions.iter().enumerate() {
        if delete.timestamp < frag_start || !delete.applies_to(frag.delete_condition_markers()) {
            continue;
        }
        let pass = evaluate(ctx, delete.condition.as_ref(), tile)?;
        for pos in 0..n {
            let selected = filter.counts.as_ref().map_or(true, |c| c[pos] > 0);
            if deleted[pos] || !selected || pass[pos] == 0 {
                continue;
            }
            if tile.timestamp(pos as u64) <= delete.timestamp {
                deleted[pos] = true;
                filter.deletes.push((pos as u64, delete.timestamp, idx as u64));
            }
        }
    }
    filter.deletes.sort_unstable_by_key(|d| d.0);
    Ok(filter)
}

fn evaluate(
    ctx: &ReadContext,
    condition: &dyn crate::condition::QueryCondition,
    tile: &ResultTile,
) -> Result<Vec<u8>> {
    let pass = condition.evaluate(&ctx.schema, tile)?;
    if pass.len() as u64 != tile.cell_num() {
        return Err(Error::Condition(format!(
            "condition returned {} results for a tile of {} cells",
            pass.len(),
            tile.cell_num()
        )));
    }
    Ok(pass)
}

/// Fields whose tile offsets fragment `f` needs during the read.
fn offsets_fields(ctx: &ReadContext, f: usize) -> Vec<String> {
    let mut fields = ctx.coord_fields(f);
    for name in ctx.condition_fields.iter().chain(&ctx.data_fields) {
        if !fields.contains(name) {
            fields.push(name.clone());
        }
    }
    fields
}

/// Load tile offsets of every included fragment.
pub(crate) fn load_all_tile_offsets(ctx: &ReadContext) -> Result<()> {
    let _timer = ctx.stats.timer("load_tile_offsets");
    let fields: Vec<Vec<String>> = (0..ctx.fragment_num()).map(|f| offsets_fields(ctx, f)).collect();
    let total: u64 = ctx
        .fragments
        .iter()
        .enumerate()
        .filter(|(f, _)| ctx.included[*f])
        .map(|(f, frag)| frag.tile_offsets_size(&fields[f]))
        .sum();
    if !ctx.ledger.try_reserve_tile_offsets(total) {
        warn!(bytes = total, "Tile offsets do not fit");
        return Err(Error::MemoryBudget(format!(
            "cannot load tile offsets ({total} bytes), increase memory budget"
        )));
    }
    ctx.fragments
        .par_iter()
        .enumerate()
        .filter(|(f, _)| ctx.included[*f])
        .try_for_each(|(f, frag)| frag.load_tile_offsets(&fields[f]))?;
    debug!(bytes = total, "Loaded tile offsets");
    Ok(())
}

/// Load tile offsets for as many fragments from `from` on as fit.
pub(crate) fn load_tile_offsets_window(ctx: &ReadContext, from: usize) -> Result<Range<usize>> {
    let _timer = ctx.stats.timer("load_tile_offsets");
    let mut end = from;
    while end < ctx.fragment_num() {
        if !ctx.included[end] {
            end += 1;
            continue;
        }
        let fields = offsets_fields(ctx, end);
        let size = ctx.fragments[end].tile_offsets_size(&fields);
        if !ctx.ledger.try_reserve_tile_offsets(size) {
            break;
        }
        ctx.fragments[end].load_tile_offsets(&fields)?;
        end += 1;
    }
    let loaded_any = (from..end).any(|f| ctx.included[f]);
    let remaining = (end..ctx.fragment_num()).any(|f| ctx.included[f]);
    if !loaded_any && remaining {
        return Err(Error::MemoryBudget(
            "cannot load tile offsets for only one fragment, increase memory budget".to_string(),
        ));
    }
    debug!(from, to = end, "Loaded tile offsets window");
    Ok(from..end)
}

/// Release the tile offsets of a window.
pub(crate) fn free_tile_offsets(ctx: &ReadContext, window: Range<usize>) {
    for f in window {
        if !ctx.included[f] {
            continue;
        }
        let size = ctx.fragments[f].tile_offsets_size(&offsets_fields(ctx, f));
        ctx.fragments[f].free_tile_offsets();
        ctx.ledger.release_tile_offsets(size);
    }
}
