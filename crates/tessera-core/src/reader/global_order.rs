//! Global-order merge engine.
//!
//! Resident tiles of every fragment feed a k-way merge over their next
//! selected cells. The merge emits cell slabs in global order, keeps only
//! the newest version of a coordinate when duplicates are not allowed, and
//! never emits a cell that an unloaded tile could still precede. Cursors
//! advance tentatively during the merge and are committed from what the
//! copy engine actually kept.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace, warn};

use super::bitmap::{BitmapWeight, GlobalOrderResultTile, SlabTile};
use super::context::{DeleteHandling, ReadContext};
use super::copy::{copy_slabs, CopyOutcome, Output, Slab};
use super::heap::MinHeap;
use super::loader::{self, CellOverhead, TileFilter, TileLoader};
use super::read_state::{FragIdx, ReadState};
use super::result_tile::CellView;
use super::{ReadEngine, ReaderPhase, RoundOutcome};
use crate::error::{Error, Result};
use crate::order::MbrLowerCorner;

/// A fragment's next cell in the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    frag: usize,
    /// Position of the tile in the fragment's resident queue.
    tile: usize,
    pos: u64,
}

/// What stops a cell from being emitted on behalf of a fragment that still
/// has tiles to load.
#[derive(Debug, Clone, Copy)]
enum Bound {
    /// The fragment has no candidate; its next unloaded tile.
    Tile(u64),
    /// The fragment's last resident selected cell, for fragments whose
    /// duplicates may continue into the next tile.
    LastCell { tile: usize, pos: u64 },
}

#[derive(Debug, Clone, Copy)]
struct SlabRef {
    frag: usize,
    tile: usize,
    start: u64,
    length: u64,
}

#[derive(Debug, Default)]
struct MergeOutcome {
    slabs: Vec<SlabRef>,
    cursors: Vec<FragIdx>,
    /// Fragments whose next tile is needed to go on.
    needed: Vec<usize>,
    /// Cells consumed without being emitted: dedup losers and purged cells.
    dropped: u64,
    exhausted: bool,
}

type TileQueues<W> = Vec<VecDeque<GlobalOrderResultTile<W>>>;

/// Reader producing cells in global order.
#[derive(Debug)]
pub(crate) struct GlobalOrderReader<W: BitmapWeight> {
    ctx: Arc<ReadContext>,
    state: ReadState,
    loader: TileLoader,
    tiles: TileQueues<W>,
    needed: Vec<usize>,
    stalled: bool,
    done: bool,
    phase: ReaderPhase,
}

impl<W: BitmapWeight> GlobalOrderReader<W> {
    pub fn new(ctx: Arc<ReadContext>) -> Result<Self> {
        let overhead = CellOverhead {
            bitmap: std::mem::size_of::<W>() as u64,
            hilbert: if ctx.order.is_hilbert() { 8 } else { 0 },
            post_dedup: u64::from(ctx.mode.deletes == DeleteHandling::Purge),
        };
        loader::load_all_tile_offsets(&ctx)?;
        let loader = TileLoader::new(&ctx, overhead, true)?;
        let n = ctx.fragment_num();
        Ok(Self {
            state: ReadState::new(n),
            loader,
            tiles: (0..n).map(|_| VecDeque::new()).collect(),
            needed: Vec::new(),
            stalled: false,
            done: false,
            phase: ReaderPhase::AddingResultTiles,
            ctx,
        })
    }

    /// Load tiles and compute their bitmaps. Returns how many were loaded.
    fn add_result_tiles(&mut self) -> Result<usize> {
        let ctx = Arc::clone(&self.ctx);
        let mut plan = self.loader.plan_global(&ctx, &self.needed)?;
        if let (true, Some(i)) = (self.stalled, plan.blocked) {
            if self.unload_read_ahead(self.needed[i])? > 0 {
                let retry = self.loader.plan_global(&ctx, &self.needed[i..])?;
                plan.tiles.extend(retry.tiles);
            }
        }
        let planned = plan.tiles;
        self.needed.clear();
        self.state.set_done_adding_result_tiles(self.loader.all_loaded());
        if planned.is_empty() {
            return Ok(0);
        }

        let tiles = loader::read_tiles(&ctx, &planned)?;
        let state = &self.state;
        let prepared = {
            let _timer = ctx.stats.timer("compute_tile_bitmaps");
            tiles
                .into_par_iter()
                .zip(planned.par_iter())
                .map(|(mut tile, plan)| -> Result<Option<GlobalOrderResultTile<W>>> {
                    let filter = loader::filter_tile(&ctx, &tile)?;
                    tile.clear_fields();
                    ctx.ledger.release_query_condition(plan.cost.condition);

                    let mut tile = GlobalOrderResultTile::<W>::new(tile);
                    tile.set_memory(plan.cost.coords);
                    apply_filter(&ctx, &mut tile, filter);
                    if tile.result_num() == 0 {
                        state.ignore_tile(plan.frag, plan.tile);
                        ctx.ledger.release_coords(plan.cost.coords);
                        return Ok(None);
                    }
                    if ctx.order.is_hilbert() {
                        let values = (0..tile.cell_num())
                            .map(|pos| ctx.order.hilbert_value(&CellView::new(tile.tile(), pos)))
                            .collect();
                        tile.set_hilbert_values(values);
                    }
                    Ok(Some(tile))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let loaded = prepared.len();
        let mut ignored = 0;
        for tile in prepared {
            match tile {
                Some(tile) => self.tiles[tile.frag_idx()].push_back(tile),
                None => ignored += 1,
            }
        }
        ctx.stats.record_tiles_ignored(ignored);
        debug!(loaded, ignored, "Added result tiles");
        Ok(loaded)
    }

    /// Merged rank of fragment `g`'s last resident tile if it was only read
    /// ahead: the merge has not touched it and an earlier resident tile
    /// still holds the fragment's next cell.
    fn read_ahead_rank(&self, g: usize) -> Option<usize> {
        let queue = &self.tiles[g];
        let back = queue.back()?;
        let cursor = self.state.cursor(g);
        if back.used() || back.tile_idx() <= cursor.tile_idx || self.needed.contains(&g) {
            return None;
        }
        let cand = Self::first_candidate(queue, g, cursor)?;
        (cand.tile + 1 < queue.len()).then(|| self.loader.merged_rank(g, back.tile_idx()))
    }

    /// Unload read-ahead tiles, latest in merged order first, until the
    /// next tile of `blocked` fits. Returns how many were unloaded.
    fn unload_read_ahead(&mut self, blocked: usize) -> Result<u64> {
        let ctx = Arc::clone(&self.ctx);
        let Some(t) = self.loader.next_tile(blocked) else {
            return Ok(0);
        };
        let cost = self.loader.tile_cost(&ctx, blocked, t)?;
        let mut unloaded = 0;
        while !ctx.ledger.fits_tile(cost.coords, cost.condition) {
            let victim = (0..self.tiles.len())
                .filter(|&g| g != blocked)
                .filter_map(|g| self.read_ahead_rank(g).map(|rank| (rank, g)))
                .max();
            let Some((_, g)) = victim else {
                break;
            };
            let Some(tile) = self.tiles[g].pop_back() else {
                break;
            };
            ctx.ledger.release_coords(tile.memory());
            self.loader.rewind(g, tile.tile_idx());
            unloaded += 1;
        }
        if unloaded > 0 {
            ctx.stats.record_tiles_unloaded(unloaded);
            debug!(fragment = blocked, unloaded, "Unloaded read-ahead tiles");
        }
        Ok(unloaded)
    }

    fn compare(ctx: &ReadContext, tiles: &TileQueues<W>, a: &Candidate, b: &Candidate) -> Ordering {
        let ta = &tiles[a.frag][a.tile];
        let tb = &tiles[b.frag][b.tile];
        ctx.order
            .compare(&ta.cell(a.pos), &tb.cell(b.pos))
            // Newest version first, then the later fragment.
            .then_with(|| tb.timestamp(b.pos).cmp(&ta.timestamp(a.pos)))
            .then_with(|| b.frag.cmp(&a.frag))
    }

    fn same_coords(ctx: &ReadContext, tiles: &TileQueues<W>, a: &Candidate, b: &Candidate) -> bool {
        ctx.order.same_coords(
            &tiles[a.frag][a.tile].cell(a.pos),
            &tiles[b.frag][b.tile].cell(b.pos),
        )
    }

    /// Fragments whose bound keeps `cand` from being emitted.
    fn blockers(
        ctx: &ReadContext,
        tiles: &TileQueues<W>,
        bounds: &[Option<Bound>],
        cand: &Candidate,
    ) -> Vec<usize> {
        let cell = tiles[cand.frag][cand.tile].cell(cand.pos);
        bounds
            .iter()
            .enumerate()
            .filter(|(f, bound)| match bound {
                None => false,
                Some(Bound::Tile(t)) => {
                    let lower = MbrLowerCorner::new(ctx.fragments[*f].mbr(*t), 0);
                    !ctx.order.precedes_tile(&cell, &lower)
                }
                Some(Bound::LastCell { tile, pos }) => {
                    ctx.order.compare(&cell, &tiles[*f][*tile].cell(*pos)) != Ordering::Less
                }
            })
            .map(|(f, _)| f)
            .collect()
    }

    fn is_safe(ctx: &ReadContext, tiles: &TileQueues<W>, bounds: &[Option<Bound>], cand: &Candidate) -> bool {
        Self::blockers(ctx, tiles, bounds, cand).is_empty()
    }

    /// First selected cell at or after the cursor.
    fn first_candidate(queue: &VecDeque<GlobalOrderResultTile<W>>, frag: usize, cursor: FragIdx) -> Option<Candidate> {
        queue.iter().enumerate().find_map(|(i, tile)| {
            if tile.tile_idx() < cursor.tile_idx {
                return None;
            }
            let pos = if tile.tile_idx() == cursor.tile_idx {
                tile.next_selected(cursor.cell_idx)
            } else {
                tile.first_cell_in_bitmap()
            };
            pos.map(|pos| Candidate { frag, tile: i, pos })
        })
    }

    fn bound(&self, f: usize, starved: bool) -> Option<Bound> {
        if self.loader.fragment_done(f) {
            return None;
        }
        let next = self.loader.next_tile(f)?;
        if starved {
            return Some(Bound::Tile(next));
        }
        if !self.ctx.fragments[f].has_timestamps() {
            return None;
        }
        let last = self.tiles[f]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, t)| t.last_cell_in_bitmap().map(|pos| Bound::LastCell { tile: i, pos }));
        Some(last.unwrap_or(Bound::Tile(next)))
    }

    /// Next candidate of a fragment from `(tile, from)`.
    ///
    /// When deduplicating fragments with per-cell timestamps, cells with
    /// the same coordinates as `prev` are older versions and are cleared.
    fn advance(&mut self, frag: usize, mut tile: usize, mut from: u64, prev: Option<(usize, u64)>) -> (Option<Candidate>, u64) {
        let dim_num = self.ctx.schema.dim_num();
        let dedup_in_fragment = self.ctx.mode.dedup && self.ctx.fragments[frag].has_timestamps();
        let mut cleared = 0;
        while tile < self.tiles[frag].len() {
            let Some(pos) = self.tiles[frag][tile].next_selected(from) else {
                tile += 1;
                from = 0;
                continue;
            };
            if let (true, Some((pt, pp))) = (dedup_in_fragment, prev) {
                let queue = &self.tiles[frag];
                if queue[tile].same_coords_as(pos, &queue[pt], pp, dim_num) {
                    self.tiles[frag][tile].set_used();
                    self.tiles[frag][tile].clear_cell(pos);
                    cleared += 1;
                    from = pos + 1;
                    continue;
                }
            }
            return (Some(Candidate { frag, tile, pos }), cleared);
        }
        (None, cleared)
    }

    /// Consume a candidate without emitting it and move its fragment on.
    fn skip(
        &mut self,
        heap: &mut MinHeap<Candidate>,
        bounds: &mut [Option<Bound>],
        cursors: &mut [FragIdx],
        cand: Candidate,
    ) -> u64 {
        self.tiles[cand.frag][cand.tile].set_used();
        self.tiles[cand.frag][cand.tile].clear_cell(cand.pos);
        cursors[cand.frag] = FragIdx::new(self.tiles[cand.frag][cand.tile].tile_idx(), cand.pos + 1);
        let (next, cleared) = self.advance(cand.frag, cand.tile, cand.pos + 1, Some((cand.tile, cand.pos)));
        self.push_or_starve(heap, bounds, cand.frag, next);
        1 + cleared
    }

    fn push_or_starve(
        &self,
        heap: &mut MinHeap<Candidate>,
        bounds: &mut [Option<Bound>],
        frag: usize,
        next: Option<Candidate>,
    ) {
        match next {
            Some(c) => heap.push(c, |a, b| Self::compare(&self.ctx, &self.tiles, a, b).is_lt()),
            None => bounds[frag] = self.bound(frag, true),
        }
    }

    /// Merge resident tiles into slabs holding at most `max_cells` results.
    fn merge(&mut self, max_cells: u64) -> MergeOutcome {
        let ctx = Arc::clone(&self.ctx);
        let _timer = ctx.stats.timer("merge_result_cell_slabs");
        let n = ctx.fragment_num();
        let dedup = ctx.mode.dedup;
        let purge = ctx.mode.deletes == DeleteHandling::Purge;
        let mut cursors = self.state.frag_idx().to_vec();

        let seeds: Vec<Option<Candidate>> = {
            let tiles = &self.tiles;
            (0..n)
                .into_par_iter()
                .map(|f| Self::first_candidate(&tiles[f], f, cursors[f]))
                .collect()
        };
        let mut bounds: Vec<Option<Bound>> = (0..n).map(|f| self.bound(f, seeds[f].is_none())).collect();
        let mut heap = MinHeap::with_capacity(n);
        for cand in seeds.into_iter().flatten() {
            heap.push(cand, |a, b| Self::compare(&ctx, &self.tiles, a, b).is_lt());
        }

        let mut outcome = MergeOutcome::default();
        let mut emitted = 0u64;
        let mut blocked = false;
        // A deleted version: older versions of its coordinates are dropped.
        let mut purged: Option<Candidate> = None;

        while emitted < max_cells {
            let Some(&top) = heap.peek() else {
                break;
            };
            let blockers = Self::blockers(&ctx, &self.tiles, &bounds, &top);
            if !blockers.is_empty() {
                trace!(fragment = top.frag, ?blockers, "Cell blocked by unloaded tiles");
                outcome.needed = blockers;
                blocked = true;
                break;
            }
            heap.pop(|a, b| Self::compare(&ctx, &self.tiles, a, b).is_lt());

            if dedup {
                while let Some(&next) = heap.peek() {
                    if !Self::same_coords(&ctx, &self.tiles, &top, &next) {
                        break;
                    }
                    heap.pop(|a, b| Self::compare(&ctx, &self.tiles, a, b).is_lt());
                    outcome.dropped += self.skip(&mut heap, &mut bounds, &mut cursors, next);
                }
            }

            if purge {
                let older = purged.is_some_and(|p| Self::same_coords(&ctx, &self.tiles, &p, &top));
                if older || !self.tiles[top.frag][top.tile].post_dedup_selected(top.pos) {
                    if !older {
                        purged = Some(top);
                    }
                    outcome.dropped += self.skip(&mut heap, &mut bounds, &mut cursors, top);
                    continue;
                }
                purged = None;
            }

            let (frag, tile) = (top.frag, top.tile);
            let single_cell = purge && self.tiles[frag][tile].has_timestamps();
            let dedup_in_fragment = dedup && self.tiles[frag][tile].has_timestamps();
            let dim_num = ctx.schema.dim_num();
            let mut end = top.pos + 1;
            let mut last = top.pos;
            let mut results = self.tiles[frag][tile].weight(top.pos);

            while !single_cell && emitted + results < max_cells {
                let Some(pos) = self.tiles[frag][tile].next_selected(end) else {
                    break;
                };
                if dedup_in_fragment && self.tiles[frag][tile].same_coords(pos, last, dim_num) {
                    self.tiles[frag][tile].clear_cell(pos);
                    outcome.dropped += 1;
                    end = pos + 1;
                    continue;
                }
                if purge && !self.tiles[frag][tile].post_dedup_selected(pos) {
                    break;
                }
                let cand = Candidate { frag, tile, pos };
                if let Some(head) = heap.peek() {
                    let cell = self.tiles[frag][tile].cell(pos);
                    let head_cell = self.tiles[head.frag][head.tile].cell(head.pos);
                    if ctx.order.compare(&cell, &head_cell) != Ordering::Less {
                        break;
                    }
                }
                if !Self::is_safe(&ctx, &self.tiles, &bounds, &cand) {
                    break;
                }
                results += self.tiles[frag][tile].weight(pos);
                end = pos + 1;
                last = pos;
            }

            self.tiles[frag][tile].set_used();
            outcome.slabs.push(SlabRef {
                frag,
                tile,
                start: top.pos,
                length: end - top.pos,
            });
            emitted += results;
            cursors[frag] = FragIdx::new(self.tiles[frag][tile].tile_idx(), end);

            let prev = dedup_in_fragment.then_some((tile, last));
            let (next, cleared) = self.advance(frag, tile, end, prev);
            outcome.dropped += cleared;
            self.push_or_starve(&mut heap, &mut bounds, frag, next);
        }

        if !blocked && heap.is_empty() {
            outcome.needed = (0..n).filter(|&f| !self.loader.fragment_done(f)).collect();
            outcome.exhausted = outcome.needed.is_empty();
        }
        ctx.stats.record_dedup(outcome.dropped);
        ctx.stats.record_slabs(outcome.slabs.len() as u64);
        outcome.cursors = cursors;
        outcome
    }

    /// Commit cursors from what the copy kept and evict consumed tiles.
    fn commit(&mut self, merge: &MergeOutcome, copied: &CopyOutcome) -> u64 {
        let mut cursors = merge.cursors.clone();
        let mut rolled_back = vec![false; cursors.len()];
        for (slab, &kept) in merge.slabs.iter().zip(&copied.lengths) {
            if kept < slab.length && !rolled_back[slab.frag] {
                rolled_back[slab.frag] = true;
                let tile_idx = self.tiles[slab.frag][slab.tile].tile_idx();
                cursors[slab.frag] = FragIdx::new(tile_idx, slab.start + kept);
            }
        }

        let mut evicted = 0;
        for (f, mut cursor) in cursors.into_iter().enumerate() {
            while let Some(front) = self.tiles[f].front() {
                let t = front.tile_idx();
                let from = match t.cmp(&cursor.tile_idx) {
                    Ordering::Less => front.cell_num(),
                    Ordering::Equal => cursor.cell_idx,
                    Ordering::Greater => 0,
                };
                if front.next_selected(from).is_some() {
                    break;
                }
                cursor = cursor.max(FragIdx::new(t + 1, 0));
                self.ctx.ledger.release_coords(front.memory());
                self.tiles[f].pop_front();
                evicted += 1;
            }
            self.state.set_cursor(f, cursor);
        }
        self.ctx.stats.record_tiles_evicted(evicted);
        evicted
    }
}

/// Turn a tile's filter result into its bitmap and delete bookkeeping.
fn apply_filter<W: BitmapWeight>(ctx: &ReadContext, tile: &mut GlobalOrderResultTile<W>, filter: TileFilter) {
    if let Some(counts) = filter.counts {
        tile.compute_bitmap(|pos| counts[pos as usize]);
    }
    for (pos, timestamp, idx) in filter.deletes {
        match ctx.mode.deletes {
            DeleteHandling::Clear => {
                if SlabTile::weight(&*tile, pos) > 0 {
                    tile.clear_cell(pos);
                }
            }
            DeleteHandling::RecordMeta => tile.set_delete_meta(pos, timestamp, idx),
            DeleteHandling::Purge => tile.mark_deleted(pos),
        }
    }
}

impl<W: BitmapWeight> ReadEngine for GlobalOrderReader<W> {
    fn run_round(&mut self, out: &mut Output<'_>) -> Result<RoundOutcome> {
        let ctx = Arc::clone(&self.ctx);
        ctx.stats.record_round();

        self.phase = ReaderPhase::AddingResultTiles;
        let loaded = self.add_result_tiles()?;

        self.phase = ReaderPhase::Merging;
        let merge = self.merge(out.max_cells(&ctx));
        debug!(
            slabs = merge.slabs.len(),
            needed = merge.needed.len(),
            exhausted = merge.exhausted,
            "Done merging result cell slabs"
        );

        self.phase = ReaderPhase::Copying;
        let copied = {
            let slabs: Vec<Slab<'_, GlobalOrderResultTile<W>>> = merge
                .slabs
                .iter()
                .map(|s| Slab {
                    tile: &self.tiles[s.frag][s.tile],
                    start: s.start,
                    length: s.length,
                })
                .collect();
            copy_slabs(&ctx, &slabs, out)?
        };

        let all_kept = merge
            .slabs
            .iter()
            .zip(&copied.lengths)
            .all(|(s, &kept)| kept == s.length);
        let evicted = self.commit(&merge, &copied);
        self.done = merge.exhausted && all_kept;
        self.needed = merge.needed;

        let progress = self.done || loaded > 0 || evicted > 0 || copied.cells > 0 || merge.dropped > 0;
        if progress || copied.buffers_full {
            self.stalled = false;
        } else if self.stalled {
            warn!("No tile can be loaded and no cell emitted");
            return Err(Error::MemoryBudget(
                "cannot load enough tiles to make progress in global order, increase memory budget"
                    .to_string(),
            ));
        } else {
            self.stalled = true;
        }

        self.phase = ReaderPhase::Idle;
        Ok(RoundOutcome {
            cells: copied.cells,
            buffers_full: copied.buffers_full,
        })
    }

    fn done(&self) -> bool {
        self.done
    }

    fn phase(&self) -> ReaderPhase {
        self.phase
    }

    fn read_state(&self) -> &ReadState {
        &self.state
    }
}
