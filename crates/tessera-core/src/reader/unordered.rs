//! Unordered engine for arrays with duplicates.
//!
//! Cells come out fragment by fragment, tile by tile, with no merge. Tile
//! offsets can be loaded for a window of fragments at a time when the
//! whole set does not fit the budget.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::bitmap::{BitmapWeight, ResultTileWithBitmap};
use super::context::ReadContext;
use super::copy::{copy_slabs, Output, Slab};
use super::loader::{self, CellOverhead, TileLoader};
use super::read_state::{FragIdx, ReadState};
use super::{ReadEngine, ReaderPhase, RoundOutcome};
use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct UnorderedReader<W: BitmapWeight> {
    ctx: Arc<ReadContext>,
    state: ReadState,
    loader: TileLoader,
    /// Resident tiles in load order.
    tiles: VecDeque<ResultTileWithBitmap<W>>,
    /// Fragments whose tile offsets are loaded.
    window: Range<usize>,
    stalled: bool,
    done: bool,
    phase: ReaderPhase,
}

impl<W: BitmapWeight> UnorderedReader<W> {
    pub fn new(ctx: Arc<ReadContext>) -> Result<Self> {
        if !ctx.schema.allows_dups {
            return Err(Error::Unsupported(
                "unordered reads require an array that allows duplicates".to_string(),
            ));
        }
        if ctx.config.consolidation_with_timestamps {
            return Err(Error::Unsupported(
                "consolidation with timestamps requires global order".to_string(),
            ));
        }
        let overhead = CellOverhead {
            bitmap: std::mem::size_of::<W>() as u64,
            ..Default::default()
        };
        let n = ctx.fragment_num();
        let window = if ctx.config.partial_tile_offsets_loading {
            loader::load_tile_offsets_window(&ctx, 0)?
        } else {
            loader::load_all_tile_offsets(&ctx)?;
            0..n
        };
        let loader = TileLoader::new(&ctx, overhead, false)?;
        Ok(Self {
            state: ReadState::new(n),
            loader,
            tiles: VecDeque::new(),
            window,
            stalled: false,
            done: false,
            phase: ReaderPhase::AddingResultTiles,
            ctx,
        })
    }

    /// Move to the next offsets window once the current one is drained.
    fn advance_window(&mut self) -> Result<bool> {
        let n = self.ctx.fragment_num();
        let drained = self.window.clone().all(|f| self.loader.fragment_done(f)) && self.tiles.is_empty();
        if !drained || self.window.end >= n {
            return Ok(false);
        }
        loader::free_tile_offsets(&self.ctx, self.window.clone());
        self.window = loader::load_tile_offsets_window(&self.ctx, self.window.end)?;
        debug!(from = self.window.start, to = self.window.end, "Moved tile offsets window");
        Ok(true)
    }

    fn add_result_tiles(&mut self) -> Result<usize> {
        let ctx = Arc::clone(&self.ctx);
        let planned = self.loader.plan_unordered(&ctx, self.window.clone())?;
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
                .map(|(mut tile, plan)| -> Result<Option<ResultTileWithBitmap<W>>> {
                    let filter = loader::filter_tile(&ctx, &tile)?;
                    tile.clear_fields();
                    ctx.ledger.release_query_condition(plan.cost.condition);

                    let mut tile = ResultTileWithBitmap::<W>::new(tile);
                    tile.set_memory(plan.cost.coords);
                    if let Some(counts) = filter.counts {
                        tile.compute_bitmap(|pos| counts[pos as usize]);
                    }
                    for (pos, _, _) in filter.deletes {
                        if tile.weight(pos) > 0 {
                            tile.clear_cell(pos);
                        }
                    }
                    if tile.result_num() == 0 {
                        state.ignore_tile(plan.frag, plan.tile);
                        ctx.ledger.release_coords(plan.cost.coords);
                        return Ok(None);
                    }
                    Ok(Some(tile))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let loaded = prepared.len();
        let before = self.tiles.len();
        self.tiles.extend(prepared.into_iter().flatten());
        let ignored = (loaded - (self.tiles.len() - before)) as u64;
        ctx.stats.record_tiles_ignored(ignored);
        debug!(loaded, ignored, "Added result tiles");
        Ok(loaded)
    }

    /// Slabs from the resident tiles, up to `max_cells` results.
    fn create_slabs(&self, max_cells: u64) -> Vec<(usize, u64, u64)> {
        let mut slabs = Vec::new();
        let mut results = 0;
        for (i, tile) in self.tiles.iter().enumerate() {
            if results >= max_cells {
                break;
            }
            let cursor = self.state.cursor(tile.frag_idx());
            let first = if cursor.tile_idx == tile.tile_idx() {
                tile.next_selected(cursor.cell_idx)
            } else {
                tile.first_cell_in_bitmap()
            };
            let Some(start) = first else {
                continue;
            };
            // The last slab stops at the cell reaching the result limit.
            let remaining = max_cells - results;
            let mut end = tile.cell_num();
            let mut found = tile.result_num_between_pos(start, end);
            if found > remaining {
                end = tile.pos_with_given_result_sum(start, remaining) + 1;
                found = tile.result_num_between_pos(start, end);
            }
            slabs.push((i, start, end - start));
            results += found;
        }
        slabs
    }

    /// Advance cursors over what was copied and drop consumed tiles.
    fn commit(&mut self, slabs: &[(usize, u64, u64)], lengths: &[u64]) -> u64 {
        for (&(i, start, length), &kept) in slabs.iter().zip(lengths) {
            let tile = &self.tiles[i];
            let (f, t) = (tile.frag_idx(), tile.tile_idx());
            self.state.set_cursor(f, FragIdx::new(t, start + kept));
            if kept < length {
                break;
            }
        }

        let mut evicted = 0;
        while let Some(front) = self.tiles.front() {
            let (f, t) = (front.frag_idx(), front.tile_idx());
            let cursor = self.state.cursor(f);
            let consumed = match cursor.tile_idx.cmp(&t) {
                Ordering::Less => false,
                Ordering::Equal => front.next_selected(cursor.cell_idx).is_none(),
                Ordering::Greater => true,
            };
            if !consumed {
                break;
            }
            if cursor.tile_idx == t {
                self.state.set_cursor(f, FragIdx::new(t + 1, 0));
            }
            self.ctx.ledger.release_coords(front.memory());
            self.tiles.pop_front();
            evicted += 1;
        }
        self.ctx.stats.record_tiles_evicted(evicted);
        evicted
    }
}

impl<W: BitmapWeight> ReadEngine for UnorderedReader<W> {
    fn run_round(&mut self, out: &mut Output<'_>) -> Result<RoundOutcome> {
        let ctx = Arc::clone(&self.ctx);
        ctx.stats.record_round();

        self.phase = ReaderPhase::AddingResultTiles;
        let moved = self.advance_window()?;
        let loaded = self.add_result_tiles()?;

        self.phase = ReaderPhase::Streaming;
        let slabs = self.create_slabs(out.max_cells(&ctx));
        ctx.stats.record_slabs(slabs.len() as u64);

        self.phase = ReaderPhase::Copying;
        let copied = {
            let views: Vec<Slab<'_, ResultTileWithBitmap<W>>> = slabs
                .iter()
                .map(|&(i, start, length)| Slab {
                    tile: &self.tiles[i],
                    start,
                    length,
                })
                .collect();
            copy_slabs(&ctx, &views, out)?
        };
        let evicted = self.commit(&slabs, &copied.lengths);
        self.done = self.tiles.is_empty() && self.loader.all_loaded();

        let progress = self.done || moved || loaded > 0 || evicted > 0 || copied.cells > 0;
        if progress || copied.buffers_full {
            self.stalled = false;
        } else if self.stalled {
            warn!("No tile can be loaded and no cell emitted");
            return Err(Error::MemoryBudget(
                "cannot load enough tiles to make progress in unordered mode, increase memory budget"
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
