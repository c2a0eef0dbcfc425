//! Cell-slab copy engine.
//!
//! Engines hand over slabs, runs of cells of one resident tile in the
//! order they must appear in the output. The copy engine trims them to the
//! buffer capacity and the copy memory budget, loads the attribute tiles it
//! needs in bounded batches, and writes each field with data-parallel
//! tasks over disjoint slices of the output.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::bitmap::SlabTile;
use super::context::ReadContext;
use crate::aggregate::Aggregator;
use crate::buffer::QueryBuffer;
use crate::config::OffsetsMode;
use crate::error::{Error, Result};
use crate::schema::{FieldInfo, FieldKind};
use crate::tile::TileTuple;

/// Smallest number of cells worth a separate copy task.
const MIN_CELLS_PER_TASK: u64 = 4096;

type TileKey = (usize, u64);
type TileCache = HashMap<TileKey, TileTuple>;

/// Cells `[start, start + length)` of one resident tile.
#[derive(Debug)]
pub(crate) struct Slab<'a, T> {
    pub tile: &'a T,
    pub start: u64,
    pub length: u64,
}

impl<T> Clone for Slab<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slab<'_, T> {}

impl<T: SlabTile> Slab<'_, T> {
    fn key(&self) -> TileKey {
        let tile = self.tile.result_tile();
        (tile.frag_idx(), tile.tile_idx())
    }
}

/// A requested output field with its buffer.
#[derive(Debug)]
pub struct OutputField {
    pub(crate) name: String,
    pub(crate) info: FieldInfo,
    pub(crate) buffer: QueryBuffer,
}

/// Destination of a round.
pub(crate) struct Output<'q> {
    pub fields: &'q mut [OutputField],
    pub aggregates: &'q mut [(String, Box<dyn Aggregator>)],
    /// Cells already written during the current submit.
    pub cells: u64,
}

impl Output<'_> {
    /// How many more cells fit every buffer.
    ///
    /// Unlimited when only aggregates are requested.
    pub fn max_cells(&self, ctx: &ReadContext) -> u64 {
        let osize = ctx.config.offset_size();
        let extra = u64::from(ctx.config.offsets_extra_element);
        self.fields
            .iter()
            .map(|field| {
                let buffer = &field.buffer;
                let mut rows = if field.info.var {
                    ((buffer.offsets_capacity() / osize) as u64).saturating_sub(extra)
                } else {
                    (buffer.data_capacity() / field.info.cell_size()) as u64
                };
                if field.info.nullable {
                    rows = rows.min(buffer.validity_capacity() as u64);
                }
                rows.saturating_sub(self.cells)
            })
            .min()
            .unwrap_or(u64::MAX)
    }
}

/// What a copy kept.
#[derive(Debug)]
pub(crate) struct CopyOutcome {
    /// Copied length of each slab; shorter than requested when trimmed.
    pub lengths: Vec<u64>,
    pub cells: u64,
    /// A buffer ran out of room.
    pub buffers_full: bool,
}

/// Copy slabs into the output buffers and feed the aggregates.
pub(crate) fn copy_slabs<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    out: &mut Output<'_>,
) -> Result<CopyOutcome> {
    let _timer = ctx.stats.timer("copy_slabs");
    let mut lengths: Vec<u64> = slabs.iter().map(|s| s.length).collect();
    let mut buffers_full = trim_to_cells(slabs, &mut lengths, out.max_cells(ctx));
    trim_to_memory(ctx, slabs, &mut lengths, out)?;

    let base_cells = out.cells;
    let mut var_ends: Vec<Option<Vec<u64>>> = Vec::with_capacity(out.fields.len());
    // Var fields go first: running out of var space cuts the cell count
    // for every other field.
    for field in out.fields.iter_mut() {
        if field.info.var {
            let (ends, trimmed) = copy_var_field(ctx, slabs, &mut lengths, field, base_cells)?;
            buffers_full |= trimmed;
            var_ends.push(Some(ends));
        } else {
            var_ends.push(None);
        }
    }

    let cells: u64 = slabs
        .iter()
        .zip(&lengths)
        .map(|(s, &len)| s.tile.result_num_between_pos(s.start, s.start + len))
        .sum();

    for field in out.fields.iter_mut() {
        if !field.info.var {
            copy_fixed_field(ctx, slabs, &lengths, field, base_cells)?;
        }
    }

    aggregate(ctx, slabs, &lengths, out.aggregates)?;

    let total = base_cells + cells;
    for (field, ends) in out.fields.iter_mut().zip(var_ends) {
        let validity = if field.info.nullable { total as usize } else { 0 };
        match ends {
            Some(ends) => {
                let bytes = if cells == 0 { 0 } else { ends[cells as usize - 1] };
                finish_var_field(ctx, field, total, bytes, validity)?;
            }
            None => {
                let data = total as usize * field.info.cell_size();
                field.buffer.set_sizes(data, 0, validity);
            }
        }
    }

    out.cells = total;
    ctx.stats.record_cells_copied(cells);
    debug!(
        slabs = slabs.len(),
        cells,
        buffers_full,
        "Copied cell slabs"
    );
    Ok(CopyOutcome {
        lengths,
        cells,
        buffers_full,
    })
}

/// Trim slab lengths so they hold at most `max` cells, never splitting a
/// cell's weight. Returns whether anything was cut.
fn trim_to_cells<T: SlabTile>(slabs: &[Slab<'_, T>], lengths: &mut [u64], max: u64) -> bool {
    let mut remaining = max;
    let mut trimmed = false;
    for (slab, len) in slabs.iter().zip(lengths.iter_mut()) {
        if trimmed {
            *len = 0;
            continue;
        }
        let (end, results) = slab.tile.cells_within(slab.start, slab.start + *len, remaining);
        if end < slab.start + *len {
            trimmed = true;
        }
        *len = end - slab.start;
        remaining -= results;
    }
    trimmed
}

/// Defer slabs whose attribute tiles do not fit the copy budget.
fn trim_to_memory<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &mut [u64],
    out: &Output<'_>,
) -> Result<()> {
    let mut fields: Vec<&str> = Vec::new();
    let names = out
        .fields
        .iter()
        .filter(|f| matches!(f.info.kind, FieldKind::Attribute(_)))
        .map(|f| f.name.as_str())
        .chain(out.aggregates.iter().filter_map(|(_, a)| a.field()));
    for name in names {
        if matches!(ctx.schema.field(name)?.kind, FieldKind::Attribute(_)) && !fields.contains(&name) {
            fields.push(name);
        }
    }
    if fields.is_empty() {
        return Ok(());
    }

    let available = ctx.ledger.available_for_copy();
    let mut keep = lengths.iter().position(|&l| l == 0).unwrap_or(lengths.len());
    let candidates = keep;
    for name in fields {
        let mut seen = HashSet::new();
        let mut total = 0;
        for (i, slab) in slabs[..keep].iter().enumerate() {
            let (f, t) = slab.key();
            if seen.insert((f, t)) {
                total += ctx.fragments[f].tile_size(name, t)?;
            }
            if total > available {
                keep = i;
                break;
            }
        }
    }

    if keep == 0 && candidates > 0 {
        warn!(available, "Cannot copy a single slab");
        return Err(Error::MemoryBudget(
            "unable to copy one slab with the current memory budget, increase memory budget"
                .to_string(),
        ));
    }
    if keep < candidates {
        debug!(kept = keep, deferred = candidates - keep, available, "Deferring slabs to fit copy budget");
        ctx.stats.record_budget_stop();
        lengths[keep..].iter_mut().for_each(|l| *l = 0);
    }
    Ok(())
}

/// Split consecutive slabs into batches whose distinct tiles of `field`
/// stay under the per-batch limit. Every batch holds at least one slab.
fn batches<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &[u64],
    field: Option<&str>,
) -> Result<Vec<Range<usize>>> {
    let end = lengths.iter().position(|&l| l == 0).unwrap_or(lengths.len());
    let Some(field) = field else {
        return Ok(vec![0..end]);
    };
    let limit = ctx.config.tile_upper_memory_limit;
    let mut batches = Vec::new();
    let mut start = 0;
    let mut size = 0;
    let mut seen = HashSet::new();
    for (i, slab) in slabs[..end].iter().enumerate() {
        let (f, t) = slab.key();
        if seen.contains(&(f, t)) {
            continue;
        }
        let tile_size = ctx.fragments[f].tile_size(field, t)?;
        if size + tile_size > limit && i > start {
            batches.push(start..i);
            start = i;
            size = 0;
            seen.clear();
        }
        seen.insert((f, t));
        size += tile_size;
    }
    if start < end {
        batches.push(start..end);
    }
    Ok(batches)
}

/// Load the distinct tiles of `field` a batch of slabs reads.
fn load_tiles<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    range: Range<usize>,
    field: &str,
) -> Result<TileCache> {
    let mut keys: Vec<TileKey> = slabs[range].iter().map(|s| s.key()).collect();
    keys.sort_unstable();
    keys.dedup();
    let tiles = keys
        .par_iter()
        .map(|&(f, t)| Ok(((f, t), ctx.source.unfilter(f, t, field)?)))
        .collect::<Result<Vec<_>>>()?;
    ctx.stats.record_copy_batch();
    Ok(tiles.into_iter().collect())
}

/// A piece of a slab copied by one worker.
#[derive(Debug, Clone, Copy)]
struct CopyTask {
    slab: usize,
    start: u64,
    end: u64,
    /// First output row, relative to the round.
    row: u64,
    rows: u64,
}

/// Partition slabs into tasks, splitting large slabs so every worker gets
/// a share.
fn copy_tasks<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &[u64],
    range: Range<usize>,
    first_row: u64,
) -> Vec<CopyTask> {
    let total: u64 = lengths[range.clone()].iter().sum();
    let threads = ctx.config.worker_threads() as u64;
    let chunk = (total / (threads * 2).max(1)).max(MIN_CELLS_PER_TASK);
    let mut tasks = Vec::new();
    let mut row = first_row;
    for i in range {
        let slab = &slabs[i];
        let end = slab.start + lengths[i];
        let mut start = slab.start;
        while start < end {
            let stop = (start + chunk).min(end);
            let rows = slab.tile.result_num_between_pos(start, stop);
            tasks.push(CopyTask {
                slab: i,
                start,
                end: stop,
                row,
                rows,
            });
            row += rows;
            start = stop;
        }
    }
    tasks
}

/// Cut `dst` into one slice per task, `unit` bytes per row.
fn split_rows<'d, D>(dst: &'d mut [D], tasks: &[CopyTask], unit: usize) -> Vec<&'d mut [D]> {
    let mut rest = dst;
    let mut chunks = Vec::with_capacity(tasks.len());
    for task in tasks {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(task.rows as usize * unit);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

fn missing_tile(name: &str, (f, t): TileKey) -> Error {
    Error::Internal(format!("tile {t} of fragment {f} for {name} was not loaded"))
}

/// Where fixed cell values come from.
enum FixedSource<'a> {
    /// One packed value per cell.
    Packed(&'a [u8]),
    /// One dimension of zipped coordinates.
    Zipped(usize),
    Timestamps,
    DeleteTimestamps,
    DeleteConditionIndex,
}

impl<'a> FixedSource<'a> {
    fn resolve<T: SlabTile>(
        name: &str,
        info: &FieldInfo,
        slab: &Slab<'a, T>,
        cache: &'a TileCache,
    ) -> Result<Self> {
        Ok(match info.kind {
            FieldKind::Dimension(d) => match slab.tile.result_tile().coord_tile(d) {
                Some(tile) => FixedSource::Packed(tile.fixed_data()),
                None => FixedSource::Zipped(d),
            },
            FieldKind::Attribute(_) => FixedSource::Packed(
                cache
                    .get(&slab.key())
                    .ok_or_else(|| missing_tile(name, slab.key()))?
                    .fixed_data(),
            ),
            FieldKind::Timestamps => FixedSource::Timestamps,
            FieldKind::DeleteTimestamps => FixedSource::DeleteTimestamps,
            FieldKind::DeleteConditionIndex => FixedSource::DeleteConditionIndex,
        })
    }

    fn write<T: SlabTile>(&self, tile: &T, pos: u64, cell_size: usize, dst: &mut [u8]) {
        match self {
            FixedSource::Packed(data) => {
                let start = pos as usize * cell_size;
                dst.copy_from_slice(&data[start..start + cell_size]);
            }
            FixedSource::Zipped(d) => dst.copy_from_slice(tile.result_tile().coord(pos, *d)),
            FixedSource::Timestamps => {
                dst.copy_from_slice(&tile.result_tile().timestamp(pos).to_le_bytes())
            }
            FixedSource::DeleteTimestamps => {
                dst.copy_from_slice(&tile.delete_timestamp(pos).to_le_bytes())
            }
            FixedSource::DeleteConditionIndex => {
                dst.copy_from_slice(&tile.delete_condition_index(pos).to_le_bytes())
            }
        }
    }
}

fn copy_fixed_task<T: SlabTile>(
    src: &FixedSource<'_>,
    tile: &T,
    task: &CopyTask,
    cell_size: usize,
    dst: &mut [u8],
) {
    if let FixedSource::Packed(data) = src {
        if tile.copy_full_tile() {
            let (start, end) = (task.start as usize, task.end as usize);
            dst.copy_from_slice(&data[start * cell_size..end * cell_size]);
            return;
        }
    }
    let mut offset = 0;
    for pos in task.start..task.end {
        for _ in 0..tile.weight(pos) {
            src.write(tile, pos, cell_size, &mut dst[offset..offset + cell_size]);
            offset += cell_size;
        }
    }
}

fn copy_validity_task<T: SlabTile>(validity: Option<&TileTuple>, tile: &T, task: &CopyTask, dst: &mut [u8]) {
    let mut offset = 0;
    for pos in task.start..task.end {
        let weight = tile.weight(pos) as usize;
        let valid = validity.map_or(1, |v| u8::from(v.is_valid(pos)));
        dst[offset..offset + weight].fill(valid);
        offset += weight;
    }
}

/// Copy validity bytes of a batch.
fn copy_validity<T: SlabTile>(
    slabs: &[Slab<'_, T>],
    tasks: &[CopyTask],
    info: &FieldInfo,
    cache: &TileCache,
    buffer: &mut QueryBuffer,
    first: usize,
) -> Result<()> {
    let rows: u64 = tasks.iter().map(|t| t.rows).sum();
    let validity = buffer
        .validity_mut()
        .ok_or_else(|| Error::InvalidBuffer("nullable field without a validity buffer".to_string()))?;
    let chunks = split_rows(&mut validity[first..first + rows as usize], tasks, 1);
    let is_attribute = matches!(info.kind, FieldKind::Attribute(_));
    tasks.par_iter().zip(chunks).for_each(|(task, chunk)| {
        let slab = &slabs[task.slab];
        let source = if is_attribute { cache.get(&slab.key()) } else { None };
        copy_validity_task(source, slab.tile, task, chunk);
    });
    Ok(())
}

fn copy_fixed_field<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &[u64],
    field: &mut OutputField,
    base_cells: u64,
) -> Result<()> {
    let OutputField { name, info, buffer } = field;
    let (name, info) = (name.as_str(), *info);
    let cell_size = info.cell_size();
    let is_attribute = matches!(info.kind, FieldKind::Attribute(_));
    let mut row = 0;
    for range in batches(ctx, slabs, lengths, is_attribute.then_some(name))? {
        let cache = if is_attribute {
            load_tiles(ctx, slabs, range.clone(), name)?
        } else {
            TileCache::new()
        };
        let tasks = copy_tasks(ctx, slabs, lengths, range, row);
        let rows: u64 = tasks.iter().map(|t| t.rows).sum();
        let first = (base_cells + row) as usize;

        let data = &mut buffer.data_mut()[first * cell_size..(first + rows as usize) * cell_size];
        let chunks = split_rows(data, &tasks, cell_size);
        tasks
            .par_iter()
            .zip(chunks)
            .try_for_each(|(task, chunk)| -> Result<()> {
                let slab = &slabs[task.slab];
                let src = FixedSource::resolve(name, &info, slab, &cache)?;
                copy_fixed_task(&src, slab.tile, task, cell_size, chunk);
                Ok(())
            })?;

        if info.nullable {
            copy_validity(slabs, &tasks, &info, &cache, buffer, first)?;
        }
        row += rows;
    }
    Ok(())
}

fn var_source<'a, T: SlabTile>(
    name: &str,
    info: &FieldInfo,
    slab: &Slab<'a, T>,
    cache: &'a TileCache,
) -> Result<&'a TileTuple> {
    match info.kind {
        FieldKind::Dimension(d) => slab
            .tile
            .result_tile()
            .coord_tile(d)
            .ok_or_else(|| Error::Internal(format!("var dimension {name} is stored zipped"))),
        FieldKind::Attribute(_) => cache
            .get(&slab.key())
            .ok_or_else(|| missing_tile(name, slab.key())),
        _ => Err(Error::Internal(format!("{name} is not a var-sized field"))),
    }
}

fn write_offset(offsets: &mut [u8], slot: usize, offset_size: usize, value: u64) -> Result<()> {
    let dst = &mut offsets[slot * offset_size..(slot + 1) * offset_size];
    if offset_size == 4 {
        let value = u32::try_from(value).map_err(|_| {
            Error::InvalidBuffer(format!(
                "offset {value} does not fit 32-bit offsets, use 64-bit offsets"
            ))
        })?;
        dst.copy_from_slice(&value.to_le_bytes());
    } else {
        dst.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

fn offsets_scale(ctx: &ReadContext, info: &FieldInfo) -> u64 {
    match ctx.config.offsets_mode {
        OffsetsMode::Bytes => 1,
        OffsetsMode::Elements => info.datatype.size() as u64,
    }
}

/// Copy a var field in two passes: sizes, then bytes.
///
/// Returns the cumulative byte end of every copied row and whether the
/// data buffer ran out, in which case `lengths` is trimmed.
fn copy_var_field<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &mut [u64],
    field: &mut OutputField,
    base_cells: u64,
) -> Result<(Vec<u64>, bool)> {
    let OutputField { name, info, buffer } = field;
    let (name, info) = (name.as_str(), *info);
    let offset_size = ctx.config.offset_size();
    let scale = offsets_scale(ctx, &info);
    let base_data = buffer.data_size() as u64;
    let capacity = buffer.data_capacity() as u64;
    let is_attribute = matches!(info.kind, FieldKind::Attribute(_));

    let mut ends: Vec<u64> = Vec::new();
    let mut row = 0u64;
    let mut trimmed = false;
    for range in batches(ctx, slabs, lengths, is_attribute.then_some(name))? {
        let cache = if is_attribute {
            load_tiles(ctx, slabs, range.clone(), name)?
        } else {
            TileCache::new()
        };
        let tasks = copy_tasks(ctx, slabs, lengths, range.clone(), row);
        let rows: u64 = tasks.iter().map(|t| t.rows).sum();

        // Pass 1: size of every output row.
        let mut sizes = vec![0u64; rows as usize];
        let chunks = split_rows(&mut sizes, &tasks, 1);
        tasks
            .par_iter()
            .zip(chunks)
            .try_for_each(|(task, chunk)| -> Result<()> {
                let slab = &slabs[task.slab];
                let src = var_source(name, &info, slab, &cache)?;
                let mut i = 0;
                for pos in task.start..task.end {
                    let size = src.var_range(pos).len() as u64;
                    for _ in 0..slab.tile.weight(pos) {
                        chunk[i] = size;
                        i += 1;
                    }
                }
                Ok(())
            })?;

        let mut total = ends.last().copied().unwrap_or(0);
        let mut fitting = rows;
        for (i, size) in sizes.iter().enumerate() {
            if base_data + total + size > capacity {
                fitting = i as u64;
                break;
            }
            total += size;
            ends.push(total);
        }

        let tasks = if fitting < rows {
            trimmed = true;
            trim_to_cells(slabs, lengths, row + fitting);
            let tasks = copy_tasks(ctx, slabs, lengths, range, row);
            let kept: u64 = tasks.iter().map(|t| t.rows).sum();
            ends.truncate((row + kept) as usize);
            debug!(field = %name, kept_rows = row + kept, "Var data buffer full");
            tasks
        } else {
            tasks
        };
        let kept: u64 = tasks.iter().map(|t| t.rows).sum();

        let row_start = |r: u64| if r == 0 { 0 } else { ends[r as usize - 1] };
        if let Some(offsets) = buffer.offsets_mut() {
            for r in row..row + kept {
                let slot = (base_cells + r) as usize;
                write_offset(offsets, slot, offset_size, (base_data + row_start(r)) / scale)?;
            }
        }

        // Pass 2: the bytes.
        let first_byte = (base_data + row_start(row)) as usize;
        let last_byte = (base_data + row_start(row + kept)) as usize;
        let mut rest = &mut buffer.data_mut()[first_byte..last_byte];
        let mut chunks = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let len = (row_start(task.row + task.rows) - row_start(task.row)) as usize;
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            chunks.push(head);
            rest = tail;
        }
        tasks
            .par_iter()
            .zip(chunks)
            .try_for_each(|(task, chunk)| -> Result<()> {
                let slab = &slabs[task.slab];
                let src = var_source(name, &info, slab, &cache)?;
                let mut offset = 0;
                for pos in task.start..task.end {
                    let value = src.var_cell(pos);
                    for _ in 0..slab.tile.weight(pos) {
                        chunk[offset..offset + value.len()].copy_from_slice(value);
                        offset += value.len();
                    }
                }
                Ok(())
            })?;

        if info.nullable {
            copy_validity(slabs, &tasks, &info, &cache, buffer, (base_cells + row) as usize)?;
        }
        row += kept;
        if trimmed {
            break;
        }
    }
    Ok((ends, trimmed))
}

/// Set used sizes of a var field for `cells` rows holding `bytes` of data
/// written this round, writing the extra offset when configured.
fn finish_var_field(
    ctx: &ReadContext,
    field: &mut OutputField,
    cells: u64,
    bytes: u64,
    validity: usize,
) -> Result<()> {
    let offset_size = ctx.config.offset_size();
    let data = field.buffer.data_size() + bytes as usize;
    let mut offsets = cells as usize * offset_size;
    if ctx.config.offsets_extra_element {
        let scale = offsets_scale(ctx, &field.info);
        if let Some(buf) = field.buffer.offsets_mut() {
            write_offset(buf, cells as usize, offset_size, data as u64 / scale)?;
        }
        offsets += offset_size;
    }
    field.buffer.set_sizes(data, offsets, validity);
    Ok(())
}

/// Value of an aggregated field at `pos`, `None` when null.
fn aggregate_value<'a, T: SlabTile>(
    info: &FieldInfo,
    slab: &Slab<'a, T>,
    cache: &'a TileCache,
    pos: u64,
) -> Option<&'a [u8]> {
    match info.kind {
        FieldKind::Dimension(d) => Some(slab.tile.result_tile().coord(pos, d)),
        FieldKind::Attribute(_) => {
            let tile = cache.get(&slab.key())?;
            if !tile.is_valid(pos) {
                None
            } else if info.var {
                Some(tile.var_cell(pos))
            } else {
                Some(tile.fixed_cell(pos, info.cell_size()))
            }
        }
        _ => None,
    }
}

/// Fold the copied cells into the aggregates, one pass per field.
fn aggregate<T: SlabTile>(
    ctx: &ReadContext,
    slabs: &[Slab<'_, T>],
    lengths: &[u64],
    aggregates: &mut [(String, Box<dyn Aggregator>)],
) -> Result<()> {
    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    for (i, (_, agg)) in aggregates.iter().enumerate() {
        let field = agg.field().map(str::to_string);
        match groups.iter_mut().find(|(f, _)| *f == field) {
            Some((_, members)) => members.push(i),
            None => groups.push((field, vec![i])),
        }
    }

    for (field, members) in groups {
        let info = field.as_deref().map(|f| ctx.schema.field(f)).transpose()?;
        let load = info.is_some_and(|i| matches!(i.kind, FieldKind::Attribute(_)));
        let load_field = if load { field.as_deref() } else { None };
        let mut row = 0;
        for range in batches(ctx, slabs, lengths, load_field)? {
            let cache = match load_field {
                Some(name) => load_tiles(ctx, slabs, range.clone(), name)?,
                None => TileCache::new(),
            };
            let tasks = copy_tasks(ctx, slabs, lengths, range, row);
            row += tasks.iter().map(|t| t.rows).sum::<u64>();

            let aggs = &*aggregates;
            let partials = tasks
                .par_iter()
                .map(|task| -> Result<Vec<Box<dyn Aggregator>>> {
                    let slab = &slabs[task.slab];
                    let mut parts: Vec<Box<dyn Aggregator>> =
                        members.iter().map(|&i| aggs[i].1.partial()).collect();
                    for pos in task.start..task.end {
                        let weight = slab.tile.weight(pos);
                        if weight == 0 {
                            continue;
                        }
                        let value = info
                            .as_ref()
                            .and_then(|info| aggregate_value(info, slab, &cache, pos));
                        for part in parts.iter_mut() {
                            part.update(value, weight)?;
                        }
                    }
                    Ok(parts)
                })
                .collect::<Result<Vec<_>>>()?;

            for parts in partials {
                for (k, part) in parts.iter().enumerate() {
                    aggregates[members[k]].1.merge(part.as_ref())?;
                }
            }
        }
    }
    Ok(())
}
