//! In-memory fragments.
//!
//! `MemFragment` keeps already-decoded tiles in memory and serves them
//! through [`MemTileSource`]. It is the reference embedding of the metadata
//! and tile source traits and what tests and benchmarks read from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::FragmentMetadata;
use crate::error::{Error, Result};
use crate::order::{CellCoords, GlobalOrder};
use crate::schema::{
    encode_values, ArraySchema, FieldKind, FixedValue, COORDS, TIMESTAMPS,
};
use crate::subarray::CoordRange;
use crate::tile::{TileSource, TileTuple};

#[derive(Debug)]
struct MemTile {
    cell_num: u64,
    mbr: Vec<CoordRange>,
    fields: HashMap<String, TileTuple>,
}

/// A fragment held entirely in memory.
#[derive(Debug)]
pub struct MemFragment {
    name: String,
    version: u32,
    timestamp_range: (u64, u64),
    has_timestamps: bool,
    tiles: Vec<MemTile>,
    non_empty_domain: Vec<CoordRange>,
    delete_markers: Vec<String>,
    offsets_loaded: AtomicBool,
}

impl MemFragment {
    /// Decoded tile of `field`, if the fragment stores it.
    pub fn tile(&self, tile: u64, field: &str) -> Option<&TileTuple> {
        self.tiles.get(tile as usize)?.fields.get(field)
    }

    /// Total number of cells.
    pub fn total_cells(&self) -> u64 {
        self.tiles.iter().map(|t| t.cell_num).sum()
    }
}

impl FragmentMetadata for MemFragment {
    fn name(&self) -> &str {
        &self.name
    }

    fn format_version(&self) -> u32 {
        self.version
    }

    fn timestamp_range(&self) -> (u64, u64) {
        self.timestamp_range
    }

    fn has_timestamps(&self) -> bool {
        self.has_timestamps
    }

    fn tile_num(&self) -> u64 {
        self.tiles.len() as u64
    }

    fn cell_num(&self, tile: u64) -> u64 {
        self.tiles.get(tile as usize).map_or(0, |t| t.cell_num)
    }

    fn mbr(&self, tile: u64) -> &[CoordRange] {
        self.tiles
            .get(tile as usize)
            .map_or(&[], |t| t.mbr.as_slice())
    }

    fn non_empty_domain(&self) -> &[CoordRange] {
        &self.non_empty_domain
    }

    fn delete_condition_markers(&self) -> &[String] {
        &self.delete_markers
    }

    fn tile_offsets_size(&self, fields: &[String]) -> u64 {
        let Some(first) = self.tiles.first() else {
            return 0;
        };
        // One u64 per tile for each stored buffer of the field.
        fields
            .iter()
            .filter_map(|f| first.fields.get(f))
            .map(|t| {
                let buffers = 1 + u64::from(t.is_var()) + u64::from(t.validity().is_some());
                buffers * 8 * self.tile_num()
            })
            .sum()
    }

    fn load_tile_offsets(&self, _fields: &[String]) -> Result<()> {
        self.offsets_loaded.store(true, AtomicOrdering::Release);
        Ok(())
    }

    fn free_tile_offsets(&self) {
        self.offsets_loaded.store(false, AtomicOrdering::Release);
    }

    fn tile_offsets_loaded(&self) -> bool {
        self.offsets_loaded.load(AtomicOrdering::Acquire)
    }

    fn tile_size(&self, field: &str, tile: u64) -> Result<u64> {
        if !self.tile_offsets_loaded() {
            return Err(Error::Internal(format!(
                "tile offsets of fragment {} are not loaded",
                self.name
            )));
        }
        Ok(self.tile(tile, field).map_or(0, |t| t.size()))
    }
}

/// Serves tiles of in-memory fragments.
#[derive(Debug, Default)]
pub struct MemTileSource {
    fragments: Vec<Arc<MemFragment>>,
    reads: AtomicU64,
}

impl MemTileSource {
    /// Source over fragments, indexed by their position.
    pub fn new(fragments: Vec<Arc<MemFragment>>) -> Self {
        Self {
            fragments,
            reads: AtomicU64::new(0),
        }
    }

    /// The fragments as metadata handles, in the same order.
    pub fn metadata(&self) -> Vec<Arc<dyn FragmentMetadata>> {
        self.fragments
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn FragmentMetadata>)
            .collect()
    }

    /// Number of tiles served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(AtomicOrdering::Relaxed)
    }
}

impl TileSource for MemTileSource {
    fn unfilter(&self, fragment: usize, tile: u64, field: &str) -> Result<TileTuple> {
        let frag = self
            .fragments
            .get(fragment)
            .ok_or_else(|| Error::io(fragment, tile, field, "no such fragment"))?;
        if !frag.tile_offsets_loaded() {
            return Err(Error::io(fragment, tile, field, "tile offsets are not loaded"));
        }
        let tuple = frag
            .tile(tile, field)
            .ok_or_else(|| Error::io(fragment, tile, field, "field is not stored"))?;
        self.reads.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(tuple.clone())
    }
}

#[derive(Debug, Clone)]
struct Column {
    values: Vec<Vec<u8>>,
    validity: Option<Vec<u8>>,
}

struct Row<'a> {
    coords: Vec<&'a [u8]>,
    hilbert: u64,
}

impl CellCoords for Row<'_> {
    fn coord(&self, dim: usize) -> &[u8] {
        self.coords[dim]
    }

    fn hilbert(&self) -> u64 {
        self.hilbert
    }
}

/// Builds a [`MemFragment`] from columns.
///
/// Cells are sorted into the schema's global order (newest first among
/// identical coordinates) and cut into tiles of `tile_capacity` cells.
#[derive(Debug, Clone)]
pub struct MemFragmentBuilder {
    schema: Arc<ArraySchema>,
    name: String,
    timestamp_range: (u64, u64),
    capacity: usize,
    version: u32,
    columns: HashMap<String, Column>,
    timestamps: Option<Vec<u64>>,
    delete_markers: Vec<String>,
}

impl MemFragmentBuilder {
    /// Start a fragment written at `timestamp`.
    pub fn new(schema: Arc<ArraySchema>, name: impl Into<String>, timestamp: u64) -> Self {
        let version = schema.version;
        Self {
            schema,
            name: name.into(),
            timestamp_range: (timestamp, timestamp),
            capacity: 10_000,
            version,
            columns: HashMap::new(),
            timestamps: None,
            delete_markers: Vec::new(),
        }
    }

    /// Set the timestamp range, as a consolidated fragment has.
    pub fn timestamp_range(mut self, start: u64, end: u64) -> Self {
        self.timestamp_range = (start, end);
        self
    }

    /// Cells per tile.
    pub fn tile_capacity(mut self, cells: usize) -> Self {
        self.capacity = cells.max(1);
        self
    }

    /// Override the format version.
    pub fn format_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn column(mut self, name: &str, values: Vec<Vec<u8>>, validity: Option<Vec<u8>>) -> Self {
        self.columns
            .insert(name.to_string(), Column { values, validity });
        self
    }

    /// Fixed-size dimension coordinates.
    pub fn dim<T: FixedValue>(self, name: &str, values: &[T]) -> Self {
        self.attr(name, values)
    }

    /// String dimension coordinates.
    pub fn dim_str(self, name: &str, values: &[&str]) -> Self {
        self.attr_str(name, values)
    }

    /// Fixed-size attribute values.
    pub fn attr<T: FixedValue>(self, name: &str, values: &[T]) -> Self {
        let values = values.iter().map(|v| v.to_le_vec()).collect();
        self.column(name, values, None)
    }

    /// Nullable fixed-size attribute values.
    pub fn attr_nullable<T: FixedValue>(self, name: &str, values: &[Option<T>]) -> Self {
        let size = std::mem::size_of::<T>();
        let validity = values.iter().map(|v| u8::from(v.is_some())).collect();
        let values = values
            .iter()
            .map(|v| v.map_or_else(|| vec![0u8; size], |v| v.to_le_vec()))
            .collect();
        self.column(name, values, Some(validity))
    }

    /// Var-sized attribute values of a numeric type.
    pub fn attr_var<T: FixedValue>(self, name: &str, values: &[Vec<T>]) -> Self {
        let values = values.iter().map(|v| encode_values(v)).collect();
        self.column(name, values, None)
    }

    /// String attribute values.
    pub fn attr_str(self, name: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.as_bytes().to_vec()).collect();
        self.column(name, values, None)
    }

    /// Nullable string attribute values.
    pub fn attr_str_nullable(self, name: &str, values: &[Option<&str>]) -> Self {
        let validity = values.iter().map(|v| u8::from(v.is_some())).collect();
        let values = values
            .iter()
            .map(|v| v.map_or_else(Vec::new, |s| s.as_bytes().to_vec()))
            .collect();
        self.column(name, values, Some(validity))
    }

    /// Give every cell its own write timestamp.
    pub fn cell_timestamps(mut self, timestamps: &[u64]) -> Self {
        self.timestamps = Some(timestamps.to_vec());
        self
    }

    /// Record delete conditions already applied to the fragment.
    pub fn delete_markers(mut self, markers: Vec<String>) -> Self {
        self.delete_markers = markers;
        self
    }

    /// Sort, tile and assemble the fragment.
    pub fn build(self) -> Result<MemFragment> {
        let schema = &self.schema;
        let cell_num = self.check_columns()?;

        let order = GlobalOrder::new(Arc::clone(schema));
        let dim_columns: Vec<&Column> = schema
            .dimensions
            .iter()
            .map(|d| &self.columns[&d.name])
            .collect();
        let rows: Vec<Row<'_>> = (0..cell_num)
            .map(|i| {
                let coords: Vec<&[u8]> =
                    dim_columns.iter().map(|c| c.values[i].as_slice()).collect();
                let mut row = Row { coords, hilbert: 0 };
                row.hilbert = order.hilbert_value(&row);
                row
            })
            .collect();

        let timestamp = |i: usize| {
            self.timestamps
                .as_ref()
                .map_or(self.timestamp_range.0, |ts| ts[i])
        };
        let mut perm: Vec<usize> = (0..cell_num).collect();
        perm.sort_by(|&a, &b| {
            order
                .compare(&rows[a], &rows[b])
                .then_with(|| timestamp(b).cmp(&timestamp(a)))
        });

        if !schema.allows_dups && self.timestamps.is_none() {
            if let Some(w) = perm
                .windows(2)
                .find(|w| order.same_coords(&rows[w[0]], &rows[w[1]]))
            {
                return Err(Error::Config(format!(
                    "fragment {} writes cell {} twice",
                    self.name, w[1]
                )));
            }
        }

        let mut tiles = Vec::new();
        for chunk in perm.chunks(self.capacity) {
            tiles.push(self.build_tile(chunk, &rows)?);
        }

        let mut non_empty_domain: Vec<CoordRange> = Vec::new();
        for tile in &tiles {
            if non_empty_domain.is_empty() {
                non_empty_domain = tile.mbr.clone();
                continue;
            }
            for (d, dim) in schema.dimensions.iter().enumerate() {
                non_empty_domain[d].expand(dim.datatype, &tile.mbr[d].start);
                non_empty_domain[d].expand(dim.datatype, &tile.mbr[d].end);
            }
        }

        debug!(
            fragment = %self.name,
            cells = cell_num,
            tiles = tiles.len(),
            "Built in-memory fragment"
        );

        Ok(MemFragment {
            name: self.name,
            version: self.version,
            timestamp_range: self.timestamp_range,
            has_timestamps: self.timestamps.is_some(),
            tiles,
            non_empty_domain,
            delete_markers: self.delete_markers,
            offsets_loaded: AtomicBool::new(false),
        })
    }

    fn check_columns(&self) -> Result<usize> {
        let schema = &self.schema;
        let mut cell_num = None;
        let names = schema
            .dimensions
            .iter()
            .map(|d| &d.name)
            .chain(schema.attributes.iter().map(|a| &a.name));
        for name in names {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| Error::Config(format!("missing values for field {name}")))?;
            let info = schema.field(name)?;
            if !info.var && column.values.iter().any(|v| v.len() != info.cell_size()) {
                return Err(Error::Config(format!("values of {name} have the wrong size")));
            }
            if column.validity.is_some() && !info.nullable {
                return Err(Error::Config(format!("field {name} is not nullable")));
            }
            match cell_num {
                None => cell_num = Some(column.values.len()),
                Some(n) if n != column.values.len() => {
                    return Err(Error::Config(format!(
                        "field {name} has {} values, expected {n}",
                        column.values.len()
                    )))
                }
                _ => {}
            }
        }
        if let Some(extra) = self
            .columns
            .keys()
            .find(|name| schema.field(name).is_err())
        {
            return Err(Error::UnknownField(extra.clone()));
        }
        let cell_num = cell_num.unwrap_or(0);
        if let Some(ts) = &self.timestamps {
            if ts.len() != cell_num {
                return Err(Error::Config(format!(
                    "{} timestamps for {cell_num} cells",
                    ts.len()
                )));
            }
        }
        Ok(cell_num)
    }

    fn build_tile(&self, cells: &[usize], rows: &[Row<'_>]) -> Result<MemTile> {
        let schema = &self.schema;
        let mut fields = HashMap::new();

        let mut mbr = Vec::with_capacity(schema.dim_num());
        for (d, dim) in schema.dimensions.iter().enumerate() {
            let first = rows[cells[0]].coords[d];
            let mut range = CoordRange::from_bytes(first, first);
            for &c in &cells[1..] {
                range.expand(dim.datatype, rows[c].coords[d]);
            }
            mbr.push(range);
        }

        let zipped = self.version <= crate::schema::ZIPPED_COORDS_MAX_VERSION;
        if zipped {
            let mut data = Vec::with_capacity(cells.len() * schema.coords_size());
            for &c in cells {
                for coord in &rows[c].coords {
                    data.extend_from_slice(coord);
                }
            }
            fields.insert(COORDS.to_string(), TileTuple::fixed(data));
        }

        for (name, column) in &self.columns {
            let info = schema.field(name)?;
            if zipped && matches!(info.kind, FieldKind::Dimension(_)) {
                continue;
            }
            let mut tuple = if info.var {
                let mut offsets = Vec::with_capacity(cells.len());
                let mut data = Vec::new();
                for &c in cells {
                    offsets.push(data.len() as u64);
                    data.extend_from_slice(&column.values[c]);
                }
                TileTuple::var(encode_values(&offsets), data)
            } else {
                let mut data = Vec::with_capacity(cells.len() * info.cell_size());
                for &c in cells {
                    data.extend_from_slice(&column.values[c]);
                }
                TileTuple::fixed(data)
            };
            if let Some(validity) = &column.validity {
                let bytes: Vec<u8> = cells.iter().map(|&c| validity[c]).collect();
                tuple = tuple.with_validity(Bytes::from(bytes));
            }
            fields.insert(name.clone(), tuple);
        }

        if let Some(ts) = &self.timestamps {
            let values: Vec<u64> = cells.iter().map(|&c| ts[c]).collect();
            fields.insert(TIMESTAMPS.to_string(), TileTuple::fixed(encode_values(&values)));
        }

        Ok(MemTile {
            cell_num: cells.len() as u64,
            mbr,
            fields,
        })
    }
}
