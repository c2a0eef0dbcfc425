//! Cell and tile comparators.

use std::cmp::Ordering;
use std::sync::Arc;

use super::hilbert::Hilbert;
use crate::schema::{ArraySchema, Layout};
use crate::subarray::CoordRange;

/// Anything that exposes per-dimension coordinates.
pub trait CellCoords {
    /// Raw coordinate bytes of dimension `dim`.
    fn coord(&self, dim: usize) -> &[u8];

    /// Precomputed Hilbert value. Only consulted under Hilbert cell order.
    fn hilbert(&self) -> u64 {
        0
    }
}

/// Lower corner of a tile's bounding box.
#[derive(Debug, Clone)]
pub struct MbrLowerCorner<'a> {
    mbr: &'a [CoordRange],
    hilbert: u64,
}

impl<'a> MbrLowerCorner<'a> {
    pub fn new(mbr: &'a [CoordRange], hilbert: u64) -> Self {
        Self { mbr, hilbert }
    }
}

impl CellCoords for MbrLowerCorner<'_> {
    fn coord(&self, dim: usize) -> &[u8] {
        &self.mbr[dim].start
    }

    fn hilbert(&self) -> u64 {
        self.hilbert
    }
}

/// Global order of an array: space tile order, then cell order.
///
/// Under Hilbert cell order tiles play no part; cells are ordered by their
/// Hilbert value and ties fall back to row-major coordinates.
#[derive(Debug, Clone)]
pub struct GlobalOrder {
    schema: Arc<ArraySchema>,
    cell_dims: Vec<usize>,
    tile_dims: Vec<usize>,
    use_space_tiles: bool,
    hilbert: Option<Hilbert>,
}

impl GlobalOrder {
    /// Build the comparator for a schema.
    pub fn new(schema: Arc<ArraySchema>) -> Self {
        let n = schema.dim_num();
        let ordered = |layout: Layout| -> Vec<usize> {
            match layout {
                Layout::ColMajor => (0..n).rev().collect(),
                _ => (0..n).collect(),
            }
        };
        let hilbert = (schema.cell_order == Layout::Hilbert).then(|| Hilbert::new(n));
        let use_space_tiles = hilbert.is_none()
            && schema.dimensions.iter().any(|d| d.tile_extent.is_some());
        Self {
            cell_dims: ordered(schema.cell_order),
            tile_dims: ordered(schema.tile_order),
            use_space_tiles,
            hilbert,
            schema,
        }
    }

    /// Cell layout this comparator implements.
    pub fn cell_order(&self) -> Layout {
        self.schema.cell_order
    }

    /// Whether the order is Hilbert.
    pub fn is_hilbert(&self) -> bool {
        self.hilbert.is_some()
    }

    /// Hilbert value for a cell. Zero unless the order is Hilbert.
    pub fn hilbert_value<C: CellCoords + ?Sized>(&self, cell: &C) -> u64 {
        let Some(hilbert) = self.hilbert else {
            return 0;
        };
        let axes: Vec<u64> = self
            .schema
            .dimensions
            .iter()
            .enumerate()
            .map(|(d, dim)| dim.map_to_uint64(cell.coord(d), hilbert.bits()))
            .collect();
        hilbert.index(&axes)
    }

    /// Full global-order comparison.
    pub fn compare<A, B>(&self, a: &A, b: &B) -> Ordering
    where
        A: CellCoords + ?Sized,
        B: CellCoords + ?Sized,
    {
        if self.hilbert.is_some() {
            return a
                .hilbert()
                .cmp(&b.hilbert())
                .then_with(|| self.compare_dims(a, b, 0..self.schema.dim_num(), false));
        }
        self.compare_space_tiles(a, b)
            .then_with(|| self.compare_dims(a, b, self.cell_dims.iter().copied(), false))
    }

    /// Whether two cells have identical coordinates.
    pub fn same_coords<A, B>(&self, a: &A, b: &B) -> bool
    where
        A: CellCoords + ?Sized,
        B: CellCoords + ?Sized,
    {
        (0..self.schema.dim_num()).all(|d| a.coord(d) == b.coord(d))
    }

    /// Compare at tile granularity, stopping at the first var dimension.
    ///
    /// `Equal` means the order cannot be decided from fixed dimensions
    /// alone. Used both to order tiles by their lower corners and to check
    /// a cell against the lower bound of a tile that is not loaded yet.
    pub fn compare_bounded<A, B>(&self, a: &A, b: &B) -> Ordering
    where
        A: CellCoords + ?Sized,
        B: CellCoords + ?Sized,
    {
        if self.hilbert.is_some() {
            return a
                .hilbert()
                .cmp(&b.hilbert())
                .then_with(|| self.compare_dims(a, b, 0..self.schema.dim_num(), true));
        }
        self.compare_space_tiles(a, b)
            .then_with(|| self.compare_dims(a, b, self.cell_dims.iter().copied(), true))
    }

    /// MBR comparator: orders tiles by their lower corners.
    pub fn compare_mbrs(&self, a: &MbrLowerCorner<'_>, b: &MbrLowerCorner<'_>) -> Ordering {
        self.compare_bounded(a, b)
    }

    /// Whether `cell` is provably before every cell of a tile with the
    /// given lower corner. Never true under Hilbert order, where a bounding
    /// box does not bound Hilbert values.
    pub fn precedes_tile<C: CellCoords + ?Sized>(&self, cell: &C, lower: &MbrLowerCorner<'_>) -> bool {
        self.hilbert.is_none() && self.compare_bounded(cell, lower) == Ordering::Less
    }

    fn compare_space_tiles<A, B>(&self, a: &A, b: &B) -> Ordering
    where
        A: CellCoords + ?Sized,
        B: CellCoords + ?Sized,
    {
        if !self.use_space_tiles {
            return Ordering::Equal;
        }
        for &d in &self.tile_dims {
            let dim = &self.schema.dimensions[d];
            let ord = dim.tile_index(a.coord(d)).cmp(&dim.tile_index(b.coord(d)));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn compare_dims<A, B>(
        &self,
        a: &A,
        b: &B,
        dims: impl Iterator<Item = usize>,
        stop_at_var: bool,
    ) -> Ordering
    where
        A: CellCoords + ?Sized,
        B: CellCoords + ?Sized,
    {
        for d in dims {
            let dim = &self.schema.dimensions[d];
            if stop_at_var && dim.is_var() {
                return Ordering::Equal;
            }
            let ord = dim.datatype.compare(a.coord(d), b.coord(d));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
