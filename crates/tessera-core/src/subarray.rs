//! Coordinate ranges and query subarrays.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::order::CellCoords;
use crate::schema::{ArraySchema, Datatype, FixedValue};

/// Inclusive range of raw coordinates on one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl CoordRange {
    /// Range over typed values.
    pub fn new<T: FixedValue>(start: T, end: T) -> Self {
        Self {
            start: start.to_le_vec(),
            end: end.to_le_vec(),
        }
    }

    /// Range over raw bytes.
    pub fn from_bytes(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Range over strings.
    pub fn string(start: &str, end: &str) -> Self {
        Self::from_bytes(start.as_bytes(), end.as_bytes())
    }

    /// Whether `coord` falls inside the range.
    pub fn contains(&self, datatype: Datatype, coord: &[u8]) -> bool {
        datatype.compare(coord, &self.start) != Ordering::Less
            && datatype.compare(coord, &self.end) != Ordering::Greater
    }

    /// Whether two ranges share at least one value.
    pub fn overlaps(&self, datatype: Datatype, other: &CoordRange) -> bool {
        datatype.compare(&self.start, &other.end) != Ordering::Greater
            && datatype.compare(&other.start, &self.end) != Ordering::Greater
    }

    /// Grow the range to cover `coord`.
    pub fn expand(&mut self, datatype: Datatype, coord: &[u8]) {
        if datatype.compare(coord, &self.start) == Ordering::Less {
            self.start = coord.to_vec();
        }
        if datatype.compare(coord, &self.end) == Ordering::Greater {
            self.end = coord.to_vec();
        }
    }
}

/// Ranges to read on each dimension.
///
/// A dimension without ranges is read in full. Ranges on one dimension may
/// overlap, in which case a cell covered by several ranges is returned once
/// per covering range combination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subarray {
    ranges: Vec<Vec<CoordRange>>,
}

impl Subarray {
    /// Subarray covering the whole domain.
    pub fn new(dim_num: usize) -> Self {
        Self {
            ranges: vec![Vec::new(); dim_num],
        }
    }

    /// Add a range on dimension `dim`.
    pub fn with_range(mut self, dim: usize, range: CoordRange) -> Self {
        self.add_range(dim, range);
        self
    }

    /// Add a range on dimension `dim`.
    pub fn add_range(&mut self, dim: usize, range: CoordRange) {
        if self.ranges.len() <= dim {
            self.ranges.resize(dim + 1, Vec::new());
        }
        self.ranges[dim].push(range);
    }

    /// Ranges set on `dim`.
    pub fn ranges(&self, dim: usize) -> &[CoordRange] {
        self.ranges.get(dim).map_or(&[], |r| r.as_slice())
    }

    /// Whether no range was set at all.
    pub fn is_default(&self) -> bool {
        self.ranges.iter().all(|r| r.is_empty())
    }

    /// Check ranges against the schema.
    pub fn validate(&self, schema: &ArraySchema) -> Result<()> {
        if self.ranges.len() > schema.dim_num() {
            return Err(Error::Config(format!(
                "subarray has ranges on {} dimensions, schema has {}",
                self.ranges.len(),
                schema.dim_num()
            )));
        }
        for (d, ranges) in self.ranges.iter().enumerate() {
            let dim = &schema.dimensions[d];
            for range in ranges {
                if let Some(size) = dim.coord_size() {
                    if range.start.len() != size || range.end.len() != size {
                        return Err(Error::Config(format!(
                            "range on dimension {} has the wrong value size",
                            dim.name
                        )));
                    }
                }
                if dim.datatype.compare(&range.start, &range.end) == Ordering::Greater {
                    return Err(Error::Config(format!(
                        "range on dimension {} starts after it ends",
                        dim.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether any dimension carries overlapping ranges, which makes cells
    /// selectable more than once.
    pub fn has_overlapping_ranges(&self, schema: &ArraySchema) -> bool {
        self.ranges.iter().enumerate().any(|(d, ranges)| {
            let datatype = schema.dimensions[d].datatype;
            ranges.iter().enumerate().any(|(i, a)| {
                ranges[i + 1..].iter().any(|b| a.overlaps(datatype, b))
            })
        })
    }

    /// Whether a bounding box intersects the subarray.
    pub fn overlaps_mbr(&self, schema: &ArraySchema, mbr: &[CoordRange]) -> bool {
        self.ranges.iter().enumerate().all(|(d, ranges)| {
            ranges.is_empty() || {
                let datatype = schema.dimensions[d].datatype;
                ranges.iter().any(|r| r.overlaps(datatype, &mbr[d]))
            }
        })
    }

    /// How many times the subarray selects a cell.
    pub fn cell_count<C: CellCoords + ?Sized>(&self, schema: &ArraySchema, cell: &C) -> u64 {
        let mut count = 1u64;
        for (d, ranges) in self.ranges.iter().enumerate() {
            if ranges.is_empty() {
                continue;
            }
            let datatype = schema.dimensions[d].datatype;
            let coord = cell.coord(d);
            let hits = ranges.iter().filter(|r| r.contains(datatype, coord)).count() as u64;
            if hits == 0 {
                return 0;
            }
            count = count.saturating_mul(hits);
        }
        count
    }
}
