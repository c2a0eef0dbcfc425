//! Array schema: dimensions, attributes and orders.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::datatype::Datatype;
use super::{
    DELETE_CONDITION_INDEX, DELETE_TIMESTAMPS, FORMAT_VERSION, TIMESTAMPS,
    ZIPPED_COORDS_MAX_VERSION,
};
use crate::error::{Error, Result};

/// Cell or tile order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Layout {
    /// First dimension varies slowest.
    #[default]
    RowMajor,
    /// Last dimension varies slowest.
    ColMajor,
    /// Hilbert curve over the normalized domain. Cell order only.
    Hilbert,
}

/// A dimension of the array domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name.
    pub name: String,
    /// Coordinate datatype.
    pub datatype: Datatype,
    /// Inclusive domain bounds. Strings have none.
    pub domain: Option<[f64; 2]>,
    /// Space tile width. Strings have none.
    pub tile_extent: Option<f64>,
}

impl Dimension {
    /// Create a fixed-size dimension over `[lo, hi]`.
    pub fn new(name: impl Into<String>, datatype: Datatype, domain: [f64; 2]) -> Self {
        Self {
            name: name.into(),
            datatype,
            domain: Some(domain),
            tile_extent: None,
        }
    }

    /// Create a variable-sized string dimension.
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype: Datatype::StringAscii,
            domain: None,
            tile_extent: None,
        }
    }

    /// Set the space tile width.
    pub fn with_tile_extent(mut self, extent: f64) -> Self {
        self.tile_extent = Some(extent);
        self
    }

    /// Whether coordinates are variable-sized.
    pub fn is_var(&self) -> bool {
        self.datatype.is_string()
    }

    /// Fixed coordinate size, `None` for var dimensions.
    pub fn coord_size(&self) -> Option<usize> {
        if self.is_var() {
            None
        } else {
            Some(self.datatype.size())
        }
    }

    /// Index of the space tile holding `coord`. Zero without a tile extent.
    pub fn tile_index(&self, coord: &[u8]) -> u64 {
        match (self.tile_extent, self.domain) {
            (Some(extent), Some([lo, _])) if extent > 0.0 => {
                let offset = match (self.datatype.to_i128(coord), lo.fract() == 0.0) {
                    (Some(v), true) => (v - lo as i128) as f64,
                    _ => self.datatype.to_f64(coord) - lo,
                };
                (offset / extent).floor().max(0.0) as u64
            }
            _ => 0,
        }
    }

    /// Map a coordinate into `[0, 2^bits - 1]` for Hilbert ordering.
    pub fn map_to_uint64(&self, coord: &[u8], bits: u32) -> u64 {
        let max_bucket = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        if self.is_var() {
            let mut prefix = [0u8; 8];
            let n = coord.len().min(8);
            prefix[..n].copy_from_slice(&coord[..n]);
            let v = u64::from_be_bytes(prefix);
            return if bits >= 64 { v } else { v >> (64 - bits) };
        }
        let [lo, hi] = self.domain.unwrap_or([0.0, 1.0]);
        let span = hi - lo;
        if span <= 0.0 {
            return 0;
        }
        let norm = ((self.datatype.to_f64(coord) - lo) / span).clamp(0.0, 1.0);
        (norm * max_bucket as f64) as u64
    }
}

/// An attribute stored alongside every cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Value datatype.
    pub datatype: Datatype,
    /// Cells hold a variable number of values.
    pub var: bool,
    /// Cells may be null.
    pub nullable: bool,
}

impl Attribute {
    /// A fixed-size, non-nullable attribute.
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            var: datatype.is_string(),
            nullable: false,
        }
    }

    /// A variable-sized attribute.
    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            var: true,
            ..Self::new(name, datatype)
        }
    }

    /// Mark the attribute nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// What a field name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Dimension(usize),
    Attribute(usize),
    /// Per-cell write timestamp.
    Timestamps,
    /// Timestamp of the delete that covers the cell.
    DeleteTimestamps,
    /// Index of the delete condition that covers the cell.
    DeleteConditionIndex,
}

/// Resolved field description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub kind: FieldKind,
    pub datatype: Datatype,
    pub var: bool,
    pub nullable: bool,
}

impl FieldInfo {
    /// Bytes per cell for fixed fields.
    pub fn cell_size(&self) -> usize {
        self.datatype.size()
    }

    /// Whether the field is one of the reserved `__` fields.
    pub fn is_special(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Timestamps | FieldKind::DeleteTimestamps | FieldKind::DeleteConditionIndex
        )
    }
}

/// Array schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    /// Dimensions in declaration order.
    pub dimensions: Vec<Dimension>,
    /// Attributes in declaration order.
    pub attributes: Vec<Attribute>,
    /// Order of cells inside a space tile.
    pub cell_order: Layout,
    /// Order of space tiles.
    pub tile_order: Layout,
    /// Whether several cells may share coordinates.
    pub allows_dups: bool,
    /// Format version the array was created with.
    pub version: u32,
}

impl ArraySchema {
    /// Create an empty schema with the given cell order.
    pub fn new(cell_order: Layout) -> Self {
        Self {
            dimensions: Vec::new(),
            attributes: Vec::new(),
            cell_order,
            tile_order: Layout::RowMajor,
            allows_dups: false,
            version: FORMAT_VERSION,
        }
    }

    /// Add a dimension.
    pub fn with_dimension(mut self, dim: Dimension) -> Self {
        self.dimensions.push(dim);
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Set the tile order.
    pub fn with_tile_order(mut self, order: Layout) -> Self {
        self.tile_order = order;
        self
    }

    /// Allow duplicate coordinates.
    pub fn with_allows_dups(mut self, allows: bool) -> Self {
        self.allows_dups = allows;
        self
    }

    /// Set the format version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// Whether coordinates of this schema version are stored zipped.
    pub fn zipped_coords(&self) -> bool {
        self.version <= ZIPPED_COORDS_MAX_VERSION
    }

    /// Size of one zipped coordinate tuple.
    pub fn coords_size(&self) -> usize {
        self.dimensions
            .iter()
            .map(|d| d.coord_size().unwrap_or(0))
            .sum()
    }

    /// Resolve a field name.
    pub fn field(&self, name: &str) -> Result<FieldInfo> {
        let special = |kind| FieldInfo {
            kind,
            datatype: Datatype::UInt64,
            var: false,
            nullable: false,
        };
        match name {
            TIMESTAMPS => return Ok(special(FieldKind::Timestamps)),
            DELETE_TIMESTAMPS => return Ok(special(FieldKind::DeleteTimestamps)),
            DELETE_CONDITION_INDEX => return Ok(special(FieldKind::DeleteConditionIndex)),
            _ => {}
        }
        if let Some(i) = self.dimensions.iter().position(|d| d.name == name) {
            let dim = &self.dimensions[i];
            return Ok(FieldInfo {
                kind: FieldKind::Dimension(i),
                datatype: dim.datatype,
                var: dim.is_var(),
                nullable: false,
            });
        }
        if let Some(i) = self.attributes.iter().position(|a| a.name == name) {
            let attr = &self.attributes[i];
            return Ok(FieldInfo {
                kind: FieldKind::Attribute(i),
                datatype: attr.datatype,
                var: attr.var,
                nullable: attr.nullable,
            });
        }
        Err(Error::UnknownField(name.to_string()))
    }

    /// Check the schema is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(Error::Config("schema has no dimensions".into()));
        }
        if self.tile_order == Layout::Hilbert {
            return Err(Error::Config("Hilbert is a cell order only".into()));
        }
        let mut names = HashSet::new();
        for name in self
            .dimensions
            .iter()
            .map(|d| &d.name)
            .chain(self.attributes.iter().map(|a| &a.name))
        {
            if name.starts_with("__") {
                return Err(Error::Config(format!("field name {name} is reserved")));
            }
            if !names.insert(name.as_str()) {
                return Err(Error::Config(format!("duplicate field name {name}")));
            }
        }
        for dim in &self.dimensions {
            if dim.is_var() && dim.tile_extent.is_some() {
                return Err(Error::Config(format!(
                    "string dimension {} cannot have a tile extent",
                    dim.name
                )));
            }
            if !dim.is_var() && dim.domain.is_none() {
                return Err(Error::Config(format!("dimension {} has no domain", dim.name)));
            }
        }
        if self.zipped_coords() && self.dimensions.iter().any(|d| d.is_var()) {
            return Err(Error::Config(
                "zipped coordinates require fixed-size dimensions".into(),
            ));
        }
        Ok(())
    }
}
