//! Resident tiles.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::order::CellCoords;
use crate::schema::{ArraySchema, FieldInfo, FieldKind};
use crate::tile::TileTuple;

/// Coordinate buffers of a tile.
///
/// Legacy fragments interleave all dimensions in one tile; current ones
/// keep one tile per dimension. The variant is fixed when the tile is
/// created.
#[derive(Debug, Clone)]
pub enum CoordStorage {
    Zipped {
        tile: TileTuple,
        coords_size: usize,
        dim_offsets: Vec<usize>,
        dim_sizes: Vec<usize>,
    },
    Unzipped {
        tiles: Vec<TileTuple>,
        /// Fixed coordinate size per dimension, `None` for var dimensions.
        sizes: Vec<Option<usize>>,
    },
}

impl CoordStorage {
    /// Zipped storage for a schema whose dimensions are all fixed-size.
    pub fn zipped(schema: &ArraySchema, tile: TileTuple) -> Self {
        let dim_sizes: Vec<usize> = schema
            .dimensions
            .iter()
            .map(|d| d.datatype.size())
            .collect();
        let mut dim_offsets = Vec::with_capacity(dim_sizes.len());
        let mut offset = 0;
        for size in &dim_sizes {
            dim_offsets.push(offset);
            offset += size;
        }
        CoordStorage::Zipped {
            tile,
            coords_size: offset,
            dim_offsets,
            dim_sizes,
        }
    }

    /// One tile per dimension, in dimension order.
    pub fn unzipped(schema: &ArraySchema, tiles: Vec<TileTuple>) -> Self {
        let sizes = schema.dimensions.iter().map(|d| d.coord_size()).collect();
        CoordStorage::Unzipped { tiles, sizes }
    }

    fn coord(&self, pos: u64, dim: usize) -> &[u8] {
        match self {
            CoordStorage::Zipped {
                tile,
                coords_size,
                dim_offsets,
                dim_sizes,
            } => {
                let start = pos as usize * coords_size + dim_offsets[dim];
                &tile.fixed_data()[start..start + dim_sizes[dim]]
            }
            CoordStorage::Unzipped { tiles, sizes } => match sizes[dim] {
                Some(size) => tiles[dim].fixed_cell(pos, size),
                None => tiles[dim].var_cell(pos),
            },
        }
    }

    fn size(&self) -> u64 {
        match self {
            CoordStorage::Zipped { tile, .. } => tile.size(),
            CoordStorage::Unzipped { tiles, .. } => tiles.iter().map(|t| t.size()).sum(),
        }
    }
}

/// One physical tile of one fragment, with the buffers loaded so far.
#[derive(Debug, Clone)]
pub struct ResultTile {
    frag_idx: usize,
    tile_idx: u64,
    cell_num: u64,
    fragment_timestamp: u64,
    coords: CoordStorage,
    timestamps: Option<TileTuple>,
    fields: HashMap<String, TileTuple>,
}

impl ResultTile {
    /// A tile whose coordinates are loaded.
    pub fn new(
        frag_idx: usize,
        tile_idx: u64,
        cell_num: u64,
        fragment_timestamp: u64,
        coords: CoordStorage,
    ) -> Self {
        Self {
            frag_idx,
            tile_idx,
            cell_num,
            fragment_timestamp,
            coords,
            timestamps: None,
            fields: HashMap::new(),
        }
    }

    /// Attach per-cell timestamps.
    pub fn with_timestamps(mut self, timestamps: TileTuple) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    pub fn frag_idx(&self) -> usize {
        self.frag_idx
    }

    pub fn tile_idx(&self) -> u64 {
        self.tile_idx
    }

    /// Number of physical cells.
    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    /// Raw coordinate of cell `pos` on dimension `dim`.
    pub fn coord(&self, pos: u64, dim: usize) -> &[u8] {
        self.coords.coord(pos, dim)
    }

    /// The tile of dimension `dim`, `None` for zipped coordinates.
    pub fn coord_tile(&self, dim: usize) -> Option<&TileTuple> {
        match &self.coords {
            CoordStorage::Zipped { .. } => None,
            CoordStorage::Unzipped { tiles, .. } => tiles.get(dim),
        }
    }

    /// Whether two cells of this tile share all coordinates.
    pub fn same_coords(&self, a: u64, b: u64, dim_num: usize) -> bool {
        (0..dim_num).all(|d| self.coord(a, d) == self.coord(b, d))
    }

    /// Whether a cell of this tile and one of `other` share all coordinates.
    pub fn same_coords_as(&self, pos: u64, other: &ResultTile, other_pos: u64, dim_num: usize) -> bool {
        (0..dim_num).all(|d| self.coord(pos, d) == other.coord(other_pos, d))
    }

    /// Whether cells carry their own timestamps.
    pub fn has_timestamps(&self) -> bool {
        self.timestamps.is_some()
    }

    /// Write timestamp of cell `pos`: its own, or the fragment's.
    pub fn timestamp(&self, pos: u64) -> u64 {
        match &self.timestamps {
            Some(ts) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(ts.fixed_cell(pos, 8));
                u64::from_le_bytes(buf)
            }
            None => self.fragment_timestamp,
        }
    }

    /// Attach a field tile.
    pub fn set_field(&mut self, name: impl Into<String>, tile: TileTuple) {
        self.fields.insert(name.into(), tile);
    }

    /// A loaded field tile.
    pub fn field(&self, name: &str) -> Option<&TileTuple> {
        self.fields.get(name)
    }

    /// Drop all field tiles, keeping coordinates and timestamps.
    pub fn clear_fields(&mut self) {
        self.fields.clear();
    }

    /// Bytes held by the tile's buffers.
    pub fn size(&self) -> u64 {
        self.coords.size()
            + self.timestamps.as_ref().map_or(0, |t| t.size())
            + self.fields.values().map(|t| t.size()).sum::<u64>()
    }

    /// Value of `field` at `pos`, `None` when null.
    ///
    /// Attribute tiles must have been attached with [`ResultTile::set_field`].
    pub fn cell_value(&self, name: &str, info: &FieldInfo, pos: u64) -> Result<Option<&[u8]>> {
        match info.kind {
            FieldKind::Dimension(d) => Ok(Some(self.coord(pos, d))),
            FieldKind::Attribute(_) => {
                let tile = self.field(name).ok_or_else(|| {
                    Error::Internal(format!(
                        "field {name} is not loaded for tile {} of fragment {}",
                        self.tile_idx, self.frag_idx
                    ))
                })?;
                if !tile.is_valid(pos) {
                    return Ok(None);
                }
                Ok(Some(if info.var {
                    tile.var_cell(pos)
                } else {
                    tile.fixed_cell(pos, info.cell_size())
                }))
            }
            _ => Err(Error::Unsupported(format!(
                "field {name} cannot be read from a result tile"
            ))),
        }
    }
}

/// A cell of a resident tile, viewed through [`CellCoords`].
#[derive(Debug, Clone, Copy)]
pub struct CellView<'a> {
    pub tile: &'a ResultTile,
    pub pos: u64,
    pub hilbert: u64,
}

impl<'a> CellView<'a> {
    pub fn new(tile: &'a ResultTile, pos: u64) -> Self {
        Self { tile, pos, hilbert: 0 }
    }
}

impl CellCoords for CellView<'_> {
    fn coord(&self, dim: usize) -> &[u8] {
        self.tile.coord(self.pos, dim)
    }

    fn hilbert(&self) -> u64 {
        self.hilbert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{encode_values, Attribute, Datatype, Dimension, Layout};

    fn schema() -> ArraySchema {
        ArraySchema::new(Layout::RowMajor)
            .with_dimension(Dimension::new("x", Datatype::Int32, [0.0, 10.0]))
            .with_dimension(Dimension::new("y", Datatype::Int32, [0.0, 10.0]))
            .with_attribute(Attribute::new("a", Datatype::Int64).nullable())
    }

    #[test]
    fn test_zipped_and_unzipped_agree() {
        let schema = schema();
        let zipped = CoordStorage::zipped(
            &schema,
            TileTuple::fixed(encode_values(&[1i32, 2, 3, 4])),
        );
        let unzipped = CoordStorage::unzipped(
            &schema,
            vec![
                TileTuple::fixed(encode_values(&[1i32, 3])),
                TileTuple::fixed(encode_values(&[2i32, 4])),
            ],
        );
        let a = ResultTile::new(0, 0, 2, 7, zipped);
        let b = ResultTile::new(0, 0, 2, 7, unzipped);
        for pos in 0..2 {
            for dim in 0..2 {
                assert_eq!(a.coord(pos, dim), b.coord(pos, dim));
            }
        }
        assert_eq!(a.coord(1, 1), &4i32.to_le_bytes());
        assert!(a.same_coords_as(1, &b, 1, 2));
        assert!(!a.same_coords(0, 1, 2));
    }

    #[test]
    fn test_timestamps_fall_back_to_fragment() {
        let schema = schema();
        let coords = CoordStorage::zipped(&schema, TileTuple::fixed(encode_values(&[1i32, 2])));
        let tile = ResultTile::new(0, 0, 1, 42, coords.clone());
        assert_eq!(tile.timestamp(0), 42);
        let tile = ResultTile::new(0, 0, 1, 42, coords)
            .with_timestamps(TileTuple::fixed(encode_values(&[99u64])));
        assert_eq!(tile.timestamp(0), 99);
        assert!(tile.has_timestamps());
    }

    #[test]
    fn test_cell_value() {
        let schema = schema();
        let coords = CoordStorage::zipped(&schema, TileTuple::fixed(encode_values(&[1i32, 2, 3, 4])));
        let mut tile = ResultTile::new(0, 0, 2, 1, coords);
        let info = schema.field("a").unwrap();
        assert!(tile.cell_value("a", &info, 0).is_err());

        tile.set_field(
            "a",
            TileTuple::fixed(encode_values(&[5i64, 6])).with_validity(vec![1u8, 0]),
        );
        assert_eq!(tile.cell_value("a", &info, 0).unwrap(), Some(&5i64.to_le_bytes()[..]));
        assert_eq!(tile.cell_value("a", &info, 1).unwrap(), None);

        let x = schema.field("x").unwrap();
        assert_eq!(tile.cell_value("x", &x, 1).unwrap(), Some(&3i32.to_le_bytes()[..]));
        tile.clear_fields();
        assert!(tile.field("a").is_none());
    }
}
