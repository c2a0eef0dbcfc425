//! Decoded tile buffers and the tile source seam.

use bytes::Bytes;

use crate::error::Result;

/// Decoded buffers of one field within one tile.
///
/// Var-sized fields keep one little-endian `u64` start offset per cell in
/// `fixed` and the concatenated values in `var`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileTuple {
    fixed: Bytes,
    var: Option<Bytes>,
    validity: Option<Bytes>,
}

impl TileTuple {
    /// A fixed-size tile.
    pub fn fixed(data: impl Into<Bytes>) -> Self {
        Self {
            fixed: data.into(),
            var: None,
            validity: None,
        }
    }

    /// A var-sized tile from cell start offsets and values.
    pub fn var(offsets: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            fixed: offsets.into(),
            var: Some(data.into()),
            validity: None,
        }
    }

    /// Attach one validity byte per cell (0 = null).
    pub fn with_validity(mut self, validity: impl Into<Bytes>) -> Self {
        self.validity = Some(validity.into());
        self
    }

    /// Fixed data, or cell offsets for var-sized fields.
    pub fn fixed_data(&self) -> &[u8] {
        &self.fixed
    }

    /// Var data, if any.
    pub fn var_data(&self) -> Option<&[u8]> {
        self.var.as_deref()
    }

    /// Validity bytes, if any.
    pub fn validity(&self) -> Option<&[u8]> {
        self.validity.as_deref()
    }

    /// Whether the tile is var-sized.
    pub fn is_var(&self) -> bool {
        self.var.is_some()
    }

    /// Bytes held by the tuple.
    pub fn size(&self) -> u64 {
        (self.fixed.len()
            + self.var.as_ref().map_or(0, |v| v.len())
            + self.validity.as_ref().map_or(0, |v| v.len())) as u64
    }

    /// Fixed bytes of cell `pos`.
    pub fn fixed_cell(&self, pos: u64, cell_size: usize) -> &[u8] {
        let start = pos as usize * cell_size;
        &self.fixed[start..start + cell_size]
    }

    /// Start offset of var cell `pos`.
    fn var_offset(&self, pos: u64) -> usize {
        let start = pos as usize * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.fixed[start..start + 8]);
        u64::from_le_bytes(buf) as usize
    }

    /// Number of var cells.
    pub fn var_cell_num(&self) -> u64 {
        (self.fixed.len() / 8) as u64
    }

    /// Byte range of var cell `pos` inside the var data.
    pub fn var_range(&self, pos: u64) -> std::ops::Range<usize> {
        let start = self.var_offset(pos);
        let end = if pos + 1 < self.var_cell_num() {
            self.var_offset(pos + 1)
        } else {
            self.var.as_ref().map_or(0, |v| v.len())
        };
        start..end
    }

    /// Var bytes of cell `pos`. Empty for fixed tiles.
    pub fn var_cell(&self, pos: u64) -> &[u8] {
        match &self.var {
            Some(data) => &data[self.var_range(pos)],
            None => &[],
        }
    }

    /// Validity of cell `pos`; tiles without validity are all valid.
    pub fn is_valid(&self, pos: u64) -> bool {
        self.validity
            .as_ref()
            .map_or(true, |v| v[pos as usize] != 0)
    }
}

/// Produces decoded tiles.
///
/// Decompression, decryption and I/O all live behind this trait. The read
/// core calls it from worker threads.
pub trait TileSource: Send + Sync + std::fmt::Debug {
    /// Read and unfilter one field of one tile.
    fn unfilter(&self, fragment: usize, tile: u64, field: &str) -> Result<TileTuple>;

    /// Read several fields of one tile.
    fn unfilter_fields(
        &self,
        fragment: usize,
        tile: u64,
        fields: &[String],
    ) -> Result<Vec<TileTuple>> {
        fields
            .iter()
            .map(|field| self.unfilter(fragment, tile, field))
            .collect()
    }
}
