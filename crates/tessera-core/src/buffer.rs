//! User-supplied output buffers.

use crate::config::{OffsetsMode, ReaderConfig};
use crate::schema::{decode_values, FixedValue};

/// Output buffer of one field.
///
/// Capacities are fixed when the buffer is created; each submit overwrites
/// the buffer from the start and records how many bytes it used.
#[derive(Debug, Clone, Default)]
pub struct QueryBuffer {
    data: Vec<u8>,
    data_size: usize,
    offsets: Option<Vec<u8>>,
    offsets_size: usize,
    validity: Option<Vec<u8>>,
    validity_size: usize,
}

impl QueryBuffer {
    /// A buffer of `capacity` bytes for a fixed-size field.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            ..Default::default()
        }
    }

    /// A buffer holding `cells` values of `T`.
    pub fn fixed<T: FixedValue>(cells: usize) -> Self {
        Self::new(cells * std::mem::size_of::<T>())
    }

    /// A buffer for a var-sized field: offsets and data capacities in bytes.
    pub fn var(offsets_capacity: usize, data_capacity: usize) -> Self {
        Self {
            data: vec![0; data_capacity],
            offsets: Some(vec![0; offsets_capacity]),
            ..Default::default()
        }
    }

    /// Add a validity buffer with room for `cells` entries.
    pub fn with_validity(mut self, cells: usize) -> Self {
        self.validity = Some(vec![0; cells]);
        self
    }

    /// Bytes written to the data buffer.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    /// Bytes written to the offsets buffer.
    pub fn offsets(&self) -> Option<&[u8]> {
        self.offsets.as_ref().map(|o| &o[..self.offsets_size])
    }

    /// Entries written to the validity buffer.
    pub fn validity(&self) -> Option<&[u8]> {
        self.validity.as_ref().map(|v| &v[..self.validity_size])
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn offsets_size(&self) -> usize {
        self.offsets_size
    }

    pub fn validity_size(&self) -> usize {
        self.validity_size
    }

    pub fn data_capacity(&self) -> usize {
        self.data.len()
    }

    pub fn offsets_capacity(&self) -> usize {
        self.offsets.as_ref().map_or(0, |o| o.len())
    }

    pub fn validity_capacity(&self) -> usize {
        self.validity.as_ref().map_or(0, |v| v.len())
    }

    pub fn is_var(&self) -> bool {
        self.offsets.is_some()
    }

    /// Decoded fixed values.
    pub fn values<T: FixedValue>(&self) -> Vec<T> {
        decode_values(self.data())
    }

    /// Decoded offsets, including the extra element if one was written.
    pub fn offsets_u64(&self, config: &ReaderConfig) -> Vec<u64> {
        let Some(offsets) = self.offsets() else {
            return Vec::new();
        };
        match config.offset_size() {
            4 => decode_values::<u32>(offsets).into_iter().map(u64::from).collect(),
            _ => decode_values::<u64>(offsets),
        }
    }

    /// Var values as byte slices.
    ///
    /// `element_size` converts element offsets back to bytes and is ignored
    /// in byte mode.
    pub fn var_values(&self, config: &ReaderConfig, element_size: usize) -> Vec<&[u8]> {
        let scale = match config.offsets_mode {
            OffsetsMode::Bytes => 1,
            OffsetsMode::Elements => element_size as u64,
        };
        let mut offsets = self.offsets_u64(config);
        if config.offsets_extra_element {
            offsets.pop();
        }
        let data = self.data();
        offsets
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let start = (start * scale) as usize;
                let end = offsets
                    .get(i + 1)
                    .map_or(data.len(), |&next| (next * scale) as usize);
                &data[start..end]
            })
            .collect()
    }

    /// Var values decoded as UTF-8 strings.
    pub fn strings(&self, config: &ReaderConfig) -> Vec<String> {
        self.var_values(config, 1)
            .into_iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Forget previous results.
    pub(crate) fn reset(&mut self) {
        self.data_size = 0;
        self.offsets_size = 0;
        self.validity_size = 0;
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn offsets_mut(&mut self) -> Option<&mut [u8]> {
        self.offsets.as_deref_mut()
    }

    pub(crate) fn validity_mut(&mut self) -> Option<&mut [u8]> {
        self.validity.as_deref_mut()
    }

    /// Record used sizes after a copy.
    pub(crate) fn set_sizes(&mut self, data: usize, offsets: usize, validity: usize) {
        self.data_size = data;
        self.offsets_size = offsets;
        self.validity_size = validity;
    }
}
