//! Reader configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How variable-length offsets are expressed in output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetsMode {
    /// Offsets count bytes.
    #[default]
    Bytes,
    /// Offsets count values of the field's datatype.
    Elements,
}

/// Configuration for sparse reads.
///
/// The memory budget is split by ratios: coordinate tiles, condition tiles,
/// tile range lists and tile offsets each get their own ceiling. Whatever is
/// left after those are charged is available to the copy engine for
/// attribute tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Total memory budget in bytes.
    pub total_budget: u64,

    /// Share of the budget for resident coordinate tiles, bitmaps and
    /// Hilbert values.
    pub ratio_coords: f64,

    /// Share of the budget for tiles loaded to evaluate conditions.
    pub ratio_query_condition: f64,

    /// Share of the budget for per-fragment tile range lists.
    pub ratio_tile_ranges: f64,

    /// Share of the budget for fragment tile offsets.
    pub ratio_array_data: f64,

    /// Upper bound on attribute tile bytes loaded by one copy batch.
    pub tile_upper_memory_limit: u64,

    /// Load tile offsets for a window of fragments at a time.
    /// Only honored by the unordered reader.
    pub partial_tile_offsets_loading: bool,

    /// Width of var-length offsets in output buffers (32 or 64).
    pub offsets_bitsize: u8,

    /// Append the total var size as an extra offset.
    pub offsets_extra_element: bool,

    /// Bytes or elements.
    pub offsets_mode: OffsetsMode,

    /// Worker threads for parallel loops. Zero means available parallelism.
    pub concurrency: usize,

    /// Lower end of the timestamp window (inclusive).
    pub timestamp_start: u64,

    /// Upper end of the timestamp window (inclusive).
    pub timestamp_end: u64,

    /// Return every version of a coordinate, as consolidation does.
    pub consolidation_with_timestamps: bool,

    /// With consolidation, drop deleted cells instead of tagging them.
    pub purge_deleted_cells: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            total_budget: 10 * 1024 * 1024 * 1024, // 10GB
            ratio_coords: 0.5,
            ratio_query_condition: 0.25,
            ratio_tile_ranges: 0.1,
            ratio_array_data: 0.1,
            tile_upper_memory_limit: 1024 * 1024 * 1024, // 1GB
            partial_tile_offsets_loading: false,
            offsets_bitsize: 64,
            offsets_extra_element: false,
            offsets_mode: OffsetsMode::Bytes,
            concurrency: 0,
            timestamp_start: 0,
            timestamp_end: u64::MAX,
            consolidation_with_timestamps: false,
            purge_deleted_cells: false,
        }
    }
}

impl ReaderConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ReaderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Set the total budget.
    pub fn with_total_budget(mut self, bytes: u64) -> Self {
        self.total_budget = bytes;
        self
    }

    /// Set the coordinate tile ratio.
    pub fn with_ratio_coords(mut self, ratio: f64) -> Self {
        self.ratio_coords = ratio;
        self
    }

    /// Set the condition tile ratio.
    pub fn with_ratio_query_condition(mut self, ratio: f64) -> Self {
        self.ratio_query_condition = ratio;
        self
    }

    /// Set the tile ranges ratio.
    pub fn with_ratio_tile_ranges(mut self, ratio: f64) -> Self {
        self.ratio_tile_ranges = ratio;
        self
    }

    /// Set the tile offsets ratio.
    pub fn with_ratio_array_data(mut self, ratio: f64) -> Self {
        self.ratio_array_data = ratio;
        self
    }

    /// Set the per-batch tile memory limit.
    pub fn with_tile_upper_memory_limit(mut self, bytes: u64) -> Self {
        self.tile_upper_memory_limit = bytes;
        self
    }

    /// Enable or disable windowed tile offsets loading.
    pub fn with_partial_tile_offsets_loading(mut self, enabled: bool) -> Self {
        self.partial_tile_offsets_loading = enabled;
        self
    }

    /// Set the offsets width.
    pub fn with_offsets_bitsize(mut self, bits: u8) -> Self {
        self.offsets_bitsize = bits;
        self
    }

    /// Enable or disable the extra offset element.
    pub fn with_offsets_extra_element(mut self, enabled: bool) -> Self {
        self.offsets_extra_element = enabled;
        self
    }

    /// Set the offsets mode.
    pub fn with_offsets_mode(mut self, mode: OffsetsMode) -> Self {
        self.offsets_mode = mode;
        self
    }

    /// Set the worker thread count.
    pub fn with_concurrency(mut self, threads: usize) -> Self {
        self.concurrency = threads;
        self
    }

    /// Restrict the read to fragments and cells written inside `[start, end]`.
    pub fn with_timestamp_range(mut self, start: u64, end: u64) -> Self {
        self.timestamp_start = start;
        self.timestamp_end = end;
        self
    }

    /// Read every version of every cell.
    pub fn with_consolidation_with_timestamps(mut self, enabled: bool) -> Self {
        self.consolidation_with_timestamps = enabled;
        self
    }

    /// Drop deleted cells during consolidation.
    pub fn with_purge_deleted_cells(mut self, enabled: bool) -> Self {
        self.purge_deleted_cells = enabled;
        self
    }

    /// Check ratios, offsets width and the timestamp window.
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("ratio_coords", self.ratio_coords),
            ("ratio_query_condition", self.ratio_query_condition),
            ("ratio_tile_ranges", self.ratio_tile_ranges),
            ("ratio_array_data", self.ratio_array_data),
        ];
        for (name, ratio) in ratios {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::Config(format!("{name} must be in [0, 1], got {ratio}")));
            }
        }
        let sum: f64 = ratios.iter().map(|(_, r)| r).sum();
        if sum > 1.0 + f64::EPSILON {
            return Err(Error::Config(format!(
                "memory budget ratios add up to {sum}, which is more than 1"
            )));
        }
        if self.offsets_bitsize != 32 && self.offsets_bitsize != 64 {
            return Err(Error::Config(format!(
                "offsets_bitsize must be 32 or 64, got {}",
                self.offsets_bitsize
            )));
        }
        if self.timestamp_start > self.timestamp_end {
            return Err(Error::Config(format!(
                "timestamp_start {} is after timestamp_end {}",
                self.timestamp_start, self.timestamp_end
            )));
        }
        Ok(())
    }

    /// Budget for coordinate tiles.
    pub fn coords_budget(&self) -> u64 {
        ratio_of(self.total_budget, self.ratio_coords)
    }

    /// Budget for condition tiles.
    pub fn query_condition_budget(&self) -> u64 {
        ratio_of(self.total_budget, self.ratio_query_condition)
    }

    /// Budget for tile range lists.
    pub fn tile_ranges_budget(&self) -> u64 {
        ratio_of(self.total_budget, self.ratio_tile_ranges)
    }

    /// Budget for tile offsets.
    pub fn array_data_budget(&self) -> u64 {
        ratio_of(self.total_budget, self.ratio_array_data)
    }

    /// Offset width in bytes.
    pub fn offset_size(&self) -> usize {
        usize::from(self.offsets_bitsize / 8)
    }

    /// Effective worker count.
    pub fn worker_threads(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

fn ratio_of(total: u64, ratio: f64) -> u64 {
    (total as f64 * ratio) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.total_budget, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.coords_budget(), 5 * 1024 * 1024 * 1024);
        assert_eq!(config.offset_size(), 8);
        assert!(!config.partial_tile_offsets_loading);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ReaderConfig::new()
            .with_total_budget(1000)
            .with_ratio_coords(0.4)
            .with_offsets_bitsize(32)
            .with_offsets_mode(OffsetsMode::Elements)
            .with_concurrency(3);
        assert_eq!(config.coords_budget(), 400);
        assert_eq!(config.offset_size(), 4);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.offsets_mode, OffsetsMode::Elements);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ReaderConfig::from_json(r#"{"total_budget": 4096, "offsets_mode": "elements"}"#)
                .unwrap();
        assert_eq!(config.total_budget, 4096);
        assert_eq!(config.offsets_mode, OffsetsMode::Elements);
        assert_eq!(config.ratio_coords, 0.5);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"offsets_bitsize": 32, "offsets_extra_element": true}}"#).unwrap();
        let config = ReaderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.offsets_bitsize, 32);
        assert!(config.offsets_extra_element);
    }

    #[test]
    fn test_validation() {
        assert!(ReaderConfig::new().with_ratio_coords(1.5).validate().is_err());
        assert!(ReaderConfig::new().with_ratio_coords(0.9).validate().is_err());
        assert!(ReaderConfig::new().with_offsets_bitsize(16).validate().is_err());
        assert!(ReaderConfig::new()
            .with_timestamp_range(10, 5)
            .validate()
            .is_err());
        assert!(matches!(
            ReaderConfig::from_json("{not json"),
            Err(Error::Config(_))
        ));
    }
}
