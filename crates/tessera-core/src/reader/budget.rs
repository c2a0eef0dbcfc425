//! Memory budget ledger.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};

/// Bytes currently charged to each budget.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Resident coordinate tiles, bitmaps and Hilbert values.
    pub coords: u64,
    /// Tiles loaded for condition evaluation.
    pub query_condition: u64,
    /// Per-fragment tile range lists.
    pub tile_ranges: u64,
    /// Fragment tile offsets.
    pub tile_offsets: u64,
}

impl MemoryUsage {
    fn total(&self) -> u64 {
        self.coords + self.query_condition + self.tile_ranges + self.tile_offsets
    }
}

/// Tracks bytes committed against the configured budgets.
#[derive(Debug)]
pub struct MemoryLedger {
    total: u64,
    coords_budget: u64,
    query_condition_budget: u64,
    tile_ranges_budget: u64,
    array_data_budget: u64,
    usage: Mutex<MemoryUsage>,
}

impl MemoryLedger {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            total: config.total_budget,
            coords_budget: config.coords_budget(),
            query_condition_budget: config.query_condition_budget(),
            tile_ranges_budget: config.tile_ranges_budget(),
            array_data_budget: config.array_data_budget(),
            usage: Mutex::new(MemoryUsage::default()),
        }
    }

    /// Current usage.
    pub fn usage(&self) -> MemoryUsage {
        *self.usage.lock()
    }

    pub fn coords_budget(&self) -> u64 {
        self.coords_budget
    }

    pub fn query_condition_budget(&self) -> u64 {
        self.query_condition_budget
    }

    /// Fail if a single tile could never fit its budgets.
    pub fn check_tile_fits(&self, coords: u64, query_condition: u64) -> Result<()> {
        if coords > self.coords_budget || query_condition > self.query_condition_budget {
            warn!(
                coords,
                query_condition,
                coords_budget = self.coords_budget,
                query_condition_budget = self.query_condition_budget,
                "Cannot load a single tile"
            );
            return Err(Error::MemoryBudget(format!(
                "cannot load a single tile ({coords} coordinate bytes, {query_condition} \
                 condition bytes) within budgets of {} and {} bytes, increase memory budget",
                self.coords_budget, self.query_condition_budget
            )));
        }
        Ok(())
    }

    /// Whether a tile fits next to the tiles already resident.
    pub fn fits_tile(&self, coords: u64, query_condition: u64) -> bool {
        let usage = self.usage.lock();
        self.fits(&usage, coords, query_condition)
    }

    fn fits(&self, usage: &MemoryUsage, coords: u64, query_condition: u64) -> bool {
        usage.coords + coords <= self.coords_budget
            && usage.query_condition + query_condition <= self.query_condition_budget
    }

    /// Charge a tile if it fits next to the tiles already resident.
    pub fn try_reserve_tile(&self, coords: u64, query_condition: u64) -> bool {
        let mut usage = self.usage.lock();
        if !self.fits(&usage, coords, query_condition) {
            return false;
        }
        usage.coords += coords;
        usage.query_condition += query_condition;
        true
    }

    /// Return coordinate memory of an evicted tile.
    pub fn release_coords(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.coords = usage.coords.saturating_sub(bytes);
    }

    /// Return condition tile memory once conditions are applied.
    pub fn release_query_condition(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.query_condition = usage.query_condition.saturating_sub(bytes);
    }

    /// Charge tile range lists; they must fit or the read cannot start.
    pub fn reserve_tile_ranges(&self, bytes: u64) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.tile_ranges + bytes > self.tile_ranges_budget {
            return Err(Error::MemoryBudget(format!(
                "tile ranges need {bytes} bytes, budget is {} bytes, increase memory budget",
                self.tile_ranges_budget
            )));
        }
        usage.tile_ranges += bytes;
        Ok(())
    }

    /// Charge tile offsets if they fit.
    pub fn try_reserve_tile_offsets(&self, bytes: u64) -> bool {
        let mut usage = self.usage.lock();
        if usage.tile_offsets + bytes > self.array_data_budget {
            return false;
        }
        usage.tile_offsets += bytes;
        true
    }

    /// Return tile offsets memory.
    pub fn release_tile_offsets(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.tile_offsets = usage.tile_offsets.saturating_sub(bytes);
    }

    /// Bytes left for attribute tiles during copy.
    pub fn available_for_copy(&self) -> u64 {
        let usage = self.usage.lock();
        let available = self.total.saturating_sub(usage.total());
        debug!(available, ?usage, "Memory available for copy");
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> MemoryLedger {
        MemoryLedger::new(
            &ReaderConfig::new()
                .with_total_budget(1000)
                .with_ratio_coords(0.5)
                .with_ratio_query_condition(0.2)
                .with_ratio_tile_ranges(0.1)
                .with_ratio_array_data(0.1),
        )
    }

    #[test]
    fn test_reserve_and_release_tiles() {
        let ledger = ledger();
        assert!(ledger.try_reserve_tile(300, 100));
        assert!(!ledger.fits_tile(300, 0));
        assert!(ledger.fits_tile(200, 100));
        assert!(!ledger.try_reserve_tile(300, 0));
        assert!(!ledger.try_reserve_tile(100, 150));
        assert!(ledger.try_reserve_tile(200, 100));
        assert_eq!(ledger.usage().coords, 500);

        ledger.release_coords(300);
        ledger.release_query_condition(200);
        assert_eq!(ledger.usage().coords, 200);
        assert_eq!(ledger.usage().query_condition, 0);
    }

    #[test]
    fn test_single_tile_floor() {
        let ledger = ledger();
        assert!(ledger.check_tile_fits(500, 200).is_ok());
        assert!(matches!(
            ledger.check_tile_fits(501, 0),
            Err(Error::MemoryBudget(_))
        ));
        assert!(ledger.check_tile_fits(0, 201).is_err());
    }

    #[test]
    fn test_copy_budget_is_the_remainder() {
        let ledger = ledger();
        assert_eq!(ledger.available_for_copy(), 1000);
        assert!(ledger.try_reserve_tile(400, 0));
        assert!(ledger.try_reserve_tile_offsets(50));
        ledger.reserve_tile_ranges(20).unwrap();
        assert_eq!(ledger.available_for_copy(), 530);
        assert!(ledger.reserve_tile_ranges(200).is_err());
        assert!(!ledger.try_reserve_tile_offsets(51));
    }
}
