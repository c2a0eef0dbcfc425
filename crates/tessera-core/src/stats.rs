//! Read statistics.
//!
//! Counters are plain atomics so worker tasks can record without locking;
//! named timers live in a concurrent map keyed by phase name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// Counters and timers collected while a query runs.
#[derive(Debug, Default)]
pub struct ReaderStats {
    rounds: AtomicU64,
    tiles_loaded: AtomicU64,
    tiles_ignored: AtomicU64,
    tiles_evicted: AtomicU64,
    tiles_unloaded: AtomicU64,
    cells_copied: AtomicU64,
    cells_deduplicated: AtomicU64,
    slabs_merged: AtomicU64,
    copy_batches: AtomicU64,
    budget_stops: AtomicU64,
    timers: DashMap<&'static str, u64>,
}

/// Shared statistics handle.
pub type SharedReaderStats = Arc<ReaderStats>;

impl ReaderStats {
    /// Create an empty stats set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tiles_loaded(&self, n: u64) {
        self.tiles_loaded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_tiles_ignored(&self, n: u64) {
        self.tiles_ignored.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_tiles_evicted(&self, n: u64) {
        self.tiles_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_tiles_unloaded(&self, n: u64) {
        self.tiles_unloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_cells_copied(&self, n: u64) {
        self.cells_copied.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_dedup(&self, n: u64) {
        self.cells_deduplicated.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_slabs(&self, n: u64) {
        self.slabs_merged.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_copy_batch(&self) {
        self.copy_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_budget_stop(&self) {
        self.budget_stops.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a timer that adds its elapsed microseconds to `name` on drop.
    pub(crate) fn timer(&self, name: &'static str) -> PhaseTimer<'_> {
        PhaseTimer {
            stats: self,
            name,
            started: Instant::now(),
        }
    }

    /// Processing rounds run so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Tiles brought into memory.
    pub fn tiles_loaded(&self) -> u64 {
        self.tiles_loaded.load(Ordering::Relaxed)
    }

    /// Tiles dropped because no cell survived filtering.
    pub fn tiles_ignored(&self) -> u64 {
        self.tiles_ignored.load(Ordering::Relaxed)
    }

    /// Tiles released after being fully consumed.
    pub fn tiles_evicted(&self) -> u64 {
        self.tiles_evicted.load(Ordering::Relaxed)
    }

    /// Read-ahead tiles dropped before use to make room for a needed tile.
    pub fn tiles_unloaded(&self) -> u64 {
        self.tiles_unloaded.load(Ordering::Relaxed)
    }

    /// Result rows written to output buffers.
    pub fn cells_copied(&self) -> u64 {
        self.cells_copied.load(Ordering::Relaxed)
    }

    /// Cells discarded in favor of a newer version.
    pub fn cells_deduplicated(&self) -> u64 {
        self.cells_deduplicated.load(Ordering::Relaxed)
    }

    /// Cell slabs produced by the engines.
    pub fn slabs_merged(&self) -> u64 {
        self.slabs_merged.load(Ordering::Relaxed)
    }

    /// Attribute tile batches loaded by the copy engine.
    pub fn copy_batches(&self) -> u64 {
        self.copy_batches.load(Ordering::Relaxed)
    }

    /// Times the loader stopped because the budget was full.
    pub fn budget_stops(&self) -> u64 {
        self.budget_stops.load(Ordering::Relaxed)
    }

    /// Accumulated microseconds for a phase, if it ran.
    pub fn timer_us(&self, name: &str) -> Option<u64> {
        self.timers.get(name).map(|v| *v)
    }

    /// Snapshot of all counters as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let timers: serde_json::Map<String, serde_json::Value> = self
            .timers
            .iter()
            .map(|e| (e.key().to_string(), serde_json::Value::from(*e.value())))
            .collect();
        serde_json::json!({
            "rounds": self.rounds(),
            "tiles_loaded": self.tiles_loaded(),
            "tiles_ignored": self.tiles_ignored(),
            "tiles_evicted": self.tiles_evicted(),
            "tiles_unloaded": self.tiles_unloaded(),
            "cells_copied": self.cells_copied(),
            "cells_deduplicated": self.cells_deduplicated(),
            "slabs_merged": self.slabs_merged(),
            "copy_batches": self.copy_batches(),
            "budget_stops": self.budget_stops(),
            "timers_us": timers,
        })
    }
}

/// Guard returned by [`ReaderStats::timer`].
pub(crate) struct PhaseTimer<'a> {
    stats: &'a ReaderStats,
    name: &'static str,
    started: Instant,
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_micros() as u64;
        *self.stats.timers.entry(self.name).or_insert(0) += elapsed;
    }
}
