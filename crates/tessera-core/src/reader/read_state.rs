//! Resumable position of a read.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

/// Position of the next cell to emit in one fragment.
///
/// `cell_idx` may equal the tile's cell count right after a tile is
/// consumed; eviction normalizes it to the start of the next tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragIdx {
    pub tile_idx: u64,
    pub cell_idx: u64,
}

impl FragIdx {
    pub fn new(tile_idx: u64, cell_idx: u64) -> Self {
        Self { tile_idx, cell_idx }
    }
}

/// State carried between submits.
#[derive(Debug)]
pub struct ReadState {
    frag_idx: Vec<FragIdx>,
    ignored_tiles: DashSet<(usize, u64)>,
    done_adding_result_tiles: bool,
}

impl ReadState {
    pub fn new(fragment_num: usize) -> Self {
        Self {
            frag_idx: vec![FragIdx::default(); fragment_num],
            ignored_tiles: DashSet::new(),
            done_adding_result_tiles: false,
        }
    }

    /// Committed cursors, one per fragment.
    pub fn frag_idx(&self) -> &[FragIdx] {
        &self.frag_idx
    }

    pub fn cursor(&self, f: usize) -> FragIdx {
        self.frag_idx[f]
    }

    pub(crate) fn set_cursor(&mut self, f: usize, idx: FragIdx) {
        self.frag_idx[f] = idx;
    }

    /// Record a tile with no results. Safe to call from worker threads.
    pub(crate) fn ignore_tile(&self, f: usize, t: u64) {
        self.ignored_tiles.insert((f, t));
    }

    pub fn is_ignored(&self, f: usize, t: u64) -> bool {
        self.ignored_tiles.contains(&(f, t))
    }

    pub fn ignored_tile_num(&self) -> usize {
        self.ignored_tiles.len()
    }

    pub fn done_adding_result_tiles(&self) -> bool {
        self.done_adding_result_tiles
    }

    pub(crate) fn set_done_adding_result_tiles(&mut self, done: bool) {
        self.done_adding_result_tiles = done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_cursors() {
        let mut state = ReadState::new(3);
        assert_eq!(state.cursor(2), FragIdx::default());
        state.set_cursor(1, FragIdx::new(4, 7));
        assert_eq!(state.frag_idx()[1], FragIdx::new(4, 7));
        assert!(FragIdx::new(4, 7) < FragIdx::new(5, 0));
    }

    #[test]
    fn test_ignored_tiles_from_workers() {
        let state = ReadState::new(2);
        (0..100u64).into_par_iter().for_each(|t| {
            if t % 2 == 0 {
                state.ignore_tile(1, t);
            }
        });
        assert_eq!(state.ignored_tile_num(), 50);
        assert!(state.is_ignored(1, 10));
        assert!(!state.is_ignored(1, 11));
        assert!(!state.is_ignored(0, 10));
    }
}
