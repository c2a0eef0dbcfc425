//! Query and delete conditions.
//!
//! Conditions are evaluated per resident tile, before deduplication, so a
//! filtered or deleted version can never win a timestamp tie-break.

mod expr;

pub use expr::{Condition, Value};

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::reader::ResultTile;
use crate::schema::ArraySchema;

/// Evaluates a predicate over the cells of a resident tile.
pub trait QueryCondition: Send + Sync + fmt::Debug {
    /// Fields whose tiles must be loaded before evaluation.
    fn fields(&self) -> Vec<String>;

    /// One byte per cell: 1 when the cell passes, 0 otherwise.
    fn evaluate(&self, schema: &ArraySchema, tile: &ResultTile) -> Result<Vec<u8>>;
}

/// A logical delete: cells written before `timestamp` that satisfy
/// `condition` are deleted.
#[derive(Debug, Clone)]
pub struct DeleteCondition {
    /// Identifies the delete; fragments list the markers already applied.
    pub marker: String,
    /// When the delete was issued.
    pub timestamp: u64,
    /// Which cells it removes.
    pub condition: Arc<dyn QueryCondition>,
}

impl DeleteCondition {
    pub fn new(
        marker: impl Into<String>,
        timestamp: u64,
        condition: Arc<dyn QueryCondition>,
    ) -> Self {
        Self {
            marker: marker.into(),
            timestamp,
            condition,
        }
    }

    /// Whether this delete still has to be applied to a fragment.
    pub fn applies_to(&self, processed_markers: &[String]) -> bool {
        !processed_markers.iter().any(|m| m == &self.marker)
    }
}
