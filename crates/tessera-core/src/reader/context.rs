//! Immutable inputs shared by every round of a read.

use std::sync::Arc;

use tracing::{debug, info};

use super::budget::MemoryLedger;
use crate::condition::{DeleteCondition, QueryCondition};
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::fragment::FragmentMetadata;
use crate::order::GlobalOrder;
use crate::schema::{ArraySchema, FieldKind, COORDS, TIMESTAMPS, ZIPPED_COORDS_MAX_VERSION};
use crate::stats::SharedReaderStats;
use crate::subarray::Subarray;
use crate::tile::TileSource;

/// What happens to a cell matched by a delete condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteHandling {
    /// Unselect it.
    Clear,
    /// Keep it and record which delete covers it.
    RecordMeta,
    /// Keep it for ordering but never emit it or older versions.
    Purge,
}

/// How duplicates and deletes are treated, derived from schema and config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadMode {
    /// Keep only the newest version of each coordinate.
    pub dedup: bool,
    pub deletes: DeleteHandling,
}

impl ReadMode {
    fn new(schema: &ArraySchema, config: &ReaderConfig) -> Self {
        let consolidation = config.consolidation_with_timestamps;
        let deletes = match (consolidation, config.purge_deleted_cells) {
            (false, _) => DeleteHandling::Clear,
            (true, false) => DeleteHandling::RecordMeta,
            (true, true) if schema.allows_dups => DeleteHandling::Clear,
            (true, true) => DeleteHandling::Purge,
        };
        Self {
            dedup: !schema.allows_dups && !consolidation,
            deletes,
        }
    }
}

/// Everything a read needs that does not change between rounds.
#[derive(Debug)]
pub struct ReadContext {
    pub(crate) schema: Arc<ArraySchema>,
    pub(crate) fragments: Vec<Arc<dyn FragmentMetadata>>,
    pub(crate) source: Arc<dyn TileSource>,
    pub(crate) config: ReaderConfig,
    pub(crate) subarray: Subarray,
    pub(crate) condition: Option<Arc<dyn QueryCondition>>,
    /// Sorted by timestamp, oldest first.
    pub(crate) delete_conditions: Vec<DeleteCondition>,
    pub(crate) order: GlobalOrder,
    pub(crate) ledger: MemoryLedger,
    pub(crate) stats: SharedReaderStats,
    pub(crate) mode: ReadMode,
    /// Fragments overlapping the read's timestamp window.
    pub(crate) included: Vec<bool>,
    /// Fragments whose cells must be filtered one by one against the window.
    pub(crate) partial_window: Vec<bool>,
    /// Attributes loaded for condition evaluation.
    pub(crate) condition_fields: Vec<String>,
    /// Attributes copied to buffers or aggregated.
    pub(crate) data_fields: Vec<String>,
}

impl ReadContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<dyn FragmentMetadata>>,
        source: Arc<dyn TileSource>,
        config: ReaderConfig,
        subarray: Subarray,
        condition: Option<Arc<dyn QueryCondition>>,
        mut delete_conditions: Vec<DeleteCondition>,
        stats: SharedReaderStats,
    ) -> Result<Self> {
        schema.validate()?;
        config.validate()?;
        subarray.validate(&schema)?;

        let (start, end) = (config.timestamp_start, config.timestamp_end);
        let mut included = Vec::with_capacity(fragments.len());
        let mut partial_window = Vec::with_capacity(fragments.len());
        for frag in &fragments {
            let (first, last) = frag.timestamp_range();
            let overlaps = first <= end && last >= start;
            included.push(overlaps);
            partial_window.push(overlaps && frag.has_timestamps() && (first < start || last > end));
            if frag.format_version() <= ZIPPED_COORDS_MAX_VERSION
                && schema.dimensions.iter().any(|d| d.is_var())
            {
                return Err(Error::Unsupported(format!(
                    "fragment {} stores zipped coordinates but the schema has var-sized dimensions",
                    frag.name()
                )));
            }
        }

        delete_conditions.sort_by_key(|d| d.timestamp);

        let mut condition_fields: Vec<String> = Vec::new();
        let all_conditions = condition
            .iter()
            .chain(delete_conditions.iter().map(|d| &d.condition));
        for cond in all_conditions {
            for name in cond.fields() {
                let info = schema.field(&name)?;
                if info.is_special() {
                    return Err(Error::Condition(format!(
                        "conditions on {name} are not supported"
                    )));
                }
                if matches!(info.kind, FieldKind::Attribute(_)) && !condition_fields.contains(&name) {
                    condition_fields.push(name);
                }
            }
        }

        let mode = ReadMode::new(&schema, &config);
        info!(
            fragments = fragments.len(),
            included = included.iter().filter(|i| **i).count(),
            dedup = mode.dedup,
            deletes = ?mode.deletes,
            "Read context created"
        );
        debug!(?condition_fields, "Condition fields");

        Ok(Self {
            order: GlobalOrder::new(Arc::clone(&schema)),
            ledger: MemoryLedger::new(&config),
            schema,
            fragments,
            source,
            config,
            subarray,
            condition,
            delete_conditions,
            stats,
            mode,
            included,
            partial_window,
            condition_fields,
            data_fields: Vec::new(),
        })
    }

    /// Attributes the read copies or aggregates.
    pub(crate) fn with_data_fields(mut self, fields: Vec<String>) -> Self {
        self.data_fields = fields;
        self
    }

    pub(crate) fn fragment_num(&self) -> usize {
        self.fragments.len()
    }

    /// Whether fragment `f` stores interleaved coordinates.
    pub(crate) fn zipped(&self, f: usize) -> bool {
        self.fragments[f].format_version() <= ZIPPED_COORDS_MAX_VERSION
    }

    /// Fields holding the coordinates (and timestamps) of fragment `f`.
    pub(crate) fn coord_fields(&self, f: usize) -> Vec<String> {
        let mut fields: Vec<String> = if self.zipped(f) {
            vec![COORDS.to_string()]
        } else {
            self.schema.dimensions.iter().map(|d| d.name.clone()).collect()
        };
        if self.fragments[f].has_timestamps() {
            fields.push(TIMESTAMPS.to_string());
        }
        fields
    }
}
