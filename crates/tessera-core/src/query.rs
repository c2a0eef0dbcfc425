//! Sparse read queries.
//!
//! A [`SparseQuery`] owns the read session: output buffers, aggregates,
//! the engine picked for the layout, and the worker pool. Each
//! [`SparseQuery::submit`] overwrites the buffers with the next batch of
//! results and reports whether more remain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::aggregate::{AggregateValue, Aggregator};
use crate::buffer::QueryBuffer;
use crate::condition::{DeleteCondition, QueryCondition};
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::fragment::FragmentMetadata;
use crate::reader::{
    GlobalOrderReader, MemoryUsage, Output, OutputField, ReadContext, ReadEngine, ReadState,
    ReaderPhase, UnorderedReader,
};
use crate::schema::{ArraySchema, FieldKind, CELL_TIMESTAMPS_MIN_VERSION};
use crate::stats::{ReaderStats, SharedReaderStats};
use crate::subarray::Subarray;
use crate::tile::TileSource;

/// Order in which results are returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum QueryLayout {
    /// Tile order then cell order of the schema.
    #[default]
    GlobalOrder,
    /// Any order. Arrays without duplicates still read in global order.
    Unordered,
}

/// Where a query stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryStatus {
    /// Not submitted yet.
    Uninitialized,
    /// Buffers filled up; submit again for more.
    Incomplete,
    /// Every result was returned.
    Complete,
    /// A fatal error ended the query.
    Failed,
}

/// Cancels a running query from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Stop the query at the next round boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A read over the fragments of one sparse array.
#[derive(Debug)]
pub struct SparseQuery {
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<dyn FragmentMetadata>>,
    source: Arc<dyn TileSource>,
    config: ReaderConfig,
    subarray: Option<Subarray>,
    condition: Option<Arc<dyn QueryCondition>>,
    delete_conditions: Vec<DeleteCondition>,
    layout: QueryLayout,
    fields: Vec<OutputField>,
    aggregates: Vec<(String, Box<dyn Aggregator>)>,
    ctx: Option<Arc<ReadContext>>,
    engine: Option<Box<dyn ReadEngine>>,
    pool: Option<rayon::ThreadPool>,
    status: QueryStatus,
    failure: Option<String>,
    cancel: Arc<AtomicBool>,
    stats: SharedReaderStats,
}

impl SparseQuery {
    /// A query over `fragments`, oldest first, served by `source`.
    pub fn new(
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<dyn FragmentMetadata>>,
        source: Arc<dyn TileSource>,
    ) -> Self {
        Self {
            schema,
            fragments,
            source,
            config: ReaderConfig::default(),
            subarray: None,
            condition: None,
            delete_conditions: Vec::new(),
            layout: QueryLayout::default(),
            fields: Vec::new(),
            aggregates: Vec::new(),
            ctx: None,
            engine: None,
            pool: None,
            status: QueryStatus::Uninitialized,
            failure: None,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ReaderStats::new()),
        }
    }

    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the read to a subarray. Defaults to the whole domain.
    pub fn with_subarray(mut self, subarray: Subarray) -> Self {
        self.subarray = Some(subarray);
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn QueryCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_delete_condition(mut self, delete: DeleteCondition) -> Self {
        self.delete_conditions.push(delete);
        self
    }

    pub fn with_layout(mut self, layout: QueryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the output buffer of a field.
    ///
    /// Replacing the buffer of a field already set is allowed between
    /// submits; adding a new field after the first submit is not.
    pub fn set_buffer(&mut self, name: &str, buffer: QueryBuffer) -> Result<()> {
        let info = self.schema.field(name)?;
        if info.var && !buffer.is_var() {
            return Err(Error::InvalidBuffer(format!(
                "var-sized field {name} needs an offsets buffer"
            )));
        }
        if !info.var && buffer.is_var() {
            return Err(Error::InvalidBuffer(format!(
                "fixed-sized field {name} takes no offsets buffer"
            )));
        }
        if info.nullable != (buffer.validity_capacity() > 0) {
            return Err(Error::InvalidBuffer(if info.nullable {
                format!("nullable field {name} needs a validity buffer")
            } else {
                format!("field {name} is not nullable")
            }));
        }

        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            field.buffer = buffer;
            return Ok(());
        }
        if self.engine.is_some() {
            return Err(Error::InvalidBuffer(format!(
                "cannot add field {name} after the first submit"
            )));
        }
        self.fields.push(OutputField {
            name: name.to_string(),
            info,
            buffer,
        });
        Ok(())
    }

    /// Compute an aggregate over every result of the query.
    pub fn add_aggregate(&mut self, name: &str, mut aggregator: Box<dyn Aggregator>) -> Result<()> {
        if self.engine.is_some() {
            return Err(Error::Config(format!(
                "cannot add aggregate {name} after the first submit"
            )));
        }
        if self.aggregates.iter().any(|(n, _)| n == name) {
            return Err(Error::Config(format!("aggregate {name} already exists")));
        }
        if let Some(field) = aggregator.field() {
            let info = self.schema.field(field)?;
            aggregator.bind(&info)?;
        }
        self.aggregates.push((name.to_string(), aggregator));
        Ok(())
    }

    /// Buffer of a field, with the results of the last submit.
    pub fn buffer(&self, name: &str) -> Option<&QueryBuffer> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.buffer)
    }

    /// Current value of an aggregate.
    pub fn aggregate(&self, name: &str) -> Option<AggregateValue> {
        self.aggregates
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.value())
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Step the engine is in.
    pub fn phase(&self) -> ReaderPhase {
        self.engine.as_ref().map_or(ReaderPhase::Idle, |e| e.phase())
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Resumable position of the read, once submitted.
    pub fn read_state(&self) -> Option<&ReadState> {
        self.engine.as_ref().map(|e| e.read_state())
    }

    /// Bytes currently charged to the memory budget.
    pub fn memory_usage(&self) -> Option<MemoryUsage> {
        self.ctx.as_ref().map(|c| c.ledger.usage())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Produce the next batch of results.
    ///
    /// Returns [`QueryStatus::Incomplete`] when a buffer filled up before
    /// every result was copied. Fatal errors leave the query failed; later
    /// submits return [`Error::QueryFailed`]. A cancelled submit keeps the
    /// cells it copied before stopping and can be resumed.
    pub fn submit(&mut self) -> Result<QueryStatus> {
        if let Some(message) = &self.failure {
            return Err(Error::QueryFailed(message.clone()));
        }
        let span = info_span!("submit", layout = ?self.layout, fragments = self.fragments.len());
        let _enter = span.enter();

        match self.run() {
            Ok(status) => {
                self.status = status;
                info!(?status, cells_copied = self.stats.cells_copied(), "Submit finished");
                Ok(status)
            }
            Err(err) => {
                if err.is_fatal() {
                    warn!(error = %err, "Query failed");
                    self.failure = Some(err.to_string());
                    self.status = QueryStatus::Failed;
                }
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<QueryStatus> {
        for field in &mut self.fields {
            field.buffer.reset();
        }
        if self.engine.is_none() {
            self.init()?;
        }

        let Self {
            fields,
            aggregates,
            ctx,
            engine,
            pool,
            cancel,
            ..
        } = self;
        let (Some(ctx), Some(engine), Some(pool)) = (ctx.as_ref(), engine.as_mut(), pool.as_ref())
        else {
            return Err(Error::Internal("query engine was not initialized".to_string()));
        };

        pool.install(|| {
            let mut out = Output {
                fields: fields.as_mut_slice(),
                aggregates: aggregates.as_mut_slice(),
                cells: 0,
            };
            loop {
                if cancel.swap(false, Ordering::SeqCst) {
                    debug!(cells = out.cells, "Query cancelled");
                    return Err(Error::Cancelled);
                }
                if engine.done() {
                    return Ok(QueryStatus::Complete);
                }
                if out.max_cells(ctx) == 0 {
                    return Ok(QueryStatus::Incomplete);
                }
                let round = engine.run_round(&mut out)?;
                if round.buffers_full {
                    return Ok(if engine.done() {
                        QueryStatus::Complete
                    } else {
                        QueryStatus::Incomplete
                    });
                }
            }
        })
    }

    /// Validate the request and build the engine.
    fn init(&mut self) -> Result<()> {
        if self.fields.is_empty() && self.aggregates.is_empty() {
            return Err(Error::InvalidBuffer(
                "no buffers or aggregates were set".to_string(),
            ));
        }
        for field in &self.fields {
            match field.info.kind {
                FieldKind::Timestamps if self.schema.version < CELL_TIMESTAMPS_MIN_VERSION => {
                    return Err(Error::Unsupported(format!(
                        "timestamps cannot be read from arrays of format version {}",
                        self.schema.version
                    )));
                }
                FieldKind::DeleteTimestamps | FieldKind::DeleteConditionIndex
                    if self.layout == QueryLayout::Unordered && self.schema.allows_dups =>
                {
                    return Err(Error::Unsupported(format!(
                        "{} cannot be read in unordered layout",
                        field.name
                    )));
                }
                _ => {}
            }
        }

        let mut data_fields: Vec<String> = Vec::new();
        let names = self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.aggregates.iter().filter_map(|(_, a)| a.field()));
        for name in names {
            if matches!(self.schema.field(name)?.kind, FieldKind::Attribute(_))
                && !data_fields.iter().any(|f| f == name)
            {
                data_fields.push(name.to_string());
            }
        }

        let subarray = self
            .subarray
            .clone()
            .unwrap_or_else(|| Subarray::new(self.schema.dim_num()));
        let overlapping = subarray.has_overlapping_ranges(&self.schema);
        let ctx = Arc::new(
            ReadContext::new(
                Arc::clone(&self.schema),
                self.fragments.clone(),
                Arc::clone(&self.source),
                self.config.clone(),
                subarray,
                self.condition.clone(),
                self.delete_conditions.clone(),
                Arc::clone(&self.stats),
            )?
            .with_data_fields(data_fields),
        );

        let threads = self.config.worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tessera-read-{i}"))
            .build()?;

        let unordered = self.layout == QueryLayout::Unordered && self.schema.allows_dups;
        let engine: Box<dyn ReadEngine> = pool.install(|| -> Result<Box<dyn ReadEngine>> {
            let ctx = Arc::clone(&ctx);
            Ok(match (unordered, overlapping) {
                (true, false) => Box::new(UnorderedReader::<u8>::new(ctx)?),
                (true, true) => Box::new(UnorderedReader::<u64>::new(ctx)?),
                (false, false) => Box::new(GlobalOrderReader::<u8>::new(ctx)?),
                (false, true) => Box::new(GlobalOrderReader::<u64>::new(ctx)?),
            })
        })?;
        debug!(threads, unordered, overlapping, "Query initialized");

        self.ctx = Some(ctx);
        self.engine = Some(engine);
        self.pool = Some(pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{MemFragmentBuilder, MemTileSource};
    use crate::schema::{Attribute, Datatype, Dimension, Layout, TIMESTAMPS};

    fn setup(version: u32) -> SparseQuery {
        let schema = Arc::new(
            ArraySchema::new(Layout::RowMajor)
                .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 100.0]))
                .with_attribute(Attribute::new("a", Datatype::Int32))
                .with_attribute(Attribute::var("s", Datatype::StringAscii).nullable())
                .with_version(version),
        );
        let frag = MemFragmentBuilder::new(Arc::clone(&schema), "f1", 1)
            .dim("d", &[1i32, 2])
            .attr("a", &[10i32, 20])
            .attr_str_nullable("s", &[Some("x"), None])
            .build()
            .unwrap();
        let source = Arc::new(MemTileSource::new(vec![Arc::new(frag)]));
        SparseQuery::new(schema, source.metadata(), source)
    }

    #[test]
    fn test_buffer_validation() {
        let mut query = setup(20);
        assert!(matches!(
            query.set_buffer("s", QueryBuffer::new(16)),
            Err(Error::InvalidBuffer(_))
        ));
        assert!(matches!(
            query.set_buffer("s", QueryBuffer::var(16, 16)),
            Err(Error::InvalidBuffer(_))
        ));
        assert!(matches!(
            query.set_buffer("a", QueryBuffer::var(16, 16)),
            Err(Error::InvalidBuffer(_))
        ));
        assert!(matches!(
            query.set_buffer("nope", QueryBuffer::new(16)),
            Err(Error::UnknownField(_))
        ));
        query
            .set_buffer("s", QueryBuffer::var(16, 16).with_validity(2))
            .unwrap();
        query.set_buffer("a", QueryBuffer::fixed::<i32>(2)).unwrap();
    }

    #[test]
    fn test_submit_without_buffers_fails() {
        let mut query = setup(20);
        assert!(matches!(query.submit(), Err(Error::InvalidBuffer(_))));
        assert_eq!(query.status(), QueryStatus::Failed);
        assert!(matches!(query.submit(), Err(Error::QueryFailed(_))));
    }

    #[test]
    fn test_timestamps_need_recent_format() {
        let mut query = setup(CELL_TIMESTAMPS_MIN_VERSION - 1);
        query.set_buffer(TIMESTAMPS, QueryBuffer::fixed::<u64>(2)).unwrap();
        assert!(matches!(query.submit(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_cancel_before_submit() {
        let mut query = setup(20);
        query.set_buffer("a", QueryBuffer::fixed::<i32>(2)).unwrap();
        query.cancel_handle().cancel();
        assert!(matches!(query.submit(), Err(Error::Cancelled)));
        assert_eq!(query.status(), QueryStatus::Uninitialized);

        // The flag is consumed; the query resumes.
        assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
        assert_eq!(query.buffer("a").unwrap().values::<i32>(), vec![10, 20]);
    }
}
