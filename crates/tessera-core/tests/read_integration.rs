//! Integration tests for the sparse read path.

use std::sync::Arc;

use tessera_core::condition::Condition;
use tessera_core::order::{CellCoords, GlobalOrder};
use tessera_core::schema::{
    decode_values, DELETE_CONDITION_INDEX, DELETE_TIMESTAMPS, NOT_DELETED, TIMESTAMPS,
};
use tessera_core::{
    Aggregate, AggregateValue, ArraySchema, Attribute, CoordRange, Datatype, DeleteCondition,
    Dimension, Error, Layout, MemFragment, MemFragmentBuilder, MemTileSource, OffsetsMode,
    QueryBuffer, QueryLayout, QueryStatus, ReaderConfig, SparseQuery, Subarray, TileSource,
    TileTuple,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestContext {
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<MemFragment>>,
}

impl TestContext {
    fn new(schema: ArraySchema) -> Self {
        init_tracing();
        Self {
            schema: Arc::new(schema),
            fragments: Vec::new(),
        }
    }

    fn fragment(&self, name: &str, timestamp: u64) -> MemFragmentBuilder {
        MemFragmentBuilder::new(Arc::clone(&self.schema), name, timestamp)
    }

    fn add(&mut self, builder: MemFragmentBuilder) {
        self.fragments.push(Arc::new(builder.build().unwrap()));
    }

    fn source(&self) -> Arc<MemTileSource> {
        Arc::new(MemTileSource::new(self.fragments.clone()))
    }

    fn query(&self) -> SparseQuery {
        let source = self.source();
        SparseQuery::new(Arc::clone(&self.schema), source.metadata(), source)
    }
}

/// One Int32 dimension `d` over [1, 1000] and an Int32 attribute `a`.
fn schema_1d(allows_dups: bool) -> ArraySchema {
    ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 1000.0]))
        .with_attribute(Attribute::new("a", Datatype::Int32))
        .with_allows_dups(allows_dups)
}

/// Submit until complete with `cells`-sized Int32 buffers for `fields`.
/// Returns the concatenated columns and the cell count of every submit.
fn read_i32(query: &mut SparseQuery, fields: &[&str], cells: usize) -> (Vec<Vec<i32>>, Vec<usize>) {
    for field in fields {
        query.set_buffer(field, QueryBuffer::fixed::<i32>(cells)).unwrap();
    }
    let mut columns = vec![Vec::new(); fields.len()];
    let mut batches = Vec::new();
    for _ in 0..10_000 {
        let status = query.submit().unwrap();
        let mut batch = 0;
        for (column, field) in columns.iter_mut().zip(fields) {
            let values = query.buffer(field).unwrap().values::<i32>();
            batch = values.len();
            column.extend(values);
        }
        batches.push(batch);
        if status == QueryStatus::Complete {
            return (columns, batches);
        }
    }
    panic!("query did not complete");
}

/// Three fragments of 100 interleaved, non-overlapping cells each.
fn interleaved(tile_capacity: usize) -> TestContext {
    let mut ctx = TestContext::new(schema_1d(false));
    for f in 0..3 {
        let d: Vec<i32> = (0..100).map(|k| 3 * k + f + 1).collect();
        let a: Vec<i32> = d.iter().map(|v| v * 10).collect();
        ctx.add(
            ctx.fragment(&format!("f{f}"), 10 + f as u64)
                .tile_capacity(tile_capacity)
                .dim("d", &d)
                .attr("a", &a),
        );
    }
    ctx
}

#[test]
fn test_newest_fragment_wins() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(ctx.fragment("f1", 10).dim("d", &[1i32, 3, 5]).attr("a", &[1i32, 30, 5]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[3i32, 7]).attr("a", &[300i32, 7]));

    let mut query = ctx.query();
    let (columns, batches) = read_i32(&mut query, &["d", "a"], 100);
    assert_eq!(columns[0], vec![1, 3, 5, 7]);
    assert_eq!(columns[1], vec![1, 300, 5, 7]);
    assert_eq!(batches, vec![4]);
    assert_eq!(query.stats().cells_deduplicated(), 1);
}

#[test]
fn test_single_coordinate_overwritten() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 10.0]))
        .with_attribute(Attribute::var("v", Datatype::StringAscii));
    let mut ctx = TestContext::new(schema);
    ctx.add(ctx.fragment("f1", 10).dim("d", &[3i32]).attr_str("v", &["A"]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[3i32]).attr_str("v", &["B"]));

    let mut query = ctx.query();
    query.set_buffer("d", QueryBuffer::fixed::<i32>(4)).unwrap();
    query.set_buffer("v", QueryBuffer::var(32, 16)).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);

    let config = ReaderConfig::default();
    assert_eq!(query.buffer("d").unwrap().values::<i32>(), vec![3]);
    assert_eq!(query.buffer("v").unwrap().strings(&config), vec!["B"]);
}

#[test]
fn test_incomplete_submits_cover_every_cell() {
    let ctx = interleaved(10);
    let mut query = ctx.query();
    let (columns, batches) = read_i32(&mut query, &["d", "a"], 37);

    let expected: Vec<i32> = (1..=300).collect();
    assert_eq!(columns[0], expected);
    assert_eq!(columns[1], expected.iter().map(|v| v * 10).collect::<Vec<_>>());
    let mut expected_batches = vec![37; 8];
    expected_batches.push(4);
    assert_eq!(batches, expected_batches);
}

#[test]
fn test_resumability_with_any_buffer_size() {
    let ctx = interleaved(7);
    let mut reference = None;
    for cells in [1, 5, 64, 300] {
        let mut query = ctx.query();
        let (columns, _) = read_i32(&mut query, &["d", "a"], cells);
        match &reference {
            None => reference = Some(columns),
            Some(expected) => assert_eq!(&columns, expected, "buffer of {cells} cells"),
        }
    }
    assert_eq!(reference.unwrap()[0].len(), 300);
}

#[test]
fn test_small_memory_budget_loads_incrementally() {
    let ctx = interleaved(10);
    // Only a handful of 10-cell tiles fit at once.
    let config = ReaderConfig::new()
        .with_total_budget(10_000)
        .with_ratio_coords(0.02)
        .with_ratio_query_condition(0.1)
        .with_ratio_tile_ranges(0.1)
        .with_ratio_array_data(0.1);
    let mut query = ctx.query().with_config(config);
    let (columns, _) = read_i32(&mut query, &["d", "a"], 50);

    assert_eq!(columns[0], (1..=300).collect::<Vec<_>>());
    let stats = query.stats();
    assert_eq!(stats.tiles_loaded(), 30);
    assert!(stats.tiles_evicted() > 0);
    assert!(stats.budget_stops() > 0);
    assert!(query.memory_usage().unwrap().coords <= 200);
}

#[test]
fn test_memory_budget_floor() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(
        ctx.fragment("f1", 1)
            .dim("d", &(1..=10).collect::<Vec<i32>>())
            .attr("a", &[0i32; 10]),
    );
    // 10 coordinate bytes cannot hold a 10-cell tile.
    let config = ReaderConfig::new()
        .with_total_budget(1_000)
        .with_ratio_coords(0.01);
    let mut query = ctx.query().with_config(config);
    query.set_buffer("a", QueryBuffer::fixed::<i32>(10)).unwrap();

    assert!(matches!(query.submit(), Err(Error::MemoryBudget(_))));
    assert_eq!(query.status(), QueryStatus::Failed);
    assert!(matches!(query.submit(), Err(Error::QueryFailed(_))));
}

#[test]
fn test_duplicates_preserved_in_global_order() {
    let mut ctx = TestContext::new(schema_1d(true));
    ctx.add(ctx.fragment("f1", 10).dim("d", &[1i32, 2, 2]).attr("a", &[10i32, 20, 21]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[2i32, 3]).attr("a", &[30i32, 40]));

    let mut query = ctx.query();
    let (columns, _) = read_i32(&mut query, &["d", "a"], 2);
    assert_eq!(columns[0], vec![1, 2, 2, 2, 3]);
    assert_eq!(columns[1], vec![10, 30, 20, 21, 40]);
}

#[test]
fn test_unordered_reads_every_duplicate() {
    let mut ctx = TestContext::new(schema_1d(true));
    ctx.add(ctx.fragment("f1", 10).tile_capacity(2).dim("d", &[1i32, 2, 2]).attr("a", &[10i32, 20, 21]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[2i32, 3]).attr("a", &[30i32, 40]));

    let mut query = ctx.query().with_layout(QueryLayout::Unordered);
    let (columns, batches) = read_i32(&mut query, &["d", "a"], 2);
    let mut pairs: Vec<(i32, i32)> = columns[0].iter().copied().zip(columns[1].iter().copied()).collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(1, 10), (2, 20), (2, 21), (2, 30), (3, 40)]);
    assert_eq!(batches.iter().sum::<usize>(), 5);
}

#[test]
fn test_unordered_with_partial_tile_offsets() {
    let mut ctx = TestContext::new(schema_1d(true));
    for f in 0..3 {
        let d: Vec<i32> = (1..=10).map(|v| v + 100 * f).collect();
        ctx.add(ctx.fragment(&format!("f{f}"), f as u64 + 1).dim("d", &d).attr("a", &d));
    }
    // Tile offsets of one fragment take 16 bytes; the budget holds one.
    let config = ReaderConfig::new()
        .with_total_budget(1_000)
        .with_ratio_array_data(0.02)
        .with_partial_tile_offsets_loading(true);
    let mut query = ctx.query().with_config(config).with_layout(QueryLayout::Unordered);
    let (columns, _) = read_i32(&mut query, &["d", "a"], 7);

    let mut d = columns[0].clone();
    d.sort_unstable();
    let expected: Vec<i32> = (0..3).flat_map(|f| (1..=10).map(move |v| v + 100 * f)).collect();
    assert_eq!(d, expected);
    assert_eq!(columns[0], columns[1]);
}

#[test]
fn test_unordered_rejects_delete_metadata() {
    let mut ctx = TestContext::new(schema_1d(true));
    ctx.add(ctx.fragment("f1", 1).dim("d", &[1i32]).attr("a", &[1i32]));
    let mut query = ctx.query().with_layout(QueryLayout::Unordered);
    query.set_buffer(DELETE_TIMESTAMPS, QueryBuffer::fixed::<u64>(4)).unwrap();
    assert!(matches!(query.submit(), Err(Error::Unsupported(_))));
}

#[test]
fn test_overlapping_ranges_repeat_cells() {
    let mut ctx = TestContext::new(schema_1d(false));
    let d: Vec<i32> = (1..=10).collect();
    ctx.add(ctx.fragment("f1", 1).tile_capacity(3).dim("d", &d).attr("a", &d));

    let subarray = Subarray::new(1)
        .with_range(0, CoordRange::new(1i32, 5i32))
        .with_range(0, CoordRange::new(3i32, 7i32));
    let mut query = ctx.query().with_subarray(subarray);
    let (columns, batches) = read_i32(&mut query, &["d"], 4);
    assert_eq!(columns[0], vec![1, 2, 3, 3, 4, 4, 5, 5, 6, 7]);
    assert_eq!(batches, vec![4, 4, 2]);
}

#[test]
fn test_unordered_slabs_stop_at_result_limit() {
    let mut ctx = TestContext::new(schema_1d(true));
    let d: Vec<i32> = (1..=10).collect();
    ctx.add(ctx.fragment("f1", 1).tile_capacity(3).dim("d", &d).attr("a", &d));

    // The second tile holds five results; only four fit the first pass.
    let subarray = Subarray::new(1)
        .with_range(0, CoordRange::new(1i32, 5i32))
        .with_range(0, CoordRange::new(3i32, 7i32));
    let mut query = ctx.query().with_subarray(subarray).with_layout(QueryLayout::Unordered);
    let (columns, batches) = read_i32(&mut query, &["d", "a"], 4);
    assert_eq!(columns[0], vec![1, 2, 3, 3, 4, 4, 5, 5, 6, 7]);
    assert_eq!(columns[0], columns[1]);
    assert_eq!(batches, vec![4, 4, 2]);
}

#[test]
fn test_subarray_prunes_tiles() {
    let mut ctx = TestContext::new(schema_1d(false));
    let d: Vec<i32> = (1..=100).collect();
    ctx.add(ctx.fragment("f1", 1).tile_capacity(10).dim("d", &d).attr("a", &d));

    let subarray = Subarray::new(1).with_range(0, CoordRange::new(15i32, 24i32));
    let mut query = ctx.query().with_subarray(subarray);
    let (columns, _) = read_i32(&mut query, &["a"], 100);
    assert_eq!(columns[0], (15..=24).collect::<Vec<_>>());
    assert_eq!(query.stats().tiles_loaded(), 2);
}

#[test]
fn test_query_condition() {
    let mut ctx = TestContext::new(schema_1d(false));
    let d: Vec<i32> = (1..=10).collect();
    let a: Vec<i32> = d.iter().map(|v| v * 10).collect();
    ctx.add(ctx.fragment("f1", 1).tile_capacity(4).dim("d", &d).attr("a", &a));

    let mut query = ctx
        .query()
        .with_condition(Arc::new(Condition::gt("a", 50).and(Condition::le("d", 9))));
    let (columns, _) = read_i32(&mut query, &["d"], 100);
    assert_eq!(columns[0], vec![6, 7, 8, 9]);
}

#[test]
fn test_condition_filters_whole_tiles() {
    let mut ctx = TestContext::new(schema_1d(false));
    let d: Vec<i32> = (1..=10).collect();
    ctx.add(ctx.fragment("f1", 1).tile_capacity(5).dim("d", &d).attr("a", &d));

    let mut query = ctx.query().with_condition(Arc::new(Condition::gt("a", 5)));
    let (columns, _) = read_i32(&mut query, &["a"], 100);
    assert_eq!(columns[0], vec![6, 7, 8, 9, 10]);
    assert_eq!(query.stats().tiles_ignored(), 1);
    assert_eq!(query.read_state().unwrap().ignored_tile_num(), 1);
}

#[test]
fn test_delete_conditions() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(
        ctx.fragment("f1", 10)
            .dim("d", &[1i32, 2, 3, 4, 5])
            .attr("a", &[10i32, 20, 30, 40, 50]),
    );
    ctx.add(ctx.fragment("f2", 20).dim("d", &[4i32]).attr("a", &[400i32]));
    let delete = DeleteCondition::new("del1", 15, Arc::new(Condition::ge("a", 30)));

    let mut query = ctx.query().with_delete_condition(delete.clone());
    let (columns, _) = read_i32(&mut query, &["d", "a"], 100);
    assert_eq!(columns[0], vec![1, 2, 4]);
    assert_eq!(columns[1], vec![10, 20, 400]);

    // A fragment that already applied the delete keeps its cells.
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(
        ctx.fragment("f1", 10)
            .delete_markers(vec!["del1".to_string()])
            .dim("d", &[1i32, 2, 3])
            .attr("a", &[10i32, 20, 30]),
    );
    let mut query = ctx.query().with_delete_condition(delete);
    let (columns, _) = read_i32(&mut query, &["a"], 100);
    assert_eq!(columns[0], vec![10, 20, 30]);
}

#[test]
fn test_consolidation_keeps_versions_and_delete_metadata() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(ctx.fragment("f1", 10).dim("d", &[1i32, 3]).attr("a", &[1i32, 30]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[3i32]).attr("a", &[300i32]));
    let delete = DeleteCondition::new("del1", 15, Arc::new(Condition::ge("a", 0)));

    let config = ReaderConfig::new().with_consolidation_with_timestamps(true);
    let mut query = ctx.query().with_config(config).with_delete_condition(delete);
    query.set_buffer("d", QueryBuffer::fixed::<i32>(8)).unwrap();
    query.set_buffer("a", QueryBuffer::fixed::<i32>(8)).unwrap();
    query.set_buffer(TIMESTAMPS, QueryBuffer::fixed::<u64>(8)).unwrap();
    query.set_buffer(DELETE_TIMESTAMPS, QueryBuffer::fixed::<u64>(8)).unwrap();
    query.set_buffer(DELETE_CONDITION_INDEX, QueryBuffer::fixed::<u64>(8)).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);

    assert_eq!(query.buffer("d").unwrap().values::<i32>(), vec![1, 3, 3]);
    assert_eq!(query.buffer("a").unwrap().values::<i32>(), vec![1, 300, 30]);
    assert_eq!(query.buffer(TIMESTAMPS).unwrap().values::<u64>(), vec![10, 20, 10]);
    assert_eq!(
        query.buffer(DELETE_TIMESTAMPS).unwrap().values::<u64>(),
        vec![15, NOT_DELETED, 15]
    );
    assert_eq!(
        query.buffer(DELETE_CONDITION_INDEX).unwrap().values::<u64>(),
        vec![0, NOT_DELETED, 0]
    );
}

#[test]
fn test_purge_drops_deleted_versions() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(ctx.fragment("f1", 10).dim("d", &[1i32, 2, 3]).attr("a", &[10i32, 20, 30]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[2i32]).attr("a", &[200i32]));
    let delete = DeleteCondition::new("del1", 15, Arc::new(Condition::ge("a", 20)));

    let config = ReaderConfig::new()
        .with_consolidation_with_timestamps(true)
        .with_purge_deleted_cells(true);
    let mut query = ctx.query().with_config(config).with_delete_condition(delete);
    let (columns, _) = read_i32(&mut query, &["d", "a"], 100);
    assert_eq!(columns[0], vec![1, 2]);
    assert_eq!(columns[1], vec![10, 200]);
}

#[test]
fn test_purge_within_timestamped_fragment() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(
        ctx.fragment("c", 10)
            .timestamp_range(10, 30)
            .tile_capacity(2)
            .dim("d", &[1i32, 2, 2, 2])
            .attr("a", &[1i32, 230, 220, 210])
            .cell_timestamps(&[10, 30, 20, 10]),
    );
    let delete = DeleteCondition::new("del1", 25, Arc::new(Condition::ge("a", 200)));

    let config = ReaderConfig::new()
        .with_consolidation_with_timestamps(true)
        .with_purge_deleted_cells(true);
    let mut query = ctx.query().with_config(config).with_delete_condition(delete);
    let (columns, _) = read_i32(&mut query, &["d", "a"], 1);
    assert_eq!(columns[0], vec![1, 2]);
    assert_eq!(columns[1], vec![1, 230]);
}

#[test]
fn test_dedup_inside_timestamped_fragment() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(
        ctx.fragment("c", 5)
            .timestamp_range(5, 30)
            .tile_capacity(2)
            .dim("d", &[1i32, 2, 2, 3])
            .attr("a", &[1i32, 230, 220, 3])
            .cell_timestamps(&[5, 30, 20, 5]),
    );
    ctx.add(ctx.fragment("f2", 25).dim("d", &[2i32]).attr("a", &[999i32]));

    for cells in [1, 100] {
        let mut query = ctx.query();
        let (columns, _) = read_i32(&mut query, &["d", "a"], cells);
        assert_eq!(columns[0], vec![1, 2, 3]);
        assert_eq!(columns[1], vec![1, 230, 3]);
    }
}

#[test]
fn test_timestamp_window() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(ctx.fragment("f1", 10).dim("d", &[1i32, 3]).attr("a", &[1i32, 3]));
    ctx.add(ctx.fragment("f2", 20).dim("d", &[3i32]).attr("a", &[300i32]));
    ctx.add(
        ctx.fragment("c", 5)
            .timestamp_range(5, 30)
            .dim("d", &[5i32, 5])
            .attr("a", &[530i32, 520])
            .cell_timestamps(&[30, 20]),
    );

    let config = ReaderConfig::new().with_timestamp_range(0, 25);
    let mut query = ctx.query().with_config(config);
    let (columns, _) = read_i32(&mut query, &["d", "a"], 10);
    assert_eq!(columns[0], vec![1, 3, 5]);
    assert_eq!(columns[1], vec![1, 300, 520]);

    let config = ReaderConfig::new().with_timestamp_range(0, 15);
    let mut query = ctx.query().with_config(config);
    let (columns, _) = read_i32(&mut query, &["a"], 10);
    assert_eq!(columns[0], vec![1, 3]);
}

#[test]
fn test_var_data_overflow_is_incomplete() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 10.0]))
        .with_attribute(Attribute::var("s", Datatype::StringAscii));
    let mut ctx = TestContext::new(schema);
    ctx.add(
        ctx.fragment("f1", 1)
            .dim("d", &[1i32, 2, 3, 4, 5])
            .attr_str("s", &["aa", "bbb", "c", "dddd", "ee"]),
    );

    let config = ReaderConfig::default();
    let mut query = ctx.query();
    query.set_buffer("d", QueryBuffer::fixed::<i32>(5)).unwrap();
    query.set_buffer("s", QueryBuffer::var(40, 6)).unwrap();

    assert_eq!(query.submit().unwrap(), QueryStatus::Incomplete);
    assert_eq!(query.buffer("d").unwrap().values::<i32>(), vec![1, 2, 3]);
    assert_eq!(query.buffer("s").unwrap().strings(&config), vec!["aa", "bbb", "c"]);

    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(query.buffer("d").unwrap().values::<i32>(), vec![4, 5]);
    assert_eq!(query.buffer("s").unwrap().strings(&config), vec!["dddd", "ee"]);
    assert_eq!(query.buffer("s").unwrap().offsets_u64(&config), vec![0, 4]);
}

#[test]
fn test_offsets_32_bit_elements_with_extra_element() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 10.0]))
        .with_attribute(Attribute::var("v", Datatype::Int32));
    let mut ctx = TestContext::new(schema);
    ctx.add(
        ctx.fragment("f1", 1)
            .dim("d", &[1i32, 2, 3])
            .attr_var("v", &[vec![1i32, 2], vec![3], vec![4, 5, 6]]),
    );

    let config = ReaderConfig::new()
        .with_offsets_bitsize(32)
        .with_offsets_mode(OffsetsMode::Elements)
        .with_offsets_extra_element(true);
    let mut query = ctx.query().with_config(config.clone());
    query.set_buffer("v", QueryBuffer::var(16, 24)).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);

    let buffer = query.buffer("v").unwrap();
    assert_eq!(buffer.offsets_u64(&config), vec![0, 2, 3, 6]);
    assert_eq!(buffer.offsets_size(), 16);
    assert_eq!(buffer.values::<i32>(), vec![1, 2, 3, 4, 5, 6]);
    let cells: Vec<Vec<i32>> = buffer
        .var_values(&config, 4)
        .into_iter()
        .map(decode_values::<i32>)
        .collect();
    assert_eq!(cells, vec![vec![1, 2], vec![3], vec![4, 5, 6]]);
}

#[test]
fn test_nullable_attribute() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("d", Datatype::Int32, [1.0, 10.0]))
        .with_attribute(Attribute::new("n", Datatype::Int32).nullable());
    let mut ctx = TestContext::new(schema);
    ctx.add(
        ctx.fragment("f1", 1)
            .dim("d", &[1i32, 2, 3])
            .attr_nullable("n", &[Some(1i32), None, Some(3)]),
    );

    let mut query = ctx.query();
    query
        .set_buffer("n", QueryBuffer::fixed::<i32>(3).with_validity(3))
        .unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    let buffer = query.buffer("n").unwrap();
    assert_eq!(buffer.validity().unwrap(), &[1, 0, 1]);
    assert_eq!(buffer.values::<i32>()[0], 1);
    assert_eq!(buffer.values::<i32>()[2], 3);
}

#[test]
fn test_aggregates_without_buffers() {
    let schema = schema_1d(false).with_attribute(Attribute::new("n", Datatype::Int32).nullable());
    let mut ctx = TestContext::new(schema);
    let d: Vec<i32> = (1..=20).collect();
    let n: Vec<Option<i32>> = d.iter().map(|v| (v % 4 != 0).then_some(*v)).collect();
    ctx.add(
        ctx.fragment("f1", 1)
            .tile_capacity(6)
            .dim("d", &d)
            .attr("a", &d)
            .attr_nullable("n", &n),
    );
    ctx.add(ctx.fragment("f2", 2).dim("d", &[20i32]).attr("a", &[-100i32]).attr_nullable("n", &[None::<i32>]));

    let mut query = ctx.query();
    query.add_aggregate("count", Aggregate::count()).unwrap();
    query.add_aggregate("sum", Aggregate::sum("a")).unwrap();
    query.add_aggregate("min", Aggregate::min("a")).unwrap();
    query.add_aggregate("max", Aggregate::max("d")).unwrap();
    query.add_aggregate("nulls", Aggregate::null_count("n")).unwrap();
    assert!(matches!(
        query.add_aggregate("count", Aggregate::count()),
        Err(Error::Config(_))
    ));

    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(query.aggregate("count"), Some(AggregateValue::UInt(20)));
    assert_eq!(query.aggregate("sum"), Some(AggregateValue::Int(190 - 100)));
    assert_eq!(query.aggregate("min"), Some(AggregateValue::Int(-100)));
    assert_eq!(query.aggregate("max"), Some(AggregateValue::Int(20)));
    // Multiples of four below 20, plus the overwritten cell 20.
    assert_eq!(query.aggregate("nulls"), Some(AggregateValue::UInt(5)));
}

#[test]
fn test_aggregates_accumulate_across_submits() {
    let ctx = interleaved(10);
    let mut query = ctx.query();
    query.add_aggregate("sum", Aggregate::sum("a")).unwrap();
    let (columns, batches) = read_i32(&mut query, &["d"], 100);
    assert_eq!(columns[0].len(), 300);
    assert!(batches.iter().all(|&b| b <= 100));
    assert_eq!(query.aggregate("sum"), Some(AggregateValue::Int(10 * 300 * 301 / 2)));
}

#[test]
fn test_zipped_coordinates() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::new("x", Datatype::Int32, [1.0, 4.0]))
        .with_dimension(Dimension::new("y", Datatype::Int32, [1.0, 4.0]))
        .with_attribute(Attribute::new("a", Datatype::Int32))
        .with_version(4);
    let mut ctx = TestContext::new(schema);
    ctx.add(
        ctx.fragment("f1", 10)
            .dim("x", &[1i32, 2])
            .dim("y", &[1i32, 2])
            .attr("a", &[10i32, 20]),
    );
    ctx.add(
        ctx.fragment("f2", 20)
            .dim("x", &[1i32, 1])
            .dim("y", &[2i32, 1])
            .attr("a", &[12i32, 99]),
    );

    let mut query = ctx.query();
    let (columns, _) = read_i32(&mut query, &["x", "y", "a"], 2);
    assert_eq!(columns[0], vec![1, 1, 2]);
    assert_eq!(columns[1], vec![1, 2, 2]);
    assert_eq!(columns[2], vec![99, 12, 20]);
}

#[test]
fn test_col_major_with_space_tiles() {
    let schema = ArraySchema::new(Layout::ColMajor)
        .with_tile_order(Layout::RowMajor)
        .with_dimension(Dimension::new("x", Datatype::Int32, [1.0, 4.0]).with_tile_extent(2.0))
        .with_dimension(Dimension::new("y", Datatype::Int32, [1.0, 4.0]).with_tile_extent(2.0));
    let mut ctx = TestContext::new(schema);
    let mut x = Vec::new();
    let mut y = Vec::new();
    for i in 1..=4 {
        for j in 1..=4 {
            x.push(i);
            y.push(j);
        }
    }
    let half = x.len() / 2;
    ctx.add(ctx.fragment("f1", 1).tile_capacity(3).dim("x", &x[..half]).dim("y", &y[..half]));
    ctx.add(ctx.fragment("f2", 2).tile_capacity(3).dim("x", &x[half..]).dim("y", &y[half..]));

    let mut query = ctx.query();
    let (columns, _) = read_i32(&mut query, &["x", "y"], 5);
    let cells: Vec<(i32, i32)> = columns[0].iter().copied().zip(columns[1].iter().copied()).collect();
    // Space tiles in row-major order, cells column-major inside each.
    assert_eq!(
        cells,
        vec![
            (1, 1), (2, 1), (1, 2), (2, 2),
            (1, 3), (2, 3), (1, 4), (2, 4),
            (3, 1), (4, 1), (3, 2), (4, 2),
            (3, 3), (4, 3), (3, 4), (4, 4),
        ]
    );
}

struct Point {
    coords: [Vec<u8>; 2],
    hilbert: u64,
}

impl CellCoords for Point {
    fn coord(&self, dim: usize) -> &[u8] {
        &self.coords[dim]
    }

    fn hilbert(&self) -> u64 {
        self.hilbert
    }
}

/// Two Int32 dimensions `x` and `y` over [0, 7] in Hilbert order.
fn hilbert_schema() -> ArraySchema {
    ArraySchema::new(Layout::Hilbert)
        .with_dimension(Dimension::new("x", Datatype::Int32, [0.0, 7.0]))
        .with_dimension(Dimension::new("y", Datatype::Int32, [0.0, 7.0]))
}

/// `cells` sorted in global order.
fn hilbert_sorted(schema: &Arc<ArraySchema>, cells: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let order = GlobalOrder::new(Arc::clone(schema));
    let mut points: Vec<Point> = cells
        .iter()
        .map(|&(x, y)| {
            let mut point = Point {
                coords: [x.to_le_bytes().to_vec(), y.to_le_bytes().to_vec()],
                hilbert: 0,
            };
            point.hilbert = order.hilbert_value(&point);
            point
        })
        .collect();
    points.sort_by(|a, b| order.compare(a, b));
    points
        .iter()
        .map(|p| (decode_values::<i32>(&p.coords[0])[0], decode_values::<i32>(&p.coords[1])[0]))
        .collect()
}

fn add_xy(ctx: &mut TestContext, name: &str, timestamp: u64, cells: &[(i32, i32)], tile_capacity: usize) {
    let x: Vec<i32> = cells.iter().map(|c| c.0).collect();
    let y: Vec<i32> = cells.iter().map(|c| c.1).collect();
    ctx.add(
        ctx.fragment(name, timestamp)
            .tile_capacity(tile_capacity)
            .dim("x", &x)
            .dim("y", &y),
    );
}

fn read_xy(query: &mut SparseQuery, cells: usize) -> Vec<(i32, i32)> {
    let (columns, _) = read_i32(query, &["x", "y"], cells);
    columns[0].iter().copied().zip(columns[1].iter().copied()).collect()
}

#[test]
fn test_hilbert_order() {
    let mut ctx = TestContext::new(hilbert_schema());
    let all: Vec<(i32, i32)> = (0..8).flat_map(|i| (0..8).map(move |j| (i, j))).collect();
    for (f, part) in all.chunks(32).enumerate() {
        add_xy(&mut ctx, &format!("f{f}"), f as u64 + 1, part, 5);
    }

    let mut query = ctx.query();
    assert_eq!(read_xy(&mut query, 9), hilbert_sorted(&ctx.schema, &all));
}

/// Coordinate budget for `tiles` resident 4-cell tiles of two Int32
/// dimensions in Hilbert order: 8 coordinate bytes, a one-byte bitmap
/// weight and an 8-byte Hilbert value per cell, 68 bytes per tile.
fn hilbert_tile_budget(tiles: u64) -> ReaderConfig {
    let coords = tiles * 68 + 20;
    ReaderConfig::new()
        .with_total_budget(100_000)
        .with_ratio_coords(coords as f64 / 100_000.0)
        .with_ratio_query_condition(0.1)
        .with_ratio_tile_ranges(0.1)
        .with_ratio_array_data(0.1)
}

#[test]
fn test_read_ahead_unloaded_for_starved_fragment() {
    // Every tile of `low` precedes every tile of `high` in bounding-box
    // order, so reading ahead fills the budget with `low` while `high`
    // still blocks the merge.
    let mut ctx = TestContext::new(hilbert_schema());
    let low: Vec<(i32, i32)> = (0..4).flat_map(|i| (0..4).map(move |j| (i, j))).collect();
    let high: Vec<(i32, i32)> = (4..8).flat_map(|i| (4..8).map(move |j| (i, j))).collect();
    add_xy(&mut ctx, "low", 1, &low, 4);
    add_xy(&mut ctx, "high", 2, &high, 4);

    let mut query = ctx.query().with_config(hilbert_tile_budget(3));
    let cells = read_xy(&mut query, 9);

    let all: Vec<(i32, i32)> = low.iter().chain(&high).copied().collect();
    assert_eq!(cells, hilbert_sorted(&ctx.schema, &all));
    let stats = query.stats();
    assert!(stats.tiles_unloaded() > 0);
    assert!(stats.tiles_loaded() > 8);
    assert!(query.memory_usage().unwrap().coords <= 3 * 68 + 20);
}

#[test]
fn test_overlapping_fragments_complete_under_tight_budget() {
    // Fragment `f` holds columns `f` and `f + 4`: every bounding box spans
    // the whole array along `x`.
    let mut ctx = TestContext::new(hilbert_schema());
    let all: Vec<(i32, i32)> = (0..8).flat_map(|i| (0..8).map(move |j| (i, j))).collect();
    for f in 0..4 {
        let part: Vec<(i32, i32)> = all.iter().copied().filter(|c| c.1 % 4 == f).collect();
        add_xy(&mut ctx, &format!("f{f}"), f as u64 + 1, &part, 4);
    }

    for cells in [3, 64] {
        let mut query = ctx.query().with_config(hilbert_tile_budget(6));
        assert_eq!(read_xy(&mut query, cells), hilbert_sorted(&ctx.schema, &all), "buffer of {cells} cells");
        assert!(query.memory_usage().unwrap().coords <= 6 * 68 + 20);
    }
}

#[test]
fn test_string_dimension() {
    let schema = ArraySchema::new(Layout::RowMajor)
        .with_dimension(Dimension::string("k"))
        .with_attribute(Attribute::new("a", Datatype::Int32));
    let mut ctx = TestContext::new(schema);
    ctx.add(ctx.fragment("f1", 1).dim_str("k", &["b", "dd", "a"]).attr("a", &[2i32, 4, 1]));
    ctx.add(ctx.fragment("f2", 2).dim_str("k", &["c", "dd"]).attr("a", &[3i32, 40]));

    let config = ReaderConfig::default();
    let mut query = ctx.query();
    query.set_buffer("k", QueryBuffer::var(64, 64)).unwrap();
    query.set_buffer("a", QueryBuffer::fixed::<i32>(8)).unwrap();
    assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    assert_eq!(
        query.buffer("k").unwrap().strings(&config),
        vec!["a", "b", "c", "dd"]
    );
    assert_eq!(query.buffer("a").unwrap().values::<i32>(), vec![1, 2, 3, 40]);
}

#[derive(Debug)]
struct FailingSource {
    inner: MemTileSource,
    field: &'static str,
}

impl TileSource for FailingSource {
    fn unfilter(&self, fragment: usize, tile: u64, field: &str) -> tessera_core::Result<TileTuple> {
        if field == self.field {
            return Err(Error::Io {
                fragment,
                tile,
                field: field.to_string(),
                message: "checksum mismatch".to_string(),
            });
        }
        self.inner.unfilter(fragment, tile, field)
    }
}

#[test]
fn test_tile_io_error_fails_query() {
    let mut ctx = TestContext::new(schema_1d(false));
    ctx.add(ctx.fragment("f1", 1).dim("d", &[1i32, 2]).attr("a", &[1i32, 2]));
    let source = Arc::new(FailingSource {
        inner: MemTileSource::new(ctx.fragments.clone()),
        field: "a",
    });
    let metadata = ctx.source().metadata();
    let mut query = SparseQuery::new(Arc::clone(&ctx.schema), metadata, source);
    query.set_buffer("a", QueryBuffer::fixed::<i32>(2)).unwrap();

    let err = query.submit().unwrap_err();
    assert!(matches!(err, Error::Io { ref field, .. } if field == "a"));
    assert_eq!(query.status(), QueryStatus::Failed);
    assert!(matches!(query.submit(), Err(Error::QueryFailed(_))));
}

#[test]
fn test_cancel_between_submits() {
    let ctx = interleaved(10);
    let mut query = ctx.query();
    query.set_buffer("d", QueryBuffer::fixed::<i32>(100)).unwrap();

    assert_eq!(query.submit().unwrap(), QueryStatus::Incomplete);
    let mut seen = query.buffer("d").unwrap().values::<i32>();

    query.cancel_handle().cancel();
    assert!(matches!(query.submit(), Err(Error::Cancelled)));
    assert_eq!(query.status(), QueryStatus::Incomplete);

    while query.submit().unwrap() != QueryStatus::Complete {
        seen.extend(query.buffer("d").unwrap().values::<i32>());
    }
    seen.extend(query.buffer("d").unwrap().values::<i32>());
    assert_eq!(seen, (1..=300).collect::<Vec<_>>());
}

#[test]
fn test_stats_snapshot() {
    let ctx = interleaved(25);
    let mut query = ctx.query().with_config(ReaderConfig::new().with_concurrency(2));
    let (columns, _) = read_i32(&mut query, &["d"], 1000);
    assert_eq!(columns[0].len(), 300);

    let json = query.stats().to_json();
    assert_eq!(json["cells_copied"], 300);
    assert_eq!(json["tiles_loaded"], 12);
    assert!(json["rounds"].as_u64().unwrap() >= 1);
    assert!(query.stats().timer_us("copy_slabs").is_some());
}
