//! Benchmark harness helpers.

use std::sync::Arc;

use tessera_core::{
    ArraySchema, Layout, MemFragment, MemTileSource, QueryBuffer, QueryLayout, QueryStatus,
    ReaderConfig, SparseQuery, TileSource,
};
use tracing::debug;

use crate::fixtures::{bench_schema, generate_fragment, Scale};

/// Fragments of one generated array.
pub struct BenchContext {
    pub schema: Arc<ArraySchema>,
    pub fragments: Vec<Arc<MemFragment>>,
}

impl BenchContext {
    /// Generate `scale` fragments with a fixed seed.
    pub fn with_scale(scale: Scale, layout: Layout, allows_dups: bool) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let schema = Arc::new(bench_schema(layout, allows_dups));
        let fragments = (0..scale.fragments())
            .map(|i| {
                let fragment = generate_fragment(&schema, i, scale.cells_per_fragment(), 42)
                    .build()
                    .expect("generated fragment is valid");
                Arc::new(fragment)
            })
            .collect::<Vec<_>>();
        debug!(fragments = fragments.len(), scale = scale.name(), "Generated bench array");
        Self { schema, fragments }
    }

    /// A fresh query over every fragment.
    pub fn query(&self, layout: QueryLayout, config: ReaderConfig) -> SparseQuery {
        let source = Arc::new(MemTileSource::new(self.fragments.clone()));
        let metadata = source.metadata();
        let source: Arc<dyn TileSource> = source;
        SparseQuery::new(Arc::clone(&self.schema), metadata, source)
            .with_layout(layout)
            .with_config(config)
    }

    pub fn total_cells(&self) -> u64 {
        self.fragments.iter().map(|f| f.total_cells()).sum()
    }
}

/// Read `d`, `a` and `s` until complete with `cells`-sized buffers.
///
/// Returns the number of cells read.
pub fn read_all(query: &mut SparseQuery, cells: usize) -> u64 {
    query.set_buffer("d", QueryBuffer::fixed::<i64>(cells)).expect("buffer d");
    query.set_buffer("a", QueryBuffer::fixed::<i64>(cells)).expect("buffer a");
    query
        .set_buffer("s", QueryBuffer::var(cells * 8, cells * 4))
        .expect("buffer s");

    let mut total = 0;
    loop {
        let status = query.submit().expect("submit");
        total += query.buffer("d").map_or(0, |b| b.values::<i64>().len() as u64);
        if status == QueryStatus::Complete {
            return total;
        }
    }
}
