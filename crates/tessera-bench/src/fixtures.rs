//! Fragment generation for benchmarks.
//!
//! Data is drawn from a seeded RNG so runs are reproducible.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_core::{ArraySchema, Attribute, Datatype, Dimension, Layout, MemFragmentBuilder};

/// Upper bound of the benchmark dimension domain.
pub const DOMAIN: i64 = 10_000_000;

/// Scale factor for benchmark data generation.
#[derive(Clone, Copy, Debug, Default)]
pub enum Scale {
    /// A few thousand cells, for quick iteration.
    Tiny,
    Small,
    /// ~500k cells across fragments.
    #[default]
    Medium,
    Large,
}

impl Scale {
    /// Number of fragments.
    pub fn fragments(&self) -> usize {
        match self {
            Scale::Tiny => 2,
            Scale::Small => 4,
            Scale::Medium => 8,
            Scale::Large => 16,
        }
    }

    /// Cells per fragment.
    pub fn cells_per_fragment(&self) -> usize {
        match self {
            Scale::Tiny => 1_000,
            Scale::Small => 10_000,
            Scale::Medium => 60_000,
            Scale::Large => 250_000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scale::Tiny => "tiny",
            Scale::Small => "small",
            Scale::Medium => "medium",
            Scale::Large => "large",
        }
    }
}

/// One Int64 dimension, an Int64 attribute and a string attribute.
pub fn bench_schema(layout: Layout, allows_dups: bool) -> ArraySchema {
    ArraySchema::new(layout)
        .with_dimension(Dimension::new("d", Datatype::Int64, [0.0, DOMAIN as f64]))
        .with_attribute(Attribute::new("a", Datatype::Int64))
        .with_attribute(Attribute::var("s", Datatype::StringAscii))
        .with_allows_dups(allows_dups)
}

/// Build a fragment of `cells` random coordinates.
///
/// Coordinates are unique inside the fragment unless the schema allows
/// duplicates. Fragments with different seeds overlap at random.
pub fn generate_fragment(
    schema: &Arc<ArraySchema>,
    index: usize,
    cells: usize,
    seed: u64,
) -> MemFragmentBuilder {
    let mut rng = StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9e37_79b9));
    let mut coords: Vec<i64> = (0..cells).map(|_| rng.gen_range(0..DOMAIN)).collect();
    if !schema.allows_dups {
        coords.sort_unstable();
        coords.dedup();
    }
    let values: Vec<i64> = coords.iter().map(|d| d * 2 + index as i64).collect();
    let strings: Vec<String> = coords
        .iter()
        .map(|d| format!("v{}", d % 1000))
        .collect();
    let strings: Vec<&str> = strings.iter().map(String::as_str).collect();

    MemFragmentBuilder::new(Arc::clone(schema), format!("frag_{index}"), index as u64 + 1)
        .tile_capacity(1_000)
        .dim("d", &coords)
        .attr("a", &values)
        .attr_str("s", &strings)
}
