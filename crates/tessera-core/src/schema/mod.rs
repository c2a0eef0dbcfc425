//! Array schema types.
//!
//! The read core only consumes schemas; defining and evolving them happens
//! elsewhere.

mod array;
mod datatype;

pub use array::{ArraySchema, Attribute, Dimension, FieldInfo, FieldKind, Layout};
pub use datatype::{decode_values, encode_values, Datatype, FixedValue};

/// Per-cell write timestamps.
pub const TIMESTAMPS: &str = "__timestamps";

/// Timestamp of the delete condition covering a cell.
pub const DELETE_TIMESTAMPS: &str = "__delete_timestamps";

/// Index of the delete condition covering a cell.
pub const DELETE_CONDITION_INDEX: &str = "__delete_condition_index";

/// Field name of the zipped coordinate tile in legacy fragments.
pub const COORDS: &str = "__coords";

/// Current fragment format version.
pub const FORMAT_VERSION: u32 = 20;

/// Fragments at or below this version store coordinates zipped.
pub const ZIPPED_COORDS_MAX_VERSION: u32 = 4;

/// First format version that can carry per-cell timestamps.
pub const CELL_TIMESTAMPS_MIN_VERSION: u32 = 14;

/// Value of the delete timestamp and condition index outputs for cells no
/// delete applies to.
pub const NOT_DELETED: u64 = u64::MAX;
