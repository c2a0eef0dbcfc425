//! Cell orders.
//!
//! [`GlobalOrder`] is selected once per query from the schema's tile and
//! cell order. Cell-level comparison handles every dimension; tile-level
//! comparison over bounding boxes skips var-sized dimensions.

mod comparator;
mod hilbert;

pub use comparator::{CellCoords, GlobalOrder, MbrLowerCorner};
pub use hilbert::Hilbert;
