//! Tree grid engine behind the heapsight views.
//!
//! [`SortableDataGrid`] keeps a lazily populated tree ordered by a two-key
//! comparator; [`ViewportDataGrid`] adds scroll virtualization on top so
//! that only the rows around the viewport are ever attached.

mod sortable;
mod tree;
mod viewport;

pub use sortable::{Expansion, GridEvent, GridRow, SortOutcome, SortableDataGrid};
pub use tree::{GridNode, NodeId, Population, Tree};
pub use viewport::{Reveal, ViewportConfig, ViewportDataGrid};
