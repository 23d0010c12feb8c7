//! Coverage view over the run record history.
//!
//! Nothing here is persisted: every call reduces the append-only history to "latest record per
//! pair" and derives the summary from that.

pub mod matrix;
pub mod universe;

pub use matrix::build_matrix;
pub use universe::{resolve_universe, Universe};
