//! Concurrent B-link tree over the LodeStore engine stack
//!
//! An ordered map that keeps one tree node per store record and leans on
//! the engine's compare-and-swap for all coordination: no tree-level
//! locks, no latch coupling. Readers that race a node split follow the
//! node's right-sibling link to the moved half; writers that lose a swap
//! retry from the root. Because the engine is a trait object, the same
//! tree runs over a plain record store, a write-ahead log, a write-behind
//! cache, or a snapshot view without changing a line here.

mod node;
mod tree;

pub use tree::{BTree, Iter};
