//! Hierarchical Navigable Small World graph for approximate search.
//!
//! ```text
//! Layer 2: o-----------------------o            (few nodes, long hops)
//!          |                       |
//! Layer 1: o-------o---------o-----o
//!          |       |         |     |
//! Layer 0: o--o--o-o--o--o---o--o--o--o         (every node)
//! ```
//!
//! The graph stores only slots and adjacency; vectors stay in the owning
//! [`crate::index::VectorIndex`] and are read through [`VectorSource`].

mod index;
mod node;
mod serialize;
mod visited;

pub use index::{Hnsw, HnswStats, VectorSource};
pub use node::Node;
