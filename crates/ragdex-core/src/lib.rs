//! # ragdex-core
//!
//! Storage half of the ragdex retrieval engine.
//!
//! - [`chunk`]: text chunks and the in-memory [`ChunkStore`]
//! - [`index`]: [`VectorIndex`] with exact scan and HNSW search
//! - [`persist`]: atomic save / verified load of an index generation
//!
//! Nothing here performs network I/O or spawns tasks; embedding and
//! orchestration live in the `ragdex` crate.

pub mod chunk;
pub mod distance;
pub mod error;
pub mod format;
pub mod hnsw;
pub mod index;
pub mod persist;

pub use chunk::{chunk_id, Chunk, ChunkStore, Metadata, MetadataValue};
pub use distance::Metric;
pub use error::{Error, GatewayError, Result};
pub use index::{IndexConfig, SearchConfig, SearchHit, SearchMode, VectorIndex};
pub use persist::{CorpusInfo, EmbeddingProfile, IndexManifest, FORMAT_VERSION};
