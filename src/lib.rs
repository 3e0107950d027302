//! ragdex: a retrieval engine for retrieval-augmented generation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │  DocumentSource          │        │  Retriever               │
//! │  (text files on disk)    │        │  query → top-k chunks    │
//! └────────────┬─────────────┘        └────────────▲─────────────┘
//!              │                                   │ ArcSwap<generation>
//!              ▼                                   │
//! ┌──────────────────────────┐        ┌────────────┴─────────────┐
//! │  IndexBuilder            │───────►│  persist (ragdex-core)   │
//! │  chunk → embed → insert  │  save  │  manifest + vectors +    │
//! └────────────┬─────────────┘        │  chunks (+ graph)        │
//!              │                      └──────────────────────────┘
//!              ▼
//! ┌──────────────────────────┐
//! │  EmbeddingGateway        │
//! │  OpenAI / hashing        │
//! └──────────────────────────┘
//! ```

pub mod builder;
pub mod chunker;
pub mod config;
pub mod gateway;
pub mod retriever;
pub mod source;
pub mod telemetry;

pub use builder::{corpus_hash, BuildOptions, BuildReport, IndexBuilder, RetryPolicy};
pub use chunker::Chunker;
pub use gateway::{EmbeddingGateway, HashingGateway, OpenAiGateway};
pub use retriever::{Retriever, ScoredChunk};
pub use source::{DirectorySource, Document, DocumentSource};

pub use ragdex_core::{
    Chunk, ChunkStore, Error, GatewayError, IndexConfig, IndexManifest, Metadata, MetadataValue,
    Metric, Result, SearchConfig, SearchMode, VectorIndex,
};
