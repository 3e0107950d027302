//! Query side: embed, search, apply cutoff, map ids back to chunks.
//!
//! The retriever serves one immutable generation at a time. [`Retriever::reload`]
//! loads the generation currently on disk and swaps it in atomically; queries
//! already running keep the generation they started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use ragdex_core::persist::{self, IndexManifest};
use ragdex_core::{Chunk, ChunkStore, Error, GatewayError, Result, VectorIndex};

use crate::builder::{BuildOptions, BuildReport, IndexBuilder};
use crate::gateway::EmbeddingGateway;
use crate::source::DocumentSource;

pub const DEFAULT_TOP_K: usize = 3;

/// A retrieved chunk and its score as reported by the index (cosine
/// similarity, or Euclidean distance).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

struct Generation {
    index: VectorIndex,
    store: ChunkStore,
    manifest: Option<IndexManifest>,
}

pub struct Retriever {
    gateway: Arc<dyn EmbeddingGateway>,
    current: ArcSwap<Generation>,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl Retriever {
    /// Serve an in-memory index. `reload` is unavailable for such retrievers.
    pub fn new(
        gateway: Arc<dyn EmbeddingGateway>,
        index: VectorIndex,
        store: ChunkStore,
    ) -> Result<Self> {
        check_dimension(gateway.as_ref(), &index)?;
        Ok(Self {
            gateway,
            current: ArcSwap::from_pointee(Generation {
                index,
                store,
                manifest: None,
            }),
            path: None,
            timeout: Duration::from_secs(30),
        })
    }

    /// Load the generation persisted at `path`.
    pub fn open(gateway: Arc<dyn EmbeddingGateway>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let generation = load_generation(gateway.as_ref(), &path)?;
        Ok(Self {
            gateway,
            current: ArcSwap::from_pointee(generation),
            path: Some(path),
            timeout: Duration::from_secs(30),
        })
    }

    /// Load the index at `path`, building it from `source` first if no
    /// generation exists there yet.
    pub async fn open_or_build(
        gateway: Arc<dyn EmbeddingGateway>,
        source: &dyn DocumentSource,
        path: impl Into<PathBuf>,
        options: BuildOptions,
    ) -> Result<(Self, Option<BuildReport>)> {
        let path = path.into();
        let report = match persist::read_manifest(&path) {
            Ok(_) => None,
            Err(Error::NotFound(_)) => {
                info!(path = %path.display(), "no index found, building");
                let documents = source.documents()?;
                let builder = IndexBuilder::new(gateway.clone(), options.clone())?;
                Some(builder.build(&documents, &path).await?)
            }
            Err(e) => return Err(e),
        };
        let retriever = Self::open(gateway, path)?.with_timeout(options.timeout);
        Ok((retriever, report))
    }

    /// Bound on the query embedding call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn manifest(&self) -> Option<IndexManifest> {
        self.current.load().manifest.clone()
    }

    pub fn len(&self) -> usize {
        self.current.load().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in the generation currently persisted at the retriever's path.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("retriever was not opened from a path".into()))?;
        let generation = load_generation(self.gateway.as_ref(), path)?;
        let chunks = generation.index.len();
        self.current.store(Arc::new(generation));
        info!(path = %path.display(), chunks, "reloaded index");
        Ok(())
    }

    /// Up to `top_k` chunks, best first. With a cutoff, hits whose similarity
    /// is below it are dropped (Euclidean distances `d` are compared as
    /// `1 / (1 + d)`). An empty result is not an error.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        similarity_cutoff: Option<f32>,
    ) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be > 0".into()));
        }

        let embedding = match tokio::time::timeout(self.timeout, self.gateway.embed(text)).await {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Timeout(self.timeout).into()),
        };

        let generation = self.current.load_full();
        let metric = generation.index.metric();
        let hits = generation.index.search(&embedding, top_k, metric)?;
        let found = hits.len();

        let mut out = Vec::with_capacity(found);
        for hit in hits {
            if let Some(cutoff) = similarity_cutoff {
                if metric.similarity(hit.score) < cutoff {
                    continue;
                }
            }
            let chunk = generation.store.get(&hit.id).map_err(|_| {
                Error::InconsistentIndex(format!("vector {} has no chunk", hit.id))
            })?;
            out.push(ScoredChunk {
                chunk: chunk.clone(),
                score: hit.score,
            });
        }
        debug!(found, kept = out.len(), top_k, "query served");
        Ok(out)
    }
}

fn check_dimension(gateway: &dyn EmbeddingGateway, index: &VectorIndex) -> Result<()> {
    if gateway.dimension() != index.dimension() {
        return Err(Error::Config(format!(
            "index holds {}-d vectors but gateway {} produces {}-d",
            index.dimension(),
            gateway.model(),
            gateway.dimension()
        )));
    }
    Ok(())
}

fn load_generation(gateway: &dyn EmbeddingGateway, path: &Path) -> Result<Generation> {
    let (index, store, manifest) = persist::load(path)?;
    check_dimension(gateway, &index)?;
    if manifest.embedding.model != gateway.model() {
        warn!(
            index_model = %manifest.embedding.model,
            gateway_model = %gateway.model(),
            "index was built with a different embedding model"
        );
    }
    Ok(Generation {
        index,
        store,
        manifest: Some(manifest),
    })
}
