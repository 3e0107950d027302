//! Index Builder: documents in, persisted index generation out.
//!
//! ```text
//! documents ─► corpus hash ─► manifest matches? ── yes ─► return it
//!                                  │ no
//!                                  ▼
//!              chunk ─► embed (≤ concurrency in flight, retried) ─► insert in
//!              chunk order ─► persist::save (temp dir + rename)
//! ```
//!
//! A build that fails or is cancelled writes nothing, so the directory at the
//! target path is always either absent or a complete earlier generation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ragdex_core::persist::{self, CorpusInfo, EmbeddingProfile, IndexManifest};
use ragdex_core::{
    ChunkStore, Error, GatewayError, IndexConfig, Metric, Result, SearchConfig, VectorIndex,
};

use crate::chunker::Chunker;
use crate::gateway::EmbeddingGateway;
use crate::source::Document;

/// Bounded exponential backoff for embedding calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per work unit, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Characters per chunk.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks; must be below `chunk_size`.
    pub overlap: usize,
    pub metric: Metric,
    pub search: SearchConfig,
    /// Embedding calls in flight at once.
    pub concurrency: usize,
    /// Chunks per gateway call.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Per-call gateway timeout; expiry counts as a retryable failure.
    pub timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            overlap: 200,
            metric: Metric::Cosine,
            search: SearchConfig::default(),
            concurrency: 4,
            batch_size: 1,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<()> {
        Chunker::new(self.chunk_size, self.overlap)?;
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("gateway timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// What a build did.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub manifest: IndexManifest,
    /// The persisted generation already matched; nothing was embedded.
    pub reused: bool,
    pub documents: usize,
    pub chunks: usize,
    /// Gateway attempts per chunk id (empty when reused).
    pub attempts: BTreeMap<String, u32>,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn total_attempts(&self) -> u32 {
        self.attempts.values().sum()
    }
}

/// SHA-256 over documents sorted by id; each contributes its id, byte length
/// and content.
pub fn corpus_hash(documents: &[Document]) -> String {
    let mut sorted: Vec<&Document> = documents.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    for doc in sorted {
        hasher.update((doc.id.len() as u64).to_le_bytes());
        hasher.update(doc.id.as_bytes());
        hasher.update((doc.text.len() as u64).to_le_bytes());
        hasher.update(doc.text.as_bytes());
    }
    hex::encode(hasher.finalize())
}

enum UnitError {
    Cancelled,
    Failed { attempts: u32, reason: String },
}

pub struct IndexBuilder {
    gateway: Arc<dyn EmbeddingGateway>,
    options: BuildOptions,
}

impl IndexBuilder {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, options: BuildOptions) -> Result<Self> {
        options.validate()?;
        if gateway.dimension() == 0 {
            return Err(Error::Config("gateway reports dimension 0".into()));
        }
        Ok(Self { gateway, options })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn profile(&self) -> EmbeddingProfile {
        EmbeddingProfile {
            model: self.gateway.model().to_string(),
            chunk_size: self.options.chunk_size,
            overlap: self.options.overlap,
        }
    }

    pub async fn build(&self, documents: &[Document], target: &Path) -> Result<BuildReport> {
        self.build_with_cancel(documents, target, CancellationToken::new())
            .await
    }

    /// Build, stopping before the next embedding attempt once `cancel` fires.
    /// A cancelled build returns [`Error::Cancelled`] and persists nothing.
    pub async fn build_with_cancel(
        &self,
        documents: &[Document],
        target: &Path,
        cancel: CancellationToken,
    ) -> Result<BuildReport> {
        let started = Instant::now();
        let mut seen = HashSet::with_capacity(documents.len());
        if let Some(dup) = documents.iter().find(|d| !seen.insert(d.id.as_str())) {
            return Err(Error::InvalidArgument(format!(
                "duplicate document id {}",
                dup.id
            )));
        }

        if let Err(e) = persist::recover(target) {
            warn!(path = %target.display(), error = %e, "could not restore interrupted save");
        }

        let info = CorpusInfo {
            corpus_hash: corpus_hash(documents),
            embedding: self.profile(),
        };

        if let Some(manifest) = self.reusable_manifest(target, &info) {
            info!(
                path = %target.display(),
                chunks = manifest.chunk_count,
                "corpus unchanged, reusing index"
            );
            return Ok(BuildReport {
                chunks: manifest.chunk_count,
                manifest,
                reused: true,
                documents: documents.len(),
                attempts: BTreeMap::new(),
                elapsed: started.elapsed(),
            });
        }

        let chunker = Chunker::new(self.options.chunk_size, self.options.overlap)?;
        let chunks: Vec<_> = documents.iter().flat_map(|d| chunker.chunk(d)).collect();
        info!(
            documents = documents.len(),
            chunks = chunks.len(),
            concurrency = self.options.concurrency,
            "building index"
        );

        let dimension = self.gateway.dimension();
        let config = IndexConfig::new(dimension, self.options.metric)
            .with_search(self.options.search.clone());
        let mut index = VectorIndex::new(config)?;
        let mut store = ChunkStore::with_capacity(chunks.len());
        let mut attempts = BTreeMap::new();
        let mut succeeded: Vec<String> = Vec::with_capacity(chunks.len());

        let cancel = &cancel;
        let mut results = stream::iter(chunks.chunks(self.options.batch_size).map(|unit| {
            let texts: Vec<String> = unit.iter().map(|c| c.text.clone()).collect();
            async move { self.embed_unit(texts, cancel).await }
        }))
        .buffered(self.options.concurrency);

        let mut units = chunks.chunks(self.options.batch_size);
        while let Some(result) = results.next().await {
            let Some(unit) = units.next() else { break };
            let (vectors, tries) = match result {
                Ok(ok) => ok,
                Err(UnitError::Cancelled) => {
                    info!(embedded = succeeded.len(), "build cancelled");
                    return Err(Error::Cancelled);
                }
                Err(UnitError::Failed { attempts, reason }) => {
                    let reason = match unit {
                        [_] => reason,
                        [first, .., last] => format!(
                            "{reason} (batch of {} chunks {}..{})",
                            unit.len(),
                            first.id,
                            last.id
                        ),
                        [] => reason,
                    };
                    warn!(
                        chunk = %unit[0].id,
                        attempts,
                        embedded = succeeded.len(),
                        reason = %reason,
                        "aborting build"
                    );
                    return Err(Error::BuildFailed {
                        chunk_id: unit[0].id.clone(),
                        attempts,
                        succeeded,
                        reason,
                    });
                }
            };

            for (chunk, vector) in unit.iter().zip(vectors) {
                if vector.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                index.insert(chunk.id.clone(), vector)?;
                store.add(chunk.clone())?;
                attempts.insert(chunk.id.clone(), tries);
                succeeded.push(chunk.id.clone());
            }
            debug!(embedded = succeeded.len(), total = chunks.len(), "embedded unit");
        }
        drop(results);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let manifest = persist_blocking(index, store, info, target.to_path_buf()).await?;
        let elapsed = started.elapsed();
        info!(
            path = %target.display(),
            chunks = manifest.chunk_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "index built"
        );
        Ok(BuildReport {
            manifest,
            reused: false,
            documents: documents.len(),
            chunks: chunks.len(),
            attempts,
            elapsed,
        })
    }

    fn reusable_manifest(&self, target: &Path, info: &CorpusInfo) -> Option<IndexManifest> {
        match persist::read_manifest(target) {
            Ok(manifest) => {
                let matches = manifest.corpus_hash == info.corpus_hash
                    && manifest.embedding == info.embedding
                    && manifest.dimension == self.gateway.dimension()
                    && manifest.metric == self.options.metric
                    && manifest.search == self.options.search;
                if !matches {
                    debug!(path = %target.display(), "manifest is stale, rebuilding");
                }
                matches.then_some(manifest)
            }
            Err(Error::NotFound(_)) => None,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "ignoring unreadable manifest");
                None
            }
        }
    }

    async fn embed_unit(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(Vec<Vec<f32>>, u32), UnitError> {
        let retry = &self.options.retry;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(UnitError::Cancelled);
            }
            attempt += 1;

            let call = async {
                if texts.len() == 1 {
                    self.gateway.embed(&texts[0]).await.map(|v| vec![v])
                } else {
                    self.gateway.embed_many(&texts).await
                }
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(UnitError::Cancelled),
                r = tokio::time::timeout(self.options.timeout, call) => r,
            };
            let err = match outcome {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => return Ok((vectors, attempt)),
                Ok(Ok(vectors)) => GatewayError::Permanent(format!(
                    "gateway returned {} embeddings for {} texts",
                    vectors.len(),
                    texts.len()
                )),
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout(self.options.timeout),
            };

            if !err.is_retryable() || attempt >= retry.max_attempts {
                return Err(UnitError::Failed {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
            let delay = retry.backoff(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "embedding failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(UnitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn persist_blocking(
    index: VectorIndex,
    store: ChunkStore,
    info: CorpusInfo,
    target: PathBuf,
) -> Result<IndexManifest> {
    let result =
        tokio::task::spawn_blocking(move || persist::save(&index, &store, &info, &target)).await;
    match result {
        Ok(inner) => inner,
        Err(e) => Err(Error::Io(std::io::Error::other(format!(
            "persist join error: {e}"
        )))),
    }
}
