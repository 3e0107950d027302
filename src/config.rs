//! Command-line / environment configuration shared by every subcommand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use ragdex_core::{Error, Metric, Result, SearchConfig, SearchMode};

use crate::builder::{BuildOptions, RetryPolicy};
use crate::gateway::{EmbeddingGateway, HashingGateway, OpenAiGateway};

pub const DEFAULT_DATA_DIR: &str = "pdfData";
pub const DEFAULT_INDEX_DIR: &str = ".ragdex/index";
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// OpenAI-compatible HTTP endpoint (needs OPENAI_API_KEY)
    Openai,
    /// Offline feature-hashing embedder
    Hashing,
}

#[derive(Debug, Clone, Args)]
pub struct EmbedderArgs {
    /// Embedding backend
    #[arg(long, global = true, value_enum, default_value = "openai", env = "RAGDEX_EMBEDDER")]
    pub embedder: EmbedderKind,

    /// Embedding model name
    #[arg(long, global = true, default_value = DEFAULT_MODEL, env = "RAGDEX_EMBED_MODEL")]
    pub model: String,

    /// Embedding dimension produced by the model
    #[arg(long, global = true, default_value_t = DEFAULT_DIMENSION, env = "RAGDEX_EMBED_DIMENSION")]
    pub dimension: usize,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, global = true, default_value = DEFAULT_OPENAI_BASE_URL, env = "OPENAI_BASE_URL")]
    pub openai_base_url: String,

    /// API key for the OpenAI embedder
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Timeout for each embedding call, in seconds
    #[arg(long, global = true, default_value_t = 30, env = "RAGDEX_EMBED_TIMEOUT_SECS")]
    pub timeout_secs: u64,
}

impl EmbedderArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn gateway(&self) -> Result<Arc<dyn EmbeddingGateway>> {
        match self.embedder {
            EmbedderKind::Openai => {
                let key = self.openai_api_key.as_deref().ok_or_else(|| {
                    Error::Config("OPENAI_API_KEY is required for --embedder openai".into())
                })?;
                Ok(Arc::new(OpenAiGateway::new(
                    key,
                    &self.openai_base_url,
                    self.model.clone(),
                    self.dimension,
                    self.timeout(),
                )?))
            }
            EmbedderKind::Hashing => {
                if self.dimension == 0 {
                    return Err(Error::Config("embedding dimension must be > 0".into()));
                }
                Ok(Arc::new(HashingGateway::new(self.dimension)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchModeArg {
    Auto,
    Exact,
    Approximate,
}

impl From<SearchModeArg> for SearchMode {
    fn from(value: SearchModeArg) -> Self {
        match value {
            SearchModeArg::Auto => SearchMode::Auto,
            SearchModeArg::Exact => SearchMode::Exact,
            SearchModeArg::Approximate => SearchMode::Approximate,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// Directory of text documents to index
    #[arg(long, default_value = DEFAULT_DATA_DIR, env = "RAGDEX_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Characters per chunk
    #[arg(long, default_value_t = 1024)]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, default_value_t = 200)]
    pub overlap: usize,

    /// Distance metric (cosine or euclidean)
    #[arg(long, default_value = "cosine")]
    pub metric: Metric,

    /// Exact scan, HNSW graph, or switch at --ann-threshold vectors
    #[arg(long, value_enum, default_value = "auto")]
    pub search_mode: SearchModeArg,

    /// Index size at which auto mode switches to the HNSW graph
    #[arg(long, default_value_t = ragdex_core::index::DEFAULT_ANN_THRESHOLD)]
    pub ann_threshold: usize,

    /// HNSW query beam width; higher improves recall, costs latency
    #[arg(long, default_value_t = 64)]
    pub ef_search: usize,

    /// Embedding calls in flight
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Chunks per embedding call
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// Attempts per embedding call before the build aborts
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}

impl BuildArgs {
    pub fn options(&self, embedder: &EmbedderArgs) -> BuildOptions {
        BuildOptions {
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            metric: self.metric,
            search: SearchConfig {
                mode: self.search_mode.into(),
                ann_threshold: self.ann_threshold,
                ef_search: self.ef_search,
                ..SearchConfig::default()
            },
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            timeout: embedder.timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        embedder: EmbedderArgs,
        #[command(flatten)]
        build: BuildArgs,
    }

    #[test]
    fn test_defaults() {
        let cli = TestCli::try_parse_from(["ragdex", "--openai-api-key", "k"]).unwrap();
        assert_eq!(cli.build.chunk_size, 1024);
        assert_eq!(cli.build.overlap, 200);
        assert_eq!(cli.embedder.model, DEFAULT_MODEL);

        let options = cli.build.options(&cli.embedder);
        assert!(options.validate().is_ok());
        assert_eq!(options.search.mode, SearchMode::Auto);
        assert_eq!(options.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_hashing_gateway_needs_no_key() {
        let cli = TestCli::try_parse_from([
            "ragdex",
            "--embedder",
            "hashing",
            "--dimension",
            "32",
            "--metric",
            "euclidean",
        ])
        .unwrap();
        let gateway = cli.embedder.gateway().unwrap();
        assert_eq!(gateway.dimension(), 32);
        assert_eq!(cli.build.options(&cli.embedder).metric, Metric::Euclidean);
    }
}
