//! ragdex CLI
//!
//! # Usage
//!
//! ```bash
//! # Index every text file under ./pdfData
//! ragdex build --data-dir pdfData --index-dir .ragdex/index
//!
//! # Ask a question; build the index first if none exists yet
//! ragdex query "What is the refund policy?" --top-k 3 --build-if-missing
//!
//! # Inspect a persisted index
//! ragdex stats --index-dir .ragdex/index
//!
//! # Offline run with the hashing embedder
//! ragdex --embedder hashing --dimension 256 build
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ragdex::config::{BuildArgs, EmbedderArgs, DEFAULT_INDEX_DIR};
use ragdex::retriever::DEFAULT_TOP_K;
use ragdex::{DirectorySource, DocumentSource, IndexBuilder, Retriever};
use ragdex_core::persist;

#[derive(Parser)]
#[command(name = "ragdex")]
#[command(about = "Build and query a persistent retrieval index over text documents")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    embedder: EmbedderArgs,

    /// Index directory
    #[arg(long, global = true, default_value = DEFAULT_INDEX_DIR, env = "RAGDEX_INDEX_DIR")]
    index_dir: PathBuf,

    /// Also append logs to this file
    #[arg(long, global = true, env = "RAGDEX_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, embed and persist a document directory (no-op if unchanged)
    Build {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Retrieve the chunks most similar to a question
    Query {
        /// Question text
        text: String,

        /// Maximum number of chunks to return
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        /// Drop chunks whose similarity is below this value
        #[arg(long)]
        cutoff: Option<f32>,

        /// Build the index from --data-dir when none exists yet
        #[arg(long)]
        build_if_missing: bool,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Display the manifest and shape of a persisted index
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ragdex::telemetry::init(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Build { build } => {
            let gateway = cli.embedder.gateway()?;
            let documents = DirectorySource::new(&build.data_dir)
                .documents()
                .with_context(|| format!("loading documents from {:?}", build.data_dir))?;
            let builder = IndexBuilder::new(gateway, build.options(&cli.embedder))?;
            let report = builder
                .build(&documents, &cli.index_dir)
                .await
                .with_context(|| format!("building index at {:?}", cli.index_dir))?;

            if report.reused {
                println!(
                    "Index at {:?} is up to date ({} chunks)",
                    cli.index_dir, report.chunks
                );
            } else {
                println!(
                    "Indexed {} documents into {} chunks in {:.2?} ({} embedding attempts)",
                    report.documents,
                    report.chunks,
                    report.elapsed,
                    report.total_attempts()
                );
            }
        }

        Commands::Query {
            text,
            top_k,
            cutoff,
            build_if_missing,
            build,
        } => {
            let gateway = cli.embedder.gateway()?;
            let retriever = if build_if_missing {
                let source = DirectorySource::new(&build.data_dir);
                let (retriever, report) = Retriever::open_or_build(
                    gateway,
                    &source,
                    &cli.index_dir,
                    build.options(&cli.embedder),
                )
                .await?;
                if let Some(report) = report {
                    tracing::info!(chunks = report.chunks, "built missing index");
                }
                retriever
            } else {
                Retriever::open(gateway, &cli.index_dir)
                    .with_context(|| format!("opening index at {:?}", cli.index_dir))?
                    .with_timeout(cli.embedder.timeout())
            };

            let results = retriever.query(&text, top_k, cutoff).await?;
            if results.is_empty() {
                println!("No relevant chunks found.");
            }
            for (rank, hit) in results.iter().enumerate() {
                println!(
                    "[{}] score={:.4} {}#{}",
                    rank + 1,
                    hit.score,
                    hit.chunk.document_id,
                    hit.chunk.ordinal
                );
                println!("{}\n", hit.chunk.text.trim());
            }
        }

        Commands::Stats => {
            let (index, store, manifest) = persist::load(&cli.index_dir)
                .with_context(|| format!("loading index at {:?}", cli.index_dir))?;
            let documents: std::collections::BTreeSet<_> =
                store.all().map(|c| c.document_id.as_str()).collect();

            println!("Index: {:?}", cli.index_dir);
            println!("  Format version: {}", manifest.format_version);
            println!("  Chunks: {}", index.len());
            println!("  Documents: {}", documents.len());
            println!("  Dimensions: {}", index.dimension());
            println!("  Metric: {}", index.metric());
            println!(
                "  Search: {:?} (HNSW graph in use: {})",
                manifest.search.mode,
                index.uses_graph()
            );
            if let Some(stats) = index.graph_stats() {
                println!(
                    "  HNSW: {} nodes, {} layers, {} edges (m={}, ef_construction={})",
                    stats.num_nodes,
                    stats.max_layer + 1,
                    stats.total_edges,
                    stats.m,
                    stats.ef_construction
                );
                for (layer, count) in stats.layer_counts.iter().enumerate() {
                    println!("    Layer {layer}: {count} nodes");
                }
            }
            println!("  Model: {}", manifest.embedding.model);
            println!(
                "  Chunking: {} chars, {} overlap",
                manifest.embedding.chunk_size, manifest.embedding.overlap
            );
            println!("  Corpus hash: {}", manifest.corpus_hash);
            println!("  Created at: {}", manifest.created_at);
        }
    }

    Ok(())
}
