//! On-disk index generations.
//!
//! A generation is a directory:
//!
//! ```text
//! <index dir>/
//!   manifest.json   IndexManifest (pretty JSON)
//!   vectors.bin     see [`crate::format`]
//!   chunks.jsonl    one Chunk per line, same order as vectors.bin
//!   graph.bin       HNSW adjacency, only when the index uses the graph
//! ```
//!
//! [`save`] writes the whole generation into a hidden sibling directory and
//! renames it over the final path, so readers see either the previous
//! generation or the new one. [`load`] verifies checksums, counts, dimension
//! and id sets before handing anything back.
//!
//! The previous generation is moved to `.<name>.old-<suffix>` before the new
//! one is renamed in, so for a moment nothing exists at the final path. A
//! crash in that moment strands the last complete generation there; [`load`]
//! falls back to reading it and [`recover`] moves it back.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkStore};
use crate::distance::Metric;
use crate::error::{Error, Result};
use crate::format::{read_vector_file, FormatError, VectorFileWriter};
use crate::hnsw::Hnsw;
use crate::index::{IndexConfig, SearchConfig, VectorIndex};

/// Version written into every manifest. Anything else is refused on load.
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const VECTORS_FILE: &str = "vectors.bin";
pub const CHUNKS_FILE: &str = "chunks.jsonl";
pub const GRAPH_FILE: &str = "graph.bin";

/// How the chunks of a generation were produced. Two builds with equal
/// profiles over the same corpus produce the same index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingProfile {
    pub model: String,
    pub chunk_size: usize,
    pub overlap: usize,
}

/// Caller-supplied provenance recorded alongside the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusInfo {
    pub corpus_hash: String,
    pub embedding: EmbeddingProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub dimension: usize,
    pub metric: Metric,
    pub chunk_count: usize,
    pub corpus_hash: String,
    pub embedding: EmbeddingProfile,
    #[serde(default)]
    pub search: SearchConfig,
    pub created_at: i64,
    pub vectors_sha256: String,
    pub chunks_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_sha256: Option<String>,
}

impl IndexManifest {
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig::new(self.dimension, self.metric).with_search(self.search.clone())
    }
}

/// Persist `index` and `store` as one generation at `path`, replacing any
/// generation already there.
///
/// Every vector id must have a chunk and vice versa; otherwise nothing is
/// written and [`Error::InconsistentIndex`] is returned.
pub fn save(
    index: &VectorIndex,
    store: &ChunkStore,
    info: &CorpusInfo,
    path: &Path,
) -> Result<IndexManifest> {
    check_consistent(index, store)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidArgument(format!("index path {path:?} has no file name")))?;
    let parent = parent_dir(path);
    std::fs::create_dir_all(&parent)?;
    recover(path)?;

    let suffix = random_suffix();
    let staging = parent.join(format!(".{name}.tmp-{suffix}"));
    std::fs::create_dir(&staging)?;

    let manifest = match write_generation(index, store, info, &staging) {
        Ok(manifest) => manifest,
        Err(e) => {
            discard(&staging);
            return Err(e);
        }
    };

    if let Err(e) = swap_into_place(&staging, path, &parent, &format!(".{name}.old-{suffix}")) {
        discard(&staging);
        return Err(e);
    }

    info!(
        path = %path.display(),
        chunks = manifest.chunk_count,
        dimension = manifest.dimension,
        graph = manifest.graph_sha256.is_some(),
        "saved index generation"
    );
    Ok(manifest)
}

fn check_consistent(index: &VectorIndex, store: &ChunkStore) -> Result<()> {
    if index.len() != store.len() {
        return Err(Error::InconsistentIndex(format!(
            "{} vectors but {} chunks",
            index.len(),
            store.len()
        )));
    }
    if let Some((id, _)) = index.iter().find(|(id, _)| !store.contains(id)) {
        return Err(Error::InconsistentIndex(format!("vector {id} has no chunk")));
    }
    Ok(())
}

fn write_generation(
    index: &VectorIndex,
    store: &ChunkStore,
    info: &CorpusInfo,
    dir: &Path,
) -> Result<IndexManifest> {
    let vectors_path = dir.join(VECTORS_FILE);
    let mut writer = VectorFileWriter::create(&vectors_path, index.dimension()).map_err(write_err)?;
    for (id, vector) in index.iter() {
        writer.write_record(id, vector).map_err(write_err)?;
    }
    writer.finish().map_err(write_err)?;

    let chunks_path = dir.join(CHUNKS_FILE);
    {
        let mut out = BufWriter::new(File::create(&chunks_path)?);
        for (id, _) in index.iter() {
            serde_json::to_writer(&mut out, store.get(id)?)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    sync_file(&chunks_path)?;

    let graph_sha256 = match index.graph() {
        Some(graph) => {
            let positions: HashMap<usize, u32> = index
                .live_slots()
                .enumerate()
                .map(|(pos, slot)| (slot, pos as u32))
                .collect();
            let graph_path = dir.join(GRAPH_FILE);
            let mut out = BufWriter::new(File::create(&graph_path)?);
            graph.serialize(&mut out, |slot| positions.get(&slot).copied())?;
            out.flush()?;
            drop(out);
            sync_file(&graph_path)?;
            Some(sha256_file(&graph_path)?)
        }
        None => None,
    };

    let manifest = IndexManifest {
        format_version: FORMAT_VERSION,
        dimension: index.dimension(),
        metric: index.metric(),
        chunk_count: index.len(),
        corpus_hash: info.corpus_hash.clone(),
        embedding: info.embedding.clone(),
        search: index.config().search.clone(),
        created_at: now_unix_ts(),
        vectors_sha256: sha256_file(&vectors_path)?,
        chunks_sha256: sha256_file(&chunks_path)?,
        graph_sha256,
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    sync_file(&manifest_path)?;
    sync_dir(dir)?;
    Ok(manifest)
}

/// Move `staging` to `path`. A previous generation is renamed aside first and
/// deleted once the new one is in place; if the final rename fails it is put
/// back.
fn swap_into_place(staging: &Path, path: &Path, parent: &Path, backup_name: &str) -> Result<()> {
    let backup = if path.exists() {
        let backup = parent.join(backup_name);
        std::fs::rename(path, &backup)?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, path) {
        if let Some(backup) = &backup {
            if let Err(restore_err) = std::fs::rename(backup, path) {
                warn!(error = %restore_err, backup = %backup.display(), "failed to restore previous index");
            }
        }
        return Err(e.into());
    }
    sync_dir(parent)?;

    if let Some(backup) = backup {
        if let Err(e) = std::fs::remove_dir_all(&backup) {
            warn!(error = %e, backup = %backup.display(), "failed to remove previous index");
        }
    }
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Most recent `.<name>.old-*` sibling of `path` that holds a manifest.
fn stranded_generation(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    let prefix = format!(".{name}.old-");
    std::fs::read_dir(parent_dir(path))
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .map(|entry| entry.path())
        .filter(|dir| dir.join(MANIFEST_FILE).is_file())
        .max_by_key(|dir| std::fs::metadata(dir).and_then(|m| m.modified()).ok())
}

/// Move a generation stranded by an interrupted [`save`] back to `path`.
/// Returns whether anything was moved. Does nothing while `path` exists.
pub fn recover(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let Some(stranded) = stranded_generation(path) else {
        return Ok(false);
    };
    std::fs::rename(&stranded, path)?;
    sync_dir(&parent_dir(path))?;
    warn!(
        path = %path.display(),
        from = %stranded.display(),
        "restored index generation left by an interrupted save"
    );
    Ok(true)
}

fn write_err(e: FormatError) -> Error {
    match e {
        FormatError::Io(e) => Error::Io(e),
        other => Error::InvalidArgument(format!("cannot write {VECTORS_FILE}: {other}")),
    }
}

fn discard(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(error = %e, dir = %dir.display(), "failed to remove staging directory");
    }
}

/// Read only the manifest of the generation at `path`.
pub fn read_manifest(path: &Path) -> Result<IndexManifest> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(Error::NotFound(format!("manifest {}", manifest_path.display())));
    }
    parse_manifest(&std::fs::read(&manifest_path)?)
}

/// The version field is checked before anything else is interpreted, so a
/// newer layout reports `UnsupportedVersion` instead of a parse error.
fn parse_manifest(bytes: &[u8]) -> Result<IndexManifest> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::CorruptStore(format!("manifest is not valid JSON: {e}")))?;
    let version = value
        .get("format_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::CorruptStore("manifest has no format_version".into()))?;
    if version != u64::from(FORMAT_VERSION) {
        return Err(Error::UnsupportedVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            supported: FORMAT_VERSION,
        });
    }
    serde_json::from_value(value).map_err(|e| Error::CorruptStore(format!("manifest: {e}")))
}

/// Load and verify the generation at `path`.
///
/// When `path` is missing but a save left the previous generation aside,
/// that generation is read in place without moving it.
pub fn load(path: &Path) -> Result<(VectorIndex, ChunkStore, IndexManifest)> {
    if path.exists() {
        return load_dir(path);
    }
    let Some(stranded) = stranded_generation(path) else {
        return Err(Error::NotFound(format!("index {}", path.display())));
    };
    debug!(path = %path.display(), from = %stranded.display(), "reading set-aside generation");
    match load_dir(&stranded) {
        Ok(loaded) => Ok(loaded),
        // the swap finished while we were reading
        Err(_) if path.exists() => load_dir(path),
        Err(e) => Err(e),
    }
}

fn load_dir(path: &Path) -> Result<(VectorIndex, ChunkStore, IndexManifest)> {
    let manifest = match read_manifest(path) {
        Err(Error::NotFound(what)) => {
            return Err(Error::CorruptStore(format!("{what} is missing")));
        }
        other => other?,
    };

    let vectors_path = path.join(VECTORS_FILE);
    let chunks_path = path.join(CHUNKS_FILE);
    verify_checksum(&vectors_path, &manifest.vectors_sha256)?;
    verify_checksum(&chunks_path, &manifest.chunks_sha256)?;

    let (header, records) = read_vector_file(&vectors_path)
        .map_err(|e| Error::CorruptStore(format!("{VECTORS_FILE}: {e}")))?;
    if header.dimensions as usize != manifest.dimension {
        return Err(Error::CorruptStore(format!(
            "manifest declares dimension {} but vectors have {}",
            manifest.dimension, header.dimensions
        )));
    }
    if records.len() != manifest.chunk_count {
        return Err(Error::CorruptStore(format!(
            "manifest declares {} chunks but {VECTORS_FILE} holds {}",
            manifest.chunk_count,
            records.len()
        )));
    }

    let store = read_chunks(&chunks_path, manifest.chunk_count)?;
    if store.len() != manifest.chunk_count {
        return Err(Error::CorruptStore(format!(
            "manifest declares {} chunks but {CHUNKS_FILE} holds {}",
            manifest.chunk_count,
            store.len()
        )));
    }
    if let Some((id, _)) = records.iter().find(|(id, _)| !store.contains(id)) {
        return Err(Error::CorruptStore(format!(
            "vector {id} has no matching chunk"
        )));
    }

    let graph = read_graph(path, &manifest)?;
    let index = VectorIndex::restore(manifest.index_config(), records, graph).map_err(|e| match e {
        Error::CorruptStore(_) => e,
        other => Error::CorruptStore(other.to_string()),
    })?;

    info!(
        path = %path.display(),
        chunks = index.len(),
        dimension = index.dimension(),
        metric = %index.metric(),
        "loaded index generation"
    );
    Ok((index, store, manifest))
}

fn read_chunks(path: &Path, expected: usize) -> Result<ChunkStore> {
    let reader = BufReader::new(File::open(path)?);
    let mut store = ChunkStore::with_capacity(expected.min(1 << 20));
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line).map_err(|e| {
            Error::CorruptStore(format!("{CHUNKS_FILE} line {}: {e}", lineno + 1))
        })?;
        store.add(chunk).map_err(|e| {
            Error::CorruptStore(format!("{CHUNKS_FILE} line {}: {e}", lineno + 1))
        })?;
    }
    Ok(store)
}

fn read_graph(path: &Path, manifest: &IndexManifest) -> Result<Option<Hnsw>> {
    let Some(expected) = manifest.graph_sha256.as_deref() else {
        return Ok(None);
    };
    let graph_path = path.join(GRAPH_FILE);
    if !graph_path.is_file() {
        return Err(Error::CorruptStore(format!("{GRAPH_FILE} is missing")));
    }
    verify_checksum(&graph_path, expected)?;
    let mut reader = BufReader::new(File::open(&graph_path)?);
    let graph = Hnsw::deserialize(
        &mut reader,
        manifest.metric,
        manifest.chunk_count,
        manifest.search.seed,
    )
    .map_err(|e| Error::CorruptStore(format!("{GRAPH_FILE}: {e}")))?;
    debug!(nodes = graph.len(), "loaded hnsw graph");
    Ok(Some(graph))
}

fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    if !path.is_file() {
        return Err(Error::CorruptStore(format!("{} is missing", path.display())));
    }
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(Error::CorruptStore(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn sync_file(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn now_unix_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
