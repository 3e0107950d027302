//! Text chunks and the in-memory chunk store.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Scalar metadata value attached to a document or chunk.
///
/// Keys the engine does not know about are carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A bounded span of source text; the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    /// Position of this chunk within its document, starting at 0.
    pub ordinal: u32,
    /// Character offset of the first character in the source document.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(
        document_id: impl Into<String>,
        ordinal: u32,
        text: impl Into<String>,
        start: usize,
        end: usize,
        metadata: Metadata,
    ) -> Self {
        let document_id = document_id.into();
        let text = text.into();
        Self {
            id: chunk_id(&document_id, ordinal, &text),
            document_id,
            text,
            ordinal,
            start,
            end,
            metadata,
        }
    }
}

/// Stable content-derived identifier: the same document, position and text
/// always hash to the same id.
pub fn chunk_id(document_id: &str, ordinal: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((document_id.len() as u64).to_le_bytes());
    hasher.update(document_id.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// In-memory chunk store keyed by chunk id, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    by_id: HashMap<String, usize>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(capacity),
            by_id: HashMap::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, chunk: Chunk) -> Result<()> {
        if self.by_id.contains_key(&chunk.id) {
            return Err(Error::DuplicateId(chunk.id));
        }
        self.by_id.insert(chunk.id.clone(), self.chunks.len());
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Chunk> {
        self.by_id
            .get(id)
            .map(|&idx| &self.chunks[idx])
            .ok_or_else(|| Error::NotFound(format!("chunk {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Every chunk in insertion order. Call again to restart.
    pub fn all(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
