//! Vector index: chunk id -> embedding, with exact or graph-accelerated
//! nearest-neighbour search.
//!
//! # Exact vs approximate
//!
//! Exact search scans every vector: recall is 1.0 and latency grows linearly
//! with the index (roughly 10 ms per 100k 768-d vectors on one core).
//! The HNSW graph answers in roughly logarithmic time, but may miss true
//! neighbours; recall rises with `ef_search` at the cost of latency
//! (`benches/search.rs` measures both). [`SearchMode::Auto`] scans until the
//! index reaches `ann_threshold` vectors and switches to the graph from then
//! on; the graph is kept once built even if removals shrink the index.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::distance::{l2_norm, Metric};
use crate::error::{Error, Result};
use crate::hnsw::{Hnsw, HnswStats, VectorSource};

pub const DEFAULT_ANN_THRESHOLD: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Exact below `ann_threshold` vectors, HNSW at or above it.
    Auto,
    /// Always scan every vector.
    Exact,
    /// Always maintain and query the HNSW graph.
    Approximate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub mode: SearchMode,
    pub ann_threshold: usize,
    /// Max graph neighbours per node on upper layers (layer 0 gets 2x).
    pub m: usize,
    /// Beam width while inserting; higher builds a better graph, slower.
    pub ef_construction: usize,
    /// Beam width while querying; the main recall/latency knob.
    pub ef_search: usize,
    /// Seed for layer assignment, so rebuilds are reproducible.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Auto,
            ann_threshold: DEFAULT_ANN_THRESHOLD,
            m: 16,
            ef_construction: 100,
            ef_search: 64,
            seed: 0x5eed_cafe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimension: usize,
    pub metric: Metric,
    #[serde(default)]
    pub search: SearchConfig,
}

impl IndexConfig {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            search: SearchConfig::default(),
        }
    }

    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::Config("embedding dimension must be > 0".into()));
        }
        if self.search.m < 2 {
            return Err(Error::Config(format!(
                "hnsw m must be >= 2, got {}",
                self.search.m
            )));
        }
        if self.search.ef_construction == 0 || self.search.ef_search == 0 {
            return Err(Error::Config("hnsw ef values must be > 0".into()));
        }
        Ok(())
    }
}

/// One ranked search result. For cosine `score` is the similarity
/// (higher first); for Euclidean it is the distance (lower first).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    vector: Vec<f32>,
    norm: f32,
}

/// Slot table view handed to the graph.
struct Slots<'a>(&'a [Option<Entry>]);

impl VectorSource for Slots<'_> {
    #[inline]
    fn vector(&self, slot: usize) -> &[f32] {
        // Vacated slots are unlinked from the graph before they are cleared.
        self.0[slot].as_ref().map(|e| e.vector.as_slice()).unwrap_or(&[])
    }

    #[inline]
    fn norm(&self, slot: usize) -> f32 {
        self.0[slot].as_ref().map(|e| e.norm).unwrap_or(0.0)
    }
}

pub struct VectorIndex {
    config: IndexConfig,
    slots: Vec<Option<Entry>>,
    by_id: HashMap<String, usize>,
    graph: Option<Hnsw>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("uses_graph", &self.uses_graph())
            .finish()
    }
}

impl VectorIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            slots: Vec::new(),
            by_id: HashMap::new(),
            graph: None,
        })
    }

    /// Rebuild an index from persisted parts. `entries` are in slot order and
    /// `graph`, when present, addresses them by position.
    pub(crate) fn restore(
        config: IndexConfig,
        entries: Vec<(String, Vec<f32>)>,
        graph: Option<Hnsw>,
    ) -> Result<Self> {
        let mut index = Self::new(config)?;
        index.slots.reserve(entries.len());
        for (id, vector) in entries {
            index.check_vector(&vector)?;
            if index.by_id.contains_key(&id) {
                return Err(Error::DuplicateId(id));
            }
            index.by_id.insert(id.clone(), index.slots.len());
            let norm = l2_norm(&vector);
            index.slots.push(Some(Entry { id, vector, norm }));
        }
        match graph {
            Some(graph) if graph.len() != index.slots.len() => {
                return Err(Error::CorruptStore(format!(
                    "graph holds {} nodes for {} vectors",
                    graph.len(),
                    index.slots.len()
                )));
            }
            Some(graph) => index.graph = Some(graph),
            None => index.ensure_graph(),
        }
        Ok(index)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.by_id
            .get(id)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(|e| e.vector.as_slice())
    }

    /// Whether queries currently go through the HNSW graph.
    pub fn uses_graph(&self) -> bool {
        self.graph.is_some() && self.config.search.mode != SearchMode::Exact
    }

    pub(crate) fn graph(&self) -> Option<&Hnsw> {
        self.graph.as_ref()
    }

    /// Layer and edge counts of the HNSW graph, if one is maintained.
    pub fn graph_stats(&self) -> Option<HnswStats> {
        self.graph.as_ref().map(Hnsw::stats)
    }

    /// Live `(id, embedding)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|e| (e.id.as_str(), e.vector.as_slice()))
    }

    /// Live slots in ascending order, for serialization.
    pub(crate) fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|_| slot))
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidArgument(
                "embedding contains NaN or infinite components".into(),
            ));
        }
        Ok(())
    }

    fn wants_graph(&self) -> bool {
        match self.config.search.mode {
            SearchMode::Exact => false,
            SearchMode::Approximate => true,
            SearchMode::Auto => self.len() >= self.config.search.ann_threshold,
        }
    }

    /// Build the graph over every live slot if the mode calls for one.
    fn ensure_graph(&mut self) {
        if self.graph.is_some() || !self.wants_graph() {
            return;
        }
        let search = &self.config.search;
        let mut graph = Hnsw::new(self.config.metric, search.m, search.ef_construction, search.seed);
        let source = Slots(&self.slots);
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                graph.insert(slot, &source);
            }
        }
        tracing::debug!(vectors = graph.len(), "built hnsw graph");
        self.graph = Some(graph);
    }

    /// Add an embedding. Existing ids must be removed first; there is no
    /// silent overwrite.
    pub fn insert(&mut self, id: impl Into<String>, embedding: Vec<f32>) -> Result<()> {
        let id = id.into();
        self.check_vector(&embedding)?;
        if self.by_id.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let slot = self.slots.len();
        let norm = l2_norm(&embedding);
        self.by_id.insert(id.clone(), slot);
        self.slots.push(Some(Entry {
            id,
            vector: embedding,
            norm,
        }));

        match self.graph.as_mut() {
            Some(graph) => graph.insert(slot, &Slots(&self.slots)),
            None => self.ensure_graph(),
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        let slot = self
            .by_id
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("vector {id}")))?;
        if let Some(graph) = self.graph.as_mut() {
            graph.remove(slot, &Slots(&self.slots));
        }
        self.slots[slot] = None;

        if self.slots.len() >= 64 && self.by_id.len() * 2 < self.slots.len() {
            self.compact();
        }
        Ok(())
    }

    /// Drop vacated slots. The graph, if any, is rebuilt over the new
    /// numbering.
    fn compact(&mut self) {
        let had_graph = self.graph.take().is_some();
        self.slots.retain(Option::is_some);
        self.by_id = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (e.id.clone(), slot)))
            .collect();
        if had_graph {
            let search = &self.config.search;
            let mut graph =
                Hnsw::new(self.config.metric, search.m, search.ef_construction, search.seed);
            let source = Slots(&self.slots);
            for slot in 0..self.slots.len() {
                graph.insert(slot, &source);
            }
            self.graph = Some(graph);
        }
    }

    /// Up to `k` nearest ids, best first; equal scores break by ascending id.
    ///
    /// `metric` must match the metric the index was created with.
    pub fn search(&self, query: &[f32], k: usize, metric: Metric) -> Result<Vec<SearchHit>> {
        if metric != self.config.metric {
            return Err(Error::Config(format!(
                "index uses {} but search asked for {}",
                self.config.metric, metric
            )));
        }
        self.check_vector(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = l2_norm(query);
        let mut hits = match self.graph.as_ref() {
            Some(graph) if self.uses_graph() && k < self.len() => {
                let ef = self.config.search.ef_search.max(k);
                graph
                    .search(&Slots(&self.slots), query, query_norm, k, ef)
                    .into_iter()
                    .filter_map(|(slot, distance)| {
                        self.slots[slot].as_ref().map(|e| SearchHit {
                            id: e.id.clone(),
                            score: metric.score_from_distance(distance),
                        })
                    })
                    .collect()
            }
            _ => self.scan(query, query_norm, k),
        };

        hits.sort_by(|a, b| self.rank(a, b));
        hits.truncate(k);
        Ok(hits)
    }

    fn scan(&self, query: &[f32], query_norm: f32, k: usize) -> Vec<SearchHit> {
        let metric = self.config.metric;
        let mut scored: Vec<(f32, &str)> = self
            .slots
            .iter()
            .flatten()
            .map(|e| {
                let distance = metric.distance(query, query_norm, &e.vector, e.norm);
                (metric.score_from_distance(distance), e.id.as_str())
            })
            .collect();

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, |a, b| {
                metric.compare_scores(a.0, b.0).then_with(|| a.1.cmp(b.1))
            });
            scored.truncate(k);
        }
        scored
            .into_iter()
            .map(|(score, id)| SearchHit {
                id: id.to_string(),
                score,
            })
            .collect()
    }

    fn rank(&self, a: &SearchHit, b: &SearchHit) -> Ordering {
        self.config
            .metric
            .compare_scores(a.score, b.score)
            .then_with(|| a.id.cmp(&b.id))
    }
}
