//! HNSW graph
//!
//! **Insert**: draw a random top layer, descend greedily from the entry point
//! to that layer, then on every layer below pick neighbours from an
//! `ef_construction`-wide beam with the diversity heuristic and add the
//! reverse edges (pruning neighbours that overflow their capacity).
//!
//! **Remove**: drop the node, strip every edge pointing at it, and re-select
//! neighbours for its former neighbours from the union of their remaining
//! links and the removed node's links, so the graph stays navigable.
//!
//! **Search**: greedy descent to layer 1, then a beam of width
//! `max(ef, k)` on layer 0.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use super::visited::Visited;
use crate::distance::Metric;

/// Read access to the vectors a graph links together, addressed by slot.
pub trait VectorSource {
    fn vector(&self, slot: usize) -> &[f32];
    /// L2 norm of `vector(slot)`, cached by the owner.
    fn norm(&self, slot: usize) -> f32;
}

/// Beam entry, ordered so `BinaryHeap` pops the closest first.
#[derive(Clone, Copy)]
struct Nearest {
    slot: usize,
    distance: f32,
}

impl PartialEq for Nearest {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Nearest {}

impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result entry, ordered so `BinaryHeap` pops the furthest first.
#[derive(Clone, Copy)]
struct Furthest {
    slot: usize,
    distance: f32,
}

impl PartialEq for Furthest {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Furthest {}

impl Ord for Furthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Furthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Hnsw {
    pub(super) nodes: Vec<Node>,
    /// slot -> position in `nodes`
    positions: HashMap<usize, usize>,
    pub(super) entry_point: Option<usize>,
    pub(super) max_layer: usize,
    /// Max neighbours per upper layer.
    pub(super) m: usize,
    /// Max neighbours on layer 0 (2 * m).
    pub(super) m0: usize,
    pub(super) ef_construction: usize,
    /// Level multiplier, 1 / ln(m).
    ml: f64,
    metric: Metric,
    rng: StdRng,
}

impl Hnsw {
    pub fn new(metric: Metric, m: usize, ef_construction: usize, seed: u64) -> Self {
        let m = m.max(2);
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
            ml: 1.0 / (m as f64).ln(),
            metric,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reassemble a graph read back from disk.
    pub(super) fn from_parts(
        metric: Metric,
        nodes: Vec<Node>,
        entry_point: Option<usize>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
        seed: u64,
    ) -> Self {
        let positions = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.slot, idx))
            .collect();
        Self {
            nodes,
            positions,
            entry_point,
            max_layer,
            m,
            m0,
            ef_construction,
            ml: 1.0 / (m.max(2) as f64).ln(),
            metric,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.positions.contains_key(&slot)
    }

    #[inline]
    fn node(&self, slot: usize) -> Option<&Node> {
        self.positions.get(&slot).map(|&idx| &self.nodes[idx])
    }

    #[inline]
    fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    #[inline]
    fn distance_to<S: VectorSource + ?Sized>(
        &self,
        src: &S,
        query: &[f32],
        query_norm: f32,
        slot: usize,
    ) -> f32 {
        self.metric
            .distance(query, query_norm, src.vector(slot), src.norm(slot))
    }

    #[inline]
    fn distance_between<S: VectorSource + ?Sized>(&self, src: &S, a: usize, b: usize) -> f32 {
        self.distance_to(src, src.vector(a), src.norm(a), b)
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-r.ln() * self.ml).floor() as usize).min(u8::MAX as usize - 1)
    }

    /// Link `slot` into the graph. The vector must already be readable
    /// through `src`. Inserting a slot twice is a no-op.
    pub fn insert<S: VectorSource + ?Sized>(&mut self, slot: usize, src: &S) {
        if self.contains(slot) {
            return;
        }
        let query = src.vector(slot);
        let query_norm = src.norm(slot);
        let top_layer = self.random_layer();
        let mut node = Node::new(slot, top_layer);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = top_layer;
            self.positions.insert(slot, self.nodes.len());
            self.nodes.push(node);
            return;
        };

        let mut current = entry;
        for layer in (top_layer + 1..=self.max_layer).rev() {
            if let Some(&(closest, _)) = self
                .search_layer(src, query, query_norm, &[current], 1, layer)
                .first()
            {
                current = closest;
            }
        }

        for layer in (0..=top_layer.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(src, query, query_norm, &[current], self.ef_construction, layer);
            let chosen = self.select_neighbors(src, &candidates, self.capacity(layer));
            for &(neighbor, _) in &chosen {
                node.link(layer, neighbor);
            }
            for &(neighbor, _) in &chosen {
                self.link_back(src, neighbor, slot, layer);
            }
            if let Some(&(closest, _)) = candidates.first() {
                current = closest;
            }
        }

        self.positions.insert(slot, self.nodes.len());
        self.nodes.push(node);
        if top_layer > self.max_layer {
            self.max_layer = top_layer;
            self.entry_point = Some(slot);
        }
    }

    /// Add `new_slot` to `neighbor`'s adjacency on `layer`, pruning with the
    /// diversity heuristic when the list overflows.
    fn link_back<S: VectorSource + ?Sized>(
        &mut self,
        src: &S,
        neighbor: usize,
        new_slot: usize,
        layer: usize,
    ) {
        let Some(&idx) = self.positions.get(&neighbor) else {
            return;
        };
        let capacity = self.capacity(layer);
        let current = self.nodes[idx].neighbors(layer);
        if current.len() < capacity {
            self.nodes[idx].link(layer, new_slot);
            return;
        }

        let mut scored: Vec<(usize, f32)> = current
            .iter()
            .map(|&n| (n, self.distance_between(src, neighbor, n)))
            .collect();
        scored.push((new_slot, self.distance_between(src, neighbor, new_slot)));
        let kept = self.select_neighbors(src, &scored, capacity);
        self.nodes[idx].set_neighbors(layer, kept.into_iter().map(|(n, _)| n).collect());
    }

    /// Unlink `slot` from the graph. Returns false when it was not present.
    pub fn remove<S: VectorSource + ?Sized>(&mut self, slot: usize, src: &S) -> bool {
        let Some(idx) = self.positions.remove(&slot) else {
            return false;
        };
        let removed = self.nodes.swap_remove(idx);
        if let Some(moved) = self.nodes.get(idx) {
            self.positions.insert(moved.slot, idx);
        }
        for node in &mut self.nodes {
            node.unlink(slot);
        }

        for (layer, orphans) in removed.links.iter().enumerate() {
            for &neighbor in orphans {
                let Some(&n_idx) = self.positions.get(&neighbor) else {
                    continue;
                };
                let mut pool: Vec<usize> = self.nodes[n_idx].neighbors(layer).to_vec();
                for &other in orphans {
                    if other != neighbor && !pool.contains(&other) {
                        pool.push(other);
                    }
                }
                let scored: Vec<(usize, f32)> = pool
                    .into_iter()
                    .map(|n| (n, self.distance_between(src, neighbor, n)))
                    .collect();
                let kept = self.select_neighbors(src, &scored, self.capacity(layer));
                self.nodes[n_idx].set_neighbors(layer, kept.into_iter().map(|(n, _)| n).collect());
            }
        }

        if self.entry_point == Some(slot) {
            let replacement = self
                .nodes
                .iter()
                .max_by_key(|node| node.top_layer())
                .map(|node| (node.slot, node.top_layer()));
            match replacement {
                Some((next, layer)) => {
                    self.entry_point = Some(next);
                    self.max_layer = layer;
                }
                None => {
                    self.entry_point = None;
                    self.max_layer = 0;
                }
            }
        }
        true
    }

    /// Beam search on one layer. Returns `(slot, distance)` closest first.
    fn search_layer<S: VectorSource + ?Sized>(
        &self,
        src: &S,
        query: &[f32],
        query_norm: f32,
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)> {
        let mut visited = Visited::new(self.nodes.len());
        let mut candidates: BinaryHeap<Nearest> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Furthest> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.visit(ep) {
                let distance = self.distance_to(src, query, query_norm, ep);
                candidates.push(Nearest { slot: ep, distance });
                results.push(Furthest { slot: ep, distance });
            }
        }

        while let Some(current) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.distance > worst.distance {
                    break;
                }
            }
            let Some(node) = self.node(current.slot) else {
                continue;
            };
            for &neighbor in node.neighbors(layer) {
                if !visited.visit(neighbor) {
                    continue;
                }
                let distance = self.distance_to(src, query, query_norm, neighbor);
                let dominated = results.len() >= ef
                    && results.peek().is_some_and(|worst| distance > worst.distance);
                if dominated {
                    continue;
                }
                candidates.push(Nearest {
                    slot: neighbor,
                    distance,
                });
                results.push(Furthest {
                    slot: neighbor,
                    distance,
                });
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        let mut out: Vec<(usize, f32)> = results.into_iter().map(|r| (r.slot, r.distance)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        out
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the base
    /// than to every neighbour already kept, then top up with the closest
    /// leftovers.
    fn select_neighbors<S: VectorSource + ?Sized>(
        &self,
        src: &S,
        candidates: &[(usize, f32)],
        m: usize,
    ) -> Vec<(usize, f32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut kept: Vec<(usize, f32)> = Vec::with_capacity(m);
        for &(candidate, distance) in &sorted {
            if kept.len() >= m {
                break;
            }
            let diverse = kept
                .iter()
                .all(|&(existing, _)| self.distance_between(src, candidate, existing) >= distance);
            if diverse {
                kept.push((candidate, distance));
            }
        }
        for &(candidate, distance) in &sorted {
            if kept.len() >= m {
                break;
            }
            if !kept.iter().any(|&(slot, _)| slot == candidate) {
                kept.push((candidate, distance));
            }
        }
        kept
    }

    /// Approximate k nearest neighbours: `(slot, distance)` closest first.
    pub fn search<S: VectorSource + ?Sized>(
        &self,
        src: &S,
        query: &[f32],
        query_norm: f32,
        k: usize,
        ef: usize,
    ) -> Vec<(usize, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(closest, _)) = self
                .search_layer(src, query, query_norm, &[current], 1, layer)
                .first()
            {
                current = closest;
            }
        }

        let mut hits = self.search_layer(src, query, query_norm, &[current], ef.max(k), 0);
        hits.truncate(k);
        hits
    }

    pub fn stats(&self) -> HnswStats {
        let mut layer_counts = vec![0usize; self.max_layer + 1];
        let mut total_edges = 0;
        for node in &self.nodes {
            for (layer, links) in node.links.iter().enumerate() {
                if let Some(count) = layer_counts.get_mut(layer) {
                    *count += 1;
                }
                total_edges += links.len();
            }
        }
        HnswStats {
            num_nodes: self.nodes.len(),
            max_layer: self.max_layer,
            layer_counts,
            total_edges,
            m: self.m,
            ef_construction: self.ef_construction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HnswStats {
    pub num_nodes: usize,
    pub max_layer: usize,
    /// Nodes present on each layer.
    pub layer_counts: Vec<usize>,
    pub total_edges: usize,
    pub m: usize,
    pub ef_construction: usize,
}
