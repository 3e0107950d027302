//! Distance metrics
//!
//! Scalar kernels written so LLVM auto-vectorizes them (4 independent
//! accumulators, `chunks_exact`). Every metric exposes two views:
//!
//! - `distance`: smaller is closer; what the graph search minimizes.
//! - `score`: what callers see. Cosine reports similarity (higher is better),
//!   Euclidean reports the distance itself (lower is better).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    Euclidean,
}

impl Metric {
    /// Distance between two vectors given their precomputed L2 norms.
    #[inline]
    pub fn distance(self, a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - cosine_from_parts(dot_product(a, b), a_norm, b_norm),
            Metric::Euclidean => l2_distance(a, b),
        }
    }

    /// Convert a graph distance into the caller-facing score.
    #[inline]
    pub fn score_from_distance(self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::Euclidean => distance,
        }
    }

    /// Order two scores best-first.
    #[inline]
    pub fn compare_scores(self, a: f32, b: f32) -> Ordering {
        match self {
            Metric::Cosine => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
            Metric::Euclidean => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        }
    }

    /// Similarity in which larger always means closer. Cosine similarity is
    /// returned as is; a Euclidean distance `d` maps to `1 / (1 + d)`.
    #[inline]
    pub fn similarity(self, score: f32) -> f32 {
        match self {
            Metric::Cosine => score,
            Metric::Euclidean => 1.0 / (1.0 + score.max(0.0)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric '{other}' (expected cosine or euclidean)")),
        }
    }
}

#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    let mut acc = [0.0f32; 4];
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();
    for (x, y) in a_chunks.zip(b_chunks) {
        acc[0] += x[0] * y[0];
        acc[1] += x[1] * y[1];
        acc[2] += x[2] * y[2];
        acc[3] += x[3] * y[3];
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for (x, y) in a_tail.iter().zip(b_tail) {
        sum += x * y;
    }
    sum
}

#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    let mut acc = [0.0f32; 4];
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();
    for (x, y) in a_chunks.zip(b_chunks) {
        for lane in 0..4 {
            let d = x[lane] - y[lane];
            acc[lane] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for (x, y) in a_tail.iter().zip(b_tail) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// Cosine similarity; zero vectors are treated as orthogonal to everything.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_from_parts(dot_product(a, b), l2_norm(a), l2_norm(b))
}

#[inline]
fn cosine_from_parts(dot: f32, a_norm: f32, b_norm: f32) -> f32 {
    let denom = a_norm * b_norm;
    if denom <= f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// L2 normalize a vector, returning a new vector
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm > f32::EPSILON {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
