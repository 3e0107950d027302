#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ragdex::{Document, EmbeddingGateway, GatewayError, HashingGateway};

/// Hashing embedder that counts calls per text and can be told to fail or
/// stall on specific texts.
pub struct FakeGateway {
    inner: HashingGateway,
    dimension: usize,
    calls: Mutex<HashMap<String, u32>>,
    failures: Mutex<HashMap<String, (u32, GatewayError)>>,
    stalls: Mutex<HashMap<String, (u32, Duration)>>,
    short_batches: Mutex<bool>,
}

impl FakeGateway {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: HashingGateway::new(dimension),
            dimension,
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            short_batches: Mutex::new(false),
        }
    }

    /// Report `dimension` but return vectors of the inner embedder's length.
    pub fn lying(dimension: usize, actual: usize) -> Self {
        Self {
            inner: HashingGateway::new(actual),
            ..Self::new(dimension)
        }
    }

    pub fn fail(&self, text: &str, times: u32, err: GatewayError) {
        self.failures.lock().insert(text.to_string(), (times, err));
    }

    pub fn stall(&self, text: &str, times: u32, duration: Duration) {
        self.stalls.lock().insert(text.to_string(), (times, duration));
    }

    /// Drop the last vector of every multi-text reply.
    pub fn short_batches(&self) {
        *self.short_batches.lock() = true;
    }

    pub fn calls_for(&self, text: &str) -> u32 {
        self.calls.lock().get(text).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl EmbeddingGateway for FakeGateway {
    fn model(&self) -> &str {
        "fake-hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        *self.calls.lock().entry(text.to_string()).or_insert(0) += 1;

        let failure = {
            let mut failures = self.failures.lock();
            match failures.get_mut(text) {
                Some((remaining, err)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(err.clone())
                }
                _ => None,
            }
        };
        if let Some(err) = failure {
            return Err(err);
        }

        let stall = {
            let mut stalls = self.stalls.lock();
            match stalls.get_mut(text) {
                Some((remaining, duration)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*duration)
                }
                _ => None,
            }
        };
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        Ok(self.inner.embed_sync(text))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        if texts.len() > 1 && *self.short_batches.lock() {
            out.pop();
        }
        Ok(out)
    }
}

/// Fixed text → vector table; unknown texts are rejected.
pub struct TableGateway {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl TableGateway {
    pub fn new(dimension: usize, entries: &[(&str, &[f32])]) -> Self {
        Self {
            dimension,
            vectors: entries
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingGateway for TableGateway {
    fn model(&self) -> &str {
        "table"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| GatewayError::Permanent(format!("no vector for {text:?}")))
    }
}

/// `n` single-chunk documents `doc-0..doc-n` with text `text number i`.
pub fn corpus(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::new(format!("doc-{i}"), format!("text number {i}")))
        .collect()
}
