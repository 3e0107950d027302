//! Embedding gateways: text in, fixed-length vector out.
//!
//! [`OpenAiGateway`] talks to any OpenAI-compatible `/embeddings` endpoint.
//! [`HashingGateway`] is a deterministic offline embedder used by tests and
//! by `--embedder hashing`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ragdex_core::distance::l2_normalized;
use ragdex_core::{Error, GatewayError, Result};

#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Model identifier recorded in the index manifest.
    fn model(&self) -> &str;

    /// Length of every vector this gateway returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, GatewayError>;

    /// Embeddings for `texts`, in the same order.
    async fn embed_many(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, GatewayError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Async client for OpenAI-compatible embedding endpoints.
///
/// No retries happen here; the caller decides via [`GatewayError::is_retryable`].
#[derive(Clone)]
pub struct OpenAiGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OpenAiGateway {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let model = model.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("missing OpenAI API key".into()));
        }
        if model.trim().is_empty() {
            return Err(Error::Config("missing embedding model name".into()));
        }
        if dimension == 0 {
            return Err(Error::Config("embedding dimension must be > 0".into()));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| Error::Config("OpenAI API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimension,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

fn classify_status(status: StatusCode, body: String) -> GatewayError {
    let msg = format!("embeddings request failed ({status}): {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::Transient(msg)
    } else {
        GatewayError::Permanent(msg)
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::Permanent(err.to_string())
    } else {
        GatewayError::Transient(err.to_string())
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAiGateway {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, GatewayError> {
        let mut out = self.embed_many(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| GatewayError::Permanent("empty embedding response".into()))
    }

    async fn embed_many(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, body));
        }

        let mut parsed: EmbeddingResponse = resp.json().await.map_err(classify_transport)?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(GatewayError::Permanent(format!(
                "endpoint returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// Feature-hashing embedder: every lowercase word and word bigram is hashed
/// into one of `dimension` buckets with a hash-derived sign, then the vector
/// is L2-normalized. Texts sharing words land close under cosine.
#[derive(Debug, Clone)]
pub struct HashingGateway {
    model: String,
    dimension: usize,
}

impl HashingGateway {
    pub fn new(dimension: usize) -> Self {
        Self {
            model: format!("hashing-{dimension}"),
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            self.accumulate(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), 0.5);
        }
        l2_normalized(&vector)
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingGateway for HashingGateway {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, GatewayError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragdex_core::distance::{cosine_similarity, l2_norm};

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let gateway = HashingGateway::new(64);
        let a = gateway.embed_sync("The quick brown fox");
        let b = gateway.embed_sync("the QUICK brown fox!");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_similar_texts_score_higher() {
        let gateway = HashingGateway::new(256);
        let q = gateway.embed_sync("vector index persistence");
        let near = gateway.embed_sync("persistence of the vector index");
        let far = gateway.embed_sync("banana bread recipe with walnuts");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_hashing_empty_text_is_zero_vector() {
        let gateway = HashingGateway::new(8);
        assert!(gateway.embed_sync("  ...  ").iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn test_default_embed_many_preserves_order() {
        let gateway = HashingGateway::new(16);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = gateway.embed_many(&texts).await.unwrap();
        assert_eq!(out[0], gateway.embed_sync("alpha"));
        assert_eq!(out[1], gateway.embed_sync("beta"));
    }

    #[test]
    fn test_openai_requires_key() {
        assert!(matches!(
            OpenAiGateway::new(" ", "https://api.openai.com/v1", "m", 8, Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
        let gw = OpenAiGateway::new("k", "http://localhost:1/v1/", "m", 8, Duration::from_secs(1))
            .unwrap();
        assert_eq!(gw.endpoint(), "http://localhost:1/v1/embeddings");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_retryable());
    }
}
