//! Embedding service client.
//!
//! The transport is the `EmbeddingApi` trait; `EmbeddingClient` layers the
//! operational contract on top: batch caps, inter-batch pacing, and a single
//! retry after a rate-limit-shaped failure.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{EngineError, Result};

#[async_trait]
pub trait EmbeddingApi: Send + Sync {
    /// Embed up to one batch of texts, returning one fixed-dimension vector
    /// per input, in order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A failure the embedding provider signals when throttling.
fn is_rate_limited(err: &EngineError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("429") || msg.contains("rate limit")
}

/// Batching/retry wrapper around an `EmbeddingApi`. Process-wide singleton;
/// its internal pacing is the only throttle on embedding traffic.
pub struct EmbeddingClient {
    api: Arc<dyn EmbeddingApi>,
    model: String,
    max_batch_size: usize,
    batch_delay: Duration,
}

impl EmbeddingClient {
    pub fn new(api: Arc<dyn EmbeddingApi>, config: &Config) -> Self {
        Self {
            api,
            model: config.ai.embedding_model.clone(),
            max_batch_size: config.index.max_embedding_batch_size,
            batch_delay: config.index.embedding_batch_delay,
        }
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let vectors = self.embed_many(&texts).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Ai("embedding service returned no vectors".to_string()))
    }

    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(self.max_batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            let vectors = match self.api.embed(&self.model, batch).await {
                Ok(vectors) => vectors,
                Err(err) if is_rate_limited(&err) => {
                    tracing::warn!("embedding rate limit hit, retrying batch after delay");
                    tokio::time::sleep(self.batch_delay * 2).await;
                    self.api.embed(&self.model, batch).await?
                }
                Err(err) => return Err(err),
            };

            if vectors.len() != batch.len() {
                return Err(EngineError::Ai(format!(
                    "embedding service returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            all.extend(vectors);
        }

        Ok(all)
    }
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::Internal(format!("http client construction failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl EmbeddingApi for HttpEmbeddingClient {
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({"model": model, "input": texts}))
            .send()
            .await
            .map_err(|e| EngineError::Ai(format!("embedding request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Ai(format!("failed to read embedding response: {e}")))?;

        if !status.is_success() {
            let preview: String = body.chars().take(300).collect();
            return Err(EngineError::Ai(format!(
                "embedding request failed (HTTP {status}): {preview}"
            )));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::Ai(format!("failed to parse embedding response: {e}")))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Fails the first `failures` calls with the given error message, then
    /// returns unit vectors. Records batch sizes.
    struct FlakyApi {
        failures: Mutex<usize>,
        message: String,
        batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingApi for FlakyApi {
        async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batch_sizes.lock().push(texts.len());
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(EngineError::Ai(self.message.clone()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn client_with(api: FlakyApi, max_batch: usize) -> EmbeddingClient {
        let mut config = Config::default();
        config.index.max_embedding_batch_size = max_batch;
        config.index.embedding_batch_delay = Duration::from_millis(1);
        EmbeddingClient::new(Arc::new(api), &config)
    }

    #[tokio::test]
    async fn test_batches_respect_cap() {
        let api = FlakyApi {
            failures: Mutex::new(0),
            message: String::new(),
            batch_sizes: Mutex::new(Vec::new()),
        };
        let batch_sizes = Arc::new(api);
        let client = EmbeddingClient::new(batch_sizes.clone(), &{
            let mut c = Config::default();
            c.index.max_embedding_batch_size = 2;
            c.index.embedding_batch_delay = Duration::from_millis(1);
            c
        });

        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let vectors = client.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(*batch_sizes.batch_sizes.lock(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_once() {
        let client = client_with(
            FlakyApi {
                failures: Mutex::new(1),
                message: "HTTP 429 too many requests".to_string(),
                batch_sizes: Mutex::new(Vec::new()),
            },
            10,
        );
        let vectors = client.embed_many(&["a".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retry_is_single() {
        let client = client_with(
            FlakyApi {
                failures: Mutex::new(2),
                message: "rate limit exceeded".to_string(),
                batch_sizes: Mutex::new(Vec::new()),
            },
            10,
        );
        assert!(client.embed_many(&["a".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_non_rate_limit_error_propagates() {
        let client = client_with(
            FlakyApi {
                failures: Mutex::new(1),
                message: "connection refused".to_string(),
                batch_sizes: Mutex::new(Vec::new()),
            },
            10,
        );
        assert!(client.embed_many(&["a".to_string()]).await.is_err());
    }
}
