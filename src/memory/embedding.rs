//! Vector codec and the OpenAI-compatible embedding client
//!
//! [`VectorCodec`] turns text into a vector of the configured dimension by way
//! of an [`EmbeddingCapability`]. Calls go through the resilience policy under
//! the `embedding` breaker; repeated queries are served from the cache.

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::cache::EmbeddingCache;
use crate::config::EmbeddingConfig;
use crate::core::capability::EmbeddingCapability;
use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;

/// Text-to-vector adapter
#[derive(Clone)]
pub struct VectorCodec {
    capability: Arc<dyn EmbeddingCapability>,
    cache: EmbeddingCache,
    policy: ResiliencePolicy,
    dimensions: usize,
}

impl VectorCodec {
    /// Create a codec; `policy` is bounded by the embedding timeout
    pub fn new(
        capability: Arc<dyn EmbeddingCapability>,
        config: &EmbeddingConfig,
        policy: ResiliencePolicy,
    ) -> Self {
        VectorCodec {
            capability,
            cache: EmbeddingCache::from_config(config),
            policy: policy.with_timeout(config.timeout),
            dimensions: config.dimensions,
        }
    }

    /// Expected vector length
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed `text`.
    ///
    /// Blank text is a validation error; a vector of the wrong length is a
    /// `DimensionMismatch`. Other capability failures surface as
    /// `EmbeddingFailed`, except an open breaker, which stays `CircuitOpen`.
    pub async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("cannot embed empty text".into()));
        }

        if let Some(cached) = self.cache.get(text).await {
            debug!(capability = self.capability.id(), "Embedding cache hit");
            return Ok(cached);
        }

        let vector = self
            .policy
            .call("embedding", || self.capability.embed(text))
            .await
            .map_err(|e| match e {
                Error::EmbeddingFailed(_) | Error::CircuitOpen { .. } => e,
                e if e.is_validation() => e,
                other => Error::EmbeddingFailed(other.to_string()),
            })?;

        if vector.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        self.cache.put(text, vector.clone()).await;
        Ok(vector)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for any OpenAI-compatible `/embeddings` endpoint
#[derive(Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingClient {
    /// Create a new embedding client
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();

        if let Some(ref api_key) = config.api_key {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
                    .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(HttpEmbeddingClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingCapability for HttpEmbeddingClient {
    fn id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
            dimensions: Some(self.dimensions),
        };

        debug!(model = %self.model, chars = text.len(), "Requesting embedding");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.json::<EmbeddingResponse>().await?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::EmbeddingFailed("response contained no embedding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, RetryConfig};
    use crate::resilience::BreakerRegistry;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedding_config(base_url: &str, dimensions: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string().into()),
            model: "test-embed".into(),
            dimensions,
            timeout: Duration::from_secs(5),
            ..EmbeddingConfig::default()
        }
    }

    fn policy() -> ResiliencePolicy {
        let config = ResilienceConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..ResilienceConfig::default()
        };
        ResiliencePolicy::new(&config, Arc::new(BreakerRegistry::new(config.breaker.clone())))
    }

    fn codec(config: &EmbeddingConfig) -> VectorCodec {
        let client = HttpEmbeddingClient::new(config).unwrap();
        VectorCodec::new(Arc::new(client), config, policy())
    }

    #[tokio::test]
    async fn test_encode_parses_response_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "test-embed", "input": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let codec = codec(&embedding_config(&server.uri(), 3));
        assert_eq!(codec.encode("hello").await.unwrap(), vec![0.1, 0.2, 0.3]);
        assert_eq!(codec.encode("hello").await.unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2]}]
            })))
            .mount(&server)
            .await;

        let codec = codec(&embedding_config(&server.uri(), 3));
        let err = codec.encode("hello").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(2)
            .mount(&server)
            .await;

        let codec = codec(&embedding_config(&server.uri(), 3));
        let err = codec.encode("hello").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .expect(1)
            .mount(&server)
            .await;

        let codec = codec(&embedding_config(&server.uri(), 3));
        assert!(matches!(
            codec.encode("hello").await,
            Err(Error::EmbeddingFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_text_is_rejected() {
        let codec = codec(&embedding_config("http://127.0.0.1:9", 3));
        assert!(matches!(codec.encode("   ").await, Err(Error::Validation(_))));
    }
}
