//! Context compressor
//!
//! Reduces retrieved chunks plus the query into a bounded context through a
//! generative capability. When the capability is disabled, fails, times out or
//! answers with nothing, a deterministic local reduction is used instead, so
//! [`ContextCompressor::compress`] never returns an error.

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CompressionConfig;
use crate::core::capability::{CompressionCapability, ReduceRequest};
use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;

/// Approximate characters per token, used to size the fallback
const CHARS_PER_TOKEN: usize = 4;

/// Terms listed in the fallback's key-terms line
const KEY_TERM_COUNT: usize = 8;

const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

/// A retrieved piece of text with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub score: f32,
}

impl Chunk {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Chunk {
            text: text.into(),
            score,
        }
    }
}

/// How the final context was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// The generative capability answered
    Compressed,
    /// Local deterministic reduction
    Fallback,
}

/// Compressor output
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub text: String,
    pub outcome: CompressionOutcome,
}

/// Reduces retrieved chunks into a bounded context
#[derive(Clone)]
pub struct ContextCompressor {
    capability: Option<Arc<dyn CompressionCapability>>,
    policy: ResiliencePolicy,
    min_chunk_chars: usize,
    fallback_char_budget: usize,
}

impl ContextCompressor {
    /// Create a compressor; with no capability every call uses the fallback
    pub fn new(
        capability: Option<Arc<dyn CompressionCapability>>,
        config: &CompressionConfig,
        policy: ResiliencePolicy,
    ) -> Self {
        ContextCompressor {
            capability: capability.filter(|_| config.enabled),
            policy: policy.with_timeout(config.timeout),
            min_chunk_chars: config.min_chunk_chars,
            fallback_char_budget: config.fallback_char_budget,
        }
    }

    /// Drop chunks shorter than the minimum length
    pub fn filter_chunks(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        chunks
            .into_iter()
            .filter(|c| c.text.trim().chars().count() >= self.min_chunk_chars)
            .collect()
    }

    /// Compress `chunks` for `query`, falling back locally on any failure
    pub async fn compress(
        &self,
        query: &str,
        chunks: Vec<Chunk>,
        max_tokens: usize,
        temperature: f32,
    ) -> Compressed {
        let chunks = self.filter_chunks(chunks);
        if chunks.is_empty() {
            return Compressed {
                text: String::new(),
                outcome: CompressionOutcome::Fallback,
            };
        }

        match self.try_compress(query, &chunks, max_tokens, temperature).await {
            Ok(text) => Compressed {
                text,
                outcome: CompressionOutcome::Compressed,
            },
            Err(e) => {
                warn!(error = %e, chunks = chunks.len(), "Compression failed, using local fallback");
                Compressed {
                    text: self.fallback(query, &chunks, max_tokens),
                    outcome: CompressionOutcome::Fallback,
                }
            }
        }
    }

    /// Call the generative capability once, under the `compression` breaker
    pub async fn try_compress(
        &self,
        query: &str,
        chunks: &[Chunk],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let Some(capability) = &self.capability else {
            return Err(Error::CompressionFailed("compression disabled".into()));
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let request = ReduceRequest {
            query,
            chunks: &texts,
            max_tokens,
            temperature,
        };

        let text = self
            .policy
            .call("compression", || capability.reduce(request))
            .await
            .map_err(|e| match e {
                Error::CompressionFailed(_) => e,
                other => Error::CompressionFailed(other.to_string()),
            })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(Error::CompressionFailed("model returned empty output".into()));
        }

        info!(
            capability = capability.id(),
            chunks = chunks.len(),
            chars = text.len(),
            "Context compressed"
        );
        Ok(text.to_string())
    }

    /// Deterministic local reduction.
    ///
    /// Chunks are taken best-first up to `min(max_tokens * 4, fallback_char_budget)`
    /// characters, then a key-terms line is appended if it still fits.
    pub fn fallback(&self, query: &str, chunks: &[Chunk], max_tokens: usize) -> String {
        let budget = max_tokens
            .max(1)
            .saturating_mul(CHARS_PER_TOKEN)
            .min(self.fallback_char_budget.max(1));

        let mut ranked: Vec<&Chunk> = chunks.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let body = ranked
            .iter()
            .map(|c| c.text.trim())
            .collect::<Vec<_>>()
            .join(CHUNK_SEPARATOR);
        let mut text = truncate_chars(&body, budget).to_string();

        let terms = key_terms(query, &ranked);
        if !terms.is_empty() {
            let line = format!("\n\nKey terms: {}", terms.join(", "));
            if text.chars().count() + line.chars().count() <= budget {
                text.push_str(&line);
            }
        }

        debug!(budget, chars = text.len(), "Fallback context built");
        text
    }
}

/// Longest prefix of `text` with at most `max_chars` characters
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Most frequent words in the chunks, query words first, ties alphabetical
fn key_terms(query: &str, chunks: &[&Chunk]) -> Vec<String> {
    let words = |text: &str| -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 4)
            .map(str::to_lowercase)
            .collect()
    };

    let query_words = words(query);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for chunk in chunks {
        for word in words(&chunk.text) {
            *counts.entry(word).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a, ca), (b, cb)| {
        query_words
            .contains(b)
            .cmp(&query_words.contains(a))
            .then(cb.cmp(ca))
            .then(a.cmp(b))
    });
    ranked
        .into_iter()
        .take(KEY_TERM_COUNT)
        .map(|(w, _)| w)
        .collect()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

const SYSTEM_PROMPT: &str = "You condense retrieved conversation excerpts into context for a new query. \
Keep facts, decisions, commands and file names that bear on the query. Drop everything else. \
Answer with the condensed context only.";

/// Client for any OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct ChatCompressionClient {
    client: Client,
    base_url: String,
    model: String,
}

impl ChatCompressionClient {
    /// Create a new compression client
    pub fn new(config: &CompressionConfig) -> Result<Self> {
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

        Ok(ChatCompressionClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompressionCapability for ChatCompressionClient {
    fn id(&self) -> &str {
        &self.model
    }

    async fn reduce(&self, request: ReduceRequest<'_>) -> Result<String> {
        let excerpts = request
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n\n");

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: format!("Query: {}\n\nExcerpts:\n{}", request.query, excerpts),
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, chunks = request.chunks.len(), "Sending compression request");

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response.json::<ChatResponse>().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::CompressionFailed("response contained no choices".into()))
    }
}
