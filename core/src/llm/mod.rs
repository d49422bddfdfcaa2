//! LLM Integration Module
//!
//! Chat-completion and embedding access for the pipeline, wrapped in a
//! fingerprinted response cache with single-flight deduplication, IAM
//! token refresh and a bounded retry policy for transient failures.

pub mod cache;
pub mod token;
pub mod transport;

pub use cache::ResponseCache;
pub use token::TokenHolder;
pub use transport::{FakeTransport, HttpTransport, LlmTransport, TransportError};

use crate::config::AppConfig;
use crate::error::{CopilotError, CopilotResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client construction settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub iam_url: String,
    pub model: String,
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub cache_ttl_s: u64,
    pub embedding_dim: usize,
    /// Remote embedding endpoint; the deterministic fallback is used
    /// when absent or failing.
    pub embedding_url: Option<String>,
    /// Retries after the initial attempt on transient failures.
    pub max_retries: u32,
    /// Base delay of the 1-2-4 backoff progression.
    pub retry_base_delay_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://foundation-models.api.cloud.ru/v1".to_string(),
            iam_url: "https://iam.api.cloud.ru/api/v1/auth/token".to_string(),
            model: "ai-sage/GigaChat3-10B-A1.8B".to_string(),
            key_id: None,
            key_secret: None,
            cache_ttl_s: 3600,
            embedding_dim: 384,
            embedding_url: None,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl LlmSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.llm_base_url.clone(),
            iam_url: config.llm_iam_url.clone(),
            model: config.llm_model.clone(),
            key_id: config.llm_key_id.clone(),
            key_secret: config.llm_key_secret.clone(),
            cache_ttl_s: config.cache_ttl_s,
            embedding_dim: config.embedding_dim,
            embedding_url: None,
            max_retries: config.max_retries.generation,
            retry_base_delay_ms: 1000,
        }
    }
}

/// Token accounting reported by the upstream model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One chat-completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<LlmUsage>,
    /// Transport attempts consumed, 1 when the first call succeeded.
    pub attempts: u32,
}

/// Parameters for one generation call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Overrides the configured default model when set.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: usize,
    pub use_cache: bool,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            user_prompt: String::new(),
            model: None,
            temperature: 0.3,
            max_tokens: 4096,
            use_cache: true,
        }
    }
}

/// LLM client with caching, token refresh and retries.
pub struct LlmClient {
    settings: LlmSettings,
    transport: Arc<dyn LlmTransport>,
    cache: ResponseCache,
    token: Option<TokenHolder>,
}

impl LlmClient {
    pub fn new(settings: LlmSettings, transport: Arc<dyn LlmTransport>) -> Self {
        let cache = ResponseCache::new(Duration::from_secs(settings.cache_ttl_s));
        let token = match (&settings.key_id, &settings.key_secret) {
            (Some(id), Some(secret)) => Some(TokenHolder::new(
                settings.iam_url.clone(),
                id.clone(),
                secret.clone(),
            )),
            _ => None,
        };
        Self {
            settings,
            transport,
            cache,
            token,
        }
    }

    /// Client over the real HTTP transport.
    pub fn with_http(settings: LlmSettings) -> Self {
        Self::new(settings, Arc::new(HttpTransport::new()))
    }

    /// Default model name this client targets.
    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Chat completion through the cache.
    pub async fn generate(&self, params: GenerateParams) -> CopilotResult<LlmResponse> {
        let model = params.model.as_deref().unwrap_or(&self.settings.model);
        let key = ResponseCache::completion_key(&params.system_prompt, &params.user_prompt, model);

        if params.use_cache {
            if let Some(body) = self.cache.get(&key).await {
                let mut response = Self::parse_completion(&body, model)?;
                response.attempts = 0;
                return Ok(response);
            }

            let flight = self.cache.begin_flight(&key).await;
            let _guard = flight.lock().await;
            if let Some(body) = self.cache.get(&key).await {
                self.cache.end_flight(&key).await;
                let mut response = Self::parse_completion(&body, model)?;
                response.attempts = 0;
                return Ok(response);
            }

            let result = self.call_completions(&params, model).await;
            match result {
                Ok((body, attempts)) => {
                    self.cache.put(&key, body.clone()).await;
                    self.cache.end_flight(&key).await;
                    let mut response = Self::parse_completion(&body, model)?;
                    response.attempts = attempts;
                    Ok(response)
                }
                Err(e) => {
                    self.cache.end_flight(&key).await;
                    Err(e)
                }
            }
        } else {
            let (body, attempts) = self.call_completions(&params, model).await?;
            let mut response = Self::parse_completion(&body, model)?;
            response.attempts = attempts;
            Ok(response)
        }
    }

    /// Embedding through the cache, deterministic fallback when no
    /// remote endpoint is configured or the remote call fails. Misses
    /// for the same text collapse into one computation.
    pub async fn embed(&self, text: &str) -> CopilotResult<Vec<f32>> {
        let key = ResponseCache::embedding_key(text);
        if let Some(cached) = self.cache.get(&key).await {
            return Self::parse_embedding(&cached);
        }

        let flight = self.cache.begin_flight(&key).await;
        let _guard = flight.lock().await;
        if let Some(cached) = self.cache.get(&key).await {
            self.cache.end_flight(&key).await;
            return Self::parse_embedding(&cached);
        }

        let vector = match &self.settings.embedding_url {
            Some(url) => match self.call_remote_embedding(url, text).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!("Remote embedding failed, using deterministic fallback: {e}");
                    fallback_embedding(text, self.settings.embedding_dim)
                }
            },
            None => fallback_embedding(text, self.settings.embedding_dim),
        };

        let serialized = serde_json::to_string(&vector)
            .map_err(|e| CopilotError::Permanent(format!("embedding serialization: {e}")))?;
        self.cache.put(&key, serialized).await;
        self.cache.end_flight(&key).await;
        Ok(vector)
    }

    fn parse_embedding(cached: &str) -> CopilotResult<Vec<f32>> {
        serde_json::from_str(cached)
            .map_err(|e| CopilotError::Permanent(format!("cached embedding corrupt: {e}")))
    }

    async fn call_completions(
        &self,
        params: &GenerateParams,
        model: &str,
    ) -> CopilotResult<(String, u32)> {
        let url = format!("{}/chat/completions", self.settings.base_url);

        let mut messages = Vec::new();
        if !params.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": params.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": params.user_prompt}));

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let auth = match &self.token {
            Some(holder) => Some(holder.access_token(self.transport.as_ref()).await?),
            None => None,
        };

        // One initial attempt plus the configured retries.
        let max_attempts = self.settings.max_retries + 1;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let bearer;
            let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/json")];
            if let Some(token) = &auth {
                bearer = format!("Bearer {token}");
                headers.push(("Authorization", &bearer));
            }

            match self.transport.post_json(&url, &headers, &body).await {
                Ok(response) => {
                    info!(model, attempt, "LLM generation successful");
                    return Ok((response, attempt));
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    warn!("LLM call failed (attempt {attempt}): {e}, retrying in {delay}ms");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(CopilotError::Transient(format!(
                        "LLM call failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    return Err(CopilotError::Permanent(format!("LLM call rejected: {e}")));
                }
            }
        }
    }

    async fn call_remote_embedding(&self, url: &str, text: &str) -> CopilotResult<Vec<f32>> {
        let body = json!({"input": text, "model": self.settings.model});
        let response = self
            .transport
            .post_json(url, &[("Content-Type", "application/json")], &body)
            .await
            .map_err(|e| CopilotError::Transient(format!("embedding call failed: {e}")))?;

        let parsed: serde_json::Value = serde_json::from_str(&response)
            .map_err(|e| CopilotError::Permanent(format!("embedding response not JSON: {e}")))?;
        let values = parsed["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| CopilotError::Permanent("embedding response missing vector".into()))?;

        Ok(values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }

    fn parse_completion(body: &str, model: &str) -> CopilotResult<LlmResponse> {
        let parsed: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| CopilotError::Permanent(format!("LLM response was not JSON: {e}")))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CopilotError::Permanent("LLM response missing content".into()))?
            .to_string();

        let usage = parsed.get("usage").map(|usage| LlmUsage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
        });

        debug!("Parsed LLM response ({} bytes of content)", content.len());
        Ok(LlmResponse {
            content,
            model: model.to_string(),
            usage,
            attempts: 1,
        })
    }
}

/// Deterministic SHA-256-derived embedding, L2-normalized.
///
/// Reproducible across processes, which keeps semantic dedup stable in
/// tests and when the remote embedding endpoint is down.
pub fn fallback_embedding(text: &str, dim: usize) -> Vec<f32> {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(text.as_bytes());
    let bytes = digest.as_slice();

    let mut vector: Vec<f32> = (0..dim)
        .map(|i| {
            let byte = bytes[i % bytes.len()] as f32;
            let next = bytes[(i + 1) % bytes.len()] as f32;
            (byte + next * 256.0) / 65535.0
        })
        .collect();

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion_body(content: &str) -> String {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        })
        .to_string()
    }

    fn test_client(transport: Arc<FakeTransport>) -> LlmClient {
        let settings = LlmSettings {
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        LlmClient::new(settings, transport)
    }

    #[tokio::test]
    async fn test_generate_parses_content_and_usage() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion_body("def test_a(): pass"));
        let client = test_client(transport);

        let response = client
            .generate(GenerateParams {
                user_prompt: "generate".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.content, "def test_a(): pass");
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 30);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion_body("cached answer"));
        let client = test_client(transport.clone());

        let params = GenerateParams {
            system_prompt: "sys".into(),
            user_prompt: "user".into(),
            ..Default::default()
        };
        let first = client.generate(params.clone()).await.unwrap();
        let second = client.generate(params).await.unwrap();

        assert_eq!(first.content, second.content);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(second.attempts, 0);
    }

    #[tokio::test]
    async fn test_cache_equivalence_with_and_without_cache() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok(&completion_body("same answer"));
        transport.push_ok(&completion_body("same answer"));
        let client = test_client(transport);

        let cached = client
            .generate(GenerateParams {
                user_prompt: "q".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let uncached = client
            .generate(GenerateParams {
                user_prompt: "q".into(),
                use_cache: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(cached.content, uncached.content);
    }

    #[tokio::test]
    async fn test_retries_transient_failures_then_succeeds() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_status(503, "unavailable");
        transport.push_status(503, "unavailable");
        transport.push_status(503, "unavailable");
        transport.push_ok(&completion_body("finally"));
        let client = test_client(transport.clone());

        let response = client
            .generate(GenerateParams {
                user_prompt: "retry me".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.content, "finally");
        assert_eq!(response.attempts, 4);
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_transient_error() {
        let transport = Arc::new(FakeTransport::new());
        for _ in 0..4 {
            transport.push_status(503, "unavailable");
        }
        let client = test_client(transport);

        let err = client
            .generate(GenerateParams {
                user_prompt: "doomed".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_permanent_without_retry() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_status(400, "bad request");
        let client = test_client(transport.clone());

        let err = client
            .generate(GenerateParams {
                user_prompt: "bad".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CopilotError::Permanent(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_embedding_is_deterministic_and_normalized() {
        let transport = Arc::new(FakeTransport::new());
        let client = test_client(transport.clone());

        let a = client.embed("def test_login(): assert True").await.unwrap();
        let b = client.embed("def test_login(): assert True").await.unwrap();

        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
        // No remote endpoint configured, so the transport is never hit.
        assert_eq!(transport.call_count(), 0);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_different_texts_embed_differently() {
        let client = test_client(Arc::new(FakeTransport::new()));
        let a = client.embed("first test body").await.unwrap();
        let b = client.embed("completely different body").await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fallback_embedding_dimension() {
        let vector = fallback_embedding("anything", 384);
        assert_eq!(vector.len(), 384);
    }
}
