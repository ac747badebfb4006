use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

pub mod json;

/// Which model route a request should take. Providers may map several
/// kinds onto one model; the kind also labels the request in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Planner,
    MemoryExtraction,
    ValueAssessment,
    QueryPlanning,
    AntiInjection,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Planner => "planner",
            RequestKind::MemoryExtraction => "memory_extraction",
            RequestKind::ValueAssessment => "value_assessment",
            RequestKind::QueryPlanning => "query_planning",
            RequestKind::AntiInjection => "anti_injection",
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub request: RequestKind,
}

impl GenerateOptions {
    pub fn for_request(request: RequestKind) -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            request,
        }
    }

    /// Low-temperature variant for constrained-JSON generation.
    pub fn constrained(request: RequestKind) -> Self {
        Self {
            temperature: 0.3,
            max_tokens: None,
            request,
        }
    }
}

/// Text-generation backend. Callers own their timeouts
/// (`tokio::time::timeout`) so a hung provider cannot stall a worker.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

/// Embedding backend with a fixed output dimension discovered at init.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

// ── OpenAI-compatible HTTP adapter ────────────────────────────────────────────

/// Route table: request kind → model name. Kinds without an entry use
/// the default chat model.
#[derive(Debug, Clone, Default)]
pub struct ModelRoutes {
    routes: HashMap<RequestKind, String>,
}

impl ModelRoutes {
    pub fn with_route(mut self, kind: RequestKind, model: impl Into<String>) -> Self {
        self.routes.insert(kind, model.into());
        self
    }

    fn resolve<'a>(&'a self, kind: RequestKind, default: &'a str) -> &'a str {
        self.routes.get(&kind).map(String::as_str).unwrap_or(default)
    }
}

/// Chat + embeddings client for any OpenAI-compatible endpoint
/// (`/chat/completions`, `/embeddings`).
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    embedding_dimension: usize,
    routes: ModelRoutes,
}

impl HttpLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
        embedding_dimension: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: std::env::var("MURMUR_API_KEY").ok().filter(|k| !k.is_empty()),
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            embedding_dimension,
            routes: ModelRoutes::default(),
        })
    }

    pub fn with_routes(mut self, routes: ModelRoutes) -> Self {
        self.routes = routes;
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let model = self.routes.resolve(options.request, &self.chat_model);
        let mut payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        debug!(
            request = options.request.as_str(),
            model,
            prompt_chars = prompt.len(),
            "llm generate"
        );

        let response = self
            .request("/chat/completions")
            .json(&payload)
            .send()
            .await
            .context("sending chat completion request")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("reading chat response")?;
        if !status.is_success() {
            bail!("chat completion failed ({status}): {body}");
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string);
        match content {
            Some(text) => Ok(text),
            None => {
                warn!(request = options.request.as_str(), "chat response missing content");
                bail!("chat response missing content: {body}")
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpLlmClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let payload = json!({
            "model": self.embedding_model,
            "input": text,
        });

        let response = self
            .request("/embeddings")
            .json(&payload)
            .send()
            .await
            .context("sending embedding request")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("reading embedding response")?;
        if !status.is_success() {
            bail!("embedding request failed ({status}): {body}");
        }

        let vector = body["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if vector.len() != self.embedding_dimension {
            bail!(
                "embedding dimension mismatch: expected {}, got {}",
                self.embedding_dimension,
                vector.len()
            );
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }
}
