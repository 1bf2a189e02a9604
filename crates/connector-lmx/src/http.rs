//! LMX HTTP helpers: embeddings, rerank, health.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LmxError {
    #[error("LMX request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LMX returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl LmxError {
    /// True when LMX could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_timeout(),
            Self::Status { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    pub usage: EmbeddingsUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsUsage {
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResponse {
    pub results: Vec<RerankResult>,
    pub model: String,
    #[serde(default)]
    pub usage: Option<RerankUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
    #[serde(default)]
    pub document: Option<RerankDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankUsage {
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmxHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Thin reqwest client for the LMX REST surface.
#[derive(Debug, Clone)]
pub struct LmxHttpClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LmxHttpClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, LmxError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LmxError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LmxError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    pub async fn embeddings(
        &self,
        model: &str,
        input: &[String],
    ) -> Result<EmbeddingsResponse, LmxError> {
        debug!(
            component = "lmx_http",
            event = "lmx.embeddings.request",
            model = %model,
            inputs = input.len(),
        );
        let body = EmbeddingsRequest {
            model,
            input,
            encoding_format: "float",
        };
        let response = self
            .authorize(self.client.post(self.url("/v1/embeddings")).json(&body))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn rerank(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
        top_n: Option<usize>,
    ) -> Result<RerankResponse, LmxError> {
        debug!(
            component = "lmx_http",
            event = "lmx.rerank.request",
            model = %model,
            documents = documents.len(),
        );
        let body = RerankRequest {
            model,
            query,
            documents,
            top_n,
        };
        let response = self
            .authorize(self.client.post(self.url("/v1/rerank")).json(&body))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn health(&self) -> Result<LmxHealth, LmxError> {
        let response = self
            .authorize(self.client.get(self.url("/admin/health")))
            .send()
            .await?;
        Self::decode(response).await
    }
}
