//! Opta LMX connector
//!
//! Runs turns against an Opta LMX inference server over its
//! `/v1/chat/stream` WebSocket and exposes the LMX HTTP helpers
//! (embeddings, rerank, health) used by daemon operations.

use std::sync::Arc;
use std::time::Duration;

use opta_connector_core::{
    turn_channels, ToolExecutor, TurnBackend, TurnHandle, TurnRequest, UnavailableTools,
};

pub mod http;
mod stream;

pub use http::{EmbeddingsResponse, LmxError, LmxHealth, LmxHttpClient, RerankResponse};

/// Connection settings for one LMX instance.
#[derive(Debug, Clone)]
pub struct LmxConfig {
    /// e.g. `ws://127.0.0.1:1234/v1/chat/stream`
    pub ws_url: String,
    /// e.g. `http://127.0.0.1:1234`
    pub http_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between frames of a running generation.
    pub idle_timeout: Duration,
    /// Tools that run without asking the permission gate.
    pub auto_approve_tools: Vec<String>,
    pub max_tool_rounds: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for LmxConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:1234/v1/chat/stream".to_string(),
            http_url: "http://127.0.0.1:1234".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            auto_approve_tools: Vec::new(),
            max_tool_rounds: 8,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Streaming LMX backend.
#[derive(Clone)]
pub struct LmxBackend {
    config: Arc<LmxConfig>,
    tools: Arc<dyn ToolExecutor>,
}

impl LmxBackend {
    pub fn new(config: LmxConfig) -> Self {
        Self::with_tools(config, Arc::new(UnavailableTools))
    }

    pub fn with_tools(config: LmxConfig, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            tools,
        }
    }

    pub fn config(&self) -> &LmxConfig {
        &self.config
    }
}

impl TurnBackend for LmxBackend {
    fn name(&self) -> &'static str {
        "lmx"
    }

    fn start_turn(&self, request: TurnRequest) -> TurnHandle {
        let (handle, channels) = turn_channels();
        tokio::spawn(stream::run_turn(
            self.config.clone(),
            self.tools.clone(),
            request,
            channels,
        ));
        handle
    }
}
