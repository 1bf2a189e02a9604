//! Daemon configuration.
//!
//! Layering: built-in defaults → `<data_dir>/config.toml` (or `--config`) →
//! environment → CLI flags. Environment and CLI are folded together by clap
//! (`#[arg(env = ...)]`), so this module only merges file + overrides.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND: &str = "127.0.0.1:9999";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub bind: SocketAddr,
    pub auth_token: Option<String>,
    pub backend: BackendConfig,
    pub sessions: SessionSettings,
    pub background: BackgroundSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9999)),
            auth_token: None,
            backend: BackendConfig::default(),
            sessions: SessionSettings::default(),
            background: BackgroundSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic in-process backend (echo by default).
    Scripted,
    #[default]
    Lmx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub lmx_ws_url: String,
    pub lmx_http_url: String,
    pub lmx_api_key: Option<String>,
    pub default_model: String,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub auto_approve_tools: Vec<String>,
    pub max_tool_rounds: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Lmx,
            lmx_ws_url: "ws://127.0.0.1:1234/v1/chat/stream".to_string(),
            lmx_http_url: "http://127.0.0.1:1234".to_string(),
            lmx_api_key: None,
            default_model: "default".to_string(),
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 120_000,
            http_timeout_ms: 30_000,
            auto_approve_tools: Vec::new(),
            max_tool_rounds: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Envelopes kept for replay once every known client has acknowledged them.
    pub replay_capacity: usize,
    /// Absolute cap; entries past this are dropped even if unacknowledged.
    pub replay_hard_limit: usize,
    /// How long a detached client's cursor still pins the replay buffer.
    pub client_retention_secs: u64,
    pub broadcast_capacity: usize,
    pub cancel_grace_ms: u64,
    pub progress_interval_ms: u64,
    pub recent_turns: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            replay_capacity: 1_024,
            replay_hard_limit: 8_192,
            client_retention_secs: 600,
            broadcast_capacity: 1_024,
            cancel_grace_ms: 3_000,
            progress_interval_ms: 2_000,
            recent_turns: 20,
        }
    }
}

impl SessionSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(50))
    }

    pub fn client_retention(&self) -> Duration {
        Duration::from_secs(self.client_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundSettings {
    pub kill_grace_ms: u64,
    pub output_retention: usize,
    pub output_hard_limit: usize,
    pub stream_output_events: bool,
    pub default_timeout_ms: Option<u64>,
    pub liveness_poll_ms: u64,
    pub read_limit_max: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            kill_grace_ms: 2_000,
            output_retention: 2_000,
            output_hard_limit: 10_000,
            stream_output_events: true,
            default_timeout_ms: None,
            liveness_poll_ms: 1_000,
            read_limit_max: 1_000,
        }
    }
}

impl BackgroundSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(50))
    }
}

/// Values that win over the config file (CLI flags and their env vars).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<SocketAddr>,
    pub auth_token: Option<String>,
    pub backend: Option<BackendKind>,
    pub lmx_ws_url: Option<String>,
    pub lmx_http_url: Option<String>,
    pub lmx_api_key: Option<String>,
    pub model: Option<String>,
}

impl DaemonConfig {
    /// Read the config file if it exists; a missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(token) = overrides.auth_token.filter(|t| !t.trim().is_empty()) {
            self.auth_token = Some(token);
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = kind;
        }
        if let Some(url) = overrides.lmx_ws_url {
            self.backend.lmx_ws_url = url;
        }
        if let Some(url) = overrides.lmx_http_url {
            self.backend.lmx_http_url = url;
        }
        if let Some(key) = overrides.lmx_api_key {
            self.backend.lmx_api_key = Some(key);
        }
        if let Some(model) = overrides.model {
            self.backend.default_model = model;
        }
        self.normalize()
    }

    /// Keep retention limits internally consistent.
    fn normalize(mut self) -> Self {
        self.sessions.replay_capacity = self.sessions.replay_capacity.max(1);
        self.sessions.replay_hard_limit = self
            .sessions
            .replay_hard_limit
            .max(self.sessions.replay_capacity);
        self.sessions.broadcast_capacity = self.sessions.broadcast_capacity.max(16);
        self.background.output_retention = self.background.output_retention.max(1);
        self.background.output_hard_limit = self
            .background
            .output_hard_limit
            .max(self.background.output_retention);
        self.background.read_limit_max = self.background.read_limit_max.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
bind = "127.0.0.1:7777"

[backend]
kind = "scripted"

[background]
kill_grace_ms = 500
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.bind.port(), 7777);
        assert_eq!(config.backend.kind, BackendKind::Scripted);
        assert_eq!(config.background.kill_grace_ms, 500);
        assert_eq!(config.sessions.replay_capacity, 1_024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sessions]\nreplay_capacty = 4\n").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }

    #[test]
    fn overrides_win_over_file() {
        let config = DaemonConfig::default().apply(ConfigOverrides {
            backend: Some(BackendKind::Scripted),
            model: Some("qwen3-8b".into()),
            auth_token: Some("   ".into()),
            ..Default::default()
        });
        assert_eq!(config.backend.kind, BackendKind::Scripted);
        assert_eq!(config.backend.default_model, "qwen3-8b");
        assert!(config.auth_token.is_none(), "blank token must not enable auth");
    }

    #[test]
    fn hard_limits_never_fall_below_soft_limits() {
        let mut config = DaemonConfig::default();
        config.sessions.replay_capacity = 100;
        config.sessions.replay_hard_limit = 10;
        config.background.output_retention = 50;
        config.background.output_hard_limit = 5;
        let config = config.apply(ConfigOverrides::default());
        assert_eq!(config.sessions.replay_hard_limit, 100);
        assert_eq!(config.background.output_hard_limit, 50);
    }
}
