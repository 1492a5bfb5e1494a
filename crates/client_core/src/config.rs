use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub database_url: String,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub dedup_window: Duration,
    pub poll_interval: Option<Duration>,
    pub history_page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            ws_url: None,
            database_url: "sqlite://./data/sync.db".into(),
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            dedup_window: Duration::from_secs(8),
            poll_interval: None,
            history_page_size: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server_url: Option<String>,
    ws_url: Option<String>,
    database_url: Option<String>,
    handshake_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    dedup_window_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    history_page_size: Option<u32>,
}

impl SyncConfig {
    /// Event-stream endpoint; derived from `server_url` unless set explicitly.
    pub fn websocket_url(&self) -> Result<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(format!("{ws_base}/ws"))
    }

    fn apply_file(&mut self, file_cfg: FileConfig) {
        if let Some(v) = file_cfg.server_url {
            self.server_url = v;
        }
        if let Some(v) = file_cfg.ws_url {
            self.ws_url = Some(v);
        }
        if let Some(v) = file_cfg.database_url {
            self.database_url = v;
        }
        if let Some(v) = file_cfg.handshake_timeout_ms {
            self.handshake_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.ack_timeout_ms {
            self.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.reconnect_base_delay_ms {
            self.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = file_cfg.dedup_window_ms {
            self.dedup_window = Duration::from_millis(v);
        }
        if let Some(v) = file_cfg.poll_interval_ms {
            self.poll_interval = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = file_cfg.history_page_size {
            self.history_page_size = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SYNC__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("SYNC__WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = lookup("SYNC__DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("SYNC__HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.handshake_timeout = Duration::from_millis(v);
        }
        if let Some(v) = lookup("SYNC__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = lookup("SYNC__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = lookup("SYNC__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = lookup("SYNC__DEDUP_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.dedup_window = Duration::from_millis(v);
        }
        if let Some(v) = lookup("SYNC__POLL_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.poll_interval = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = lookup("SYNC__HISTORY_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.history_page_size = v;
        }
    }
}

/// Loads defaults, then the optional TOML file, then `SYNC__*` environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let mut config = SyncConfig::default();

    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        config.apply_file(parse_file_config(&raw)?);
    }

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn parse_file_config(raw: &str) -> Result<FileConfig> {
    toml::from_str::<FileConfig>(raw).context("invalid sync config file")
}
