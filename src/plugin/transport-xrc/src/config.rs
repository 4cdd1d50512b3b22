use std::path::Path;

use serde::{Deserialize, Serialize};

/// How completions posted without a completion request are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Dropped while translating a polled batch; a read may return fewer
    /// entries than are available.
    Discard,
    /// The CQ is polled one entry at a time until a completion the
    /// application asked for shows up or the CQ is empty.
    PollNew,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct XrcTransportConfig {
    pub log_level: String,
    pub prefer_xrc: bool,
    pub def_tx_size: u32,
    pub def_rx_size: u32,
    pub def_inline_size: usize,
    pub cq_size: usize,
    pub wce_cnt: usize,
    pub reap_batch: usize,
    pub cqread_bunch_size: usize,
    pub completion_mode: CompletionMode,
    pub cm_retry_count: u8,
    pub rnr_retry_count: u8,
    pub listen_backlog: i32,
}

impl Default for XrcTransportConfig {
    fn default() -> Self {
        XrcTransportConfig {
            log_level: String::from("info"),
            prefer_xrc: true,
            def_tx_size: 384,
            def_rx_size: 384,
            def_inline_size: 256,
            cq_size: 1024,
            wce_cnt: 1024,
            reap_batch: 10,
            cqread_bunch_size: 8,
            completion_mode: CompletionMode::Discard,
            cm_retry_count: 15,
            rnr_retry_count: 7,
            listen_backlog: 1024,
        }
    }
}

impl XrcTransportConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}
