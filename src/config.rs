//! Orchestrator configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_video_bitrate() -> u64 {
    2_500_000
}

fn default_audio_bitrate() -> u64 {
    128_000
}

fn default_framerate() -> f64 {
    30.0
}

/// Everything an encrypted publisher or subscriber needs. No state is ever
/// persisted back.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// KAS base URL, e.g. `https://kas.example.com`.
    pub kas_url: String,
    /// Bearer token for the rewrap exchange (subscriber side).
    #[serde(default)]
    pub kas_token: String,
    /// RTMP ingest base, e.g. `rtmp://ingest.example.com/live`.
    pub rtmp_url: String,
    /// Stream name / key.
    pub stream_key: String,
    /// Advertised video bitrate, bits per second.
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u64,
    /// Advertised audio bitrate, bits per second.
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u64,
    /// Advertised in onMetaData only.
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: f64,
    /// Embedded plaintext policy body; generated when absent.
    #[serde(default)]
    pub policy_json: Option<String>,
}

impl StreamConfig {
    pub fn new(kas_url: &str, rtmp_url: &str, stream_key: &str) -> Self {
        Self {
            kas_url: kas_url.to_string(),
            kas_token: String::new(),
            rtmp_url: rtmp_url.to_string(),
            stream_key: stream_key.to_string(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            width: 0,
            height: 0,
            framerate: default_framerate(),
            policy_json: None,
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }
}
