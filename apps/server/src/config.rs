//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `TOWER_BIND_PORT`
    pub bind_port: u16,

    /// Port the PCM ingest edge listens on.
    /// Override: `TOWER_INGEST_PORT`
    pub ingest_port: u16,

    /// Optional UDP port for one-frame-per-datagram ingest.
    /// Override: `TOWER_INGEST_UDP_PORT`
    pub ingest_udp_port: Option<u16>,

    /// Whether the encoder subprocess runs. When false the server streams
    /// synthetic silence (offline test mode).
    pub encoder_enabled: bool,

    /// Encoder binary to execute.
    /// Override: `TOWER_FFMPEG_BIN`
    pub ffmpeg_bin: String,

    /// MP3 output bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Hard timeout for the encoder's first MP3 frame (ms).
    pub startup_timeout_ms: u64,

    /// No-output stall threshold (ms).
    pub stall_threshold_ms: u64,

    /// Restart backoff schedule (ms).
    pub backoff_ms: Vec<u64>,

    /// Restart budget before the pipeline reports DEGRADED.
    pub max_restarts: u32,

    /// Fallback silence phase before tone (ms).
    pub grace_ms: u64,

    /// PCM-absence tolerance while program audio is live (ms).
    pub loss_ms: u64,

    /// Consecutive PCM frames required to admit program audio.
    pub threshold_frames: u32,

    /// DEGRADED retry cadence (minutes).
    pub recovery_minutes: u64,

    /// Whether fallback progresses from silence to a 440Hz tone.
    pub fallback_tone: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let encoder = tower_core::EncoderConfig::default();
        Self {
            bind_port: 8750,
            ingest_port: 9600,
            ingest_udp_port: None,
            encoder_enabled: encoder.enabled,
            ffmpeg_bin: encoder.ffmpeg_bin,
            bitrate_kbps: encoder.bitrate_kbps,
            startup_timeout_ms: encoder.startup_timeout_ms,
            stall_threshold_ms: encoder.stall_threshold_ms,
            backoff_ms: encoder.backoff_ms,
            max_restarts: encoder.max_restarts,
            grace_ms: encoder.grace_ms,
            loss_ms: encoder.loss_ms,
            threshold_frames: encoder.threshold_frames,
            recovery_minutes: encoder.recovery_minutes,
            fallback_tone: encoder.fallback_tone,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TOWER_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("TOWER_INGEST_PORT") {
            if let Ok(port) = val.parse() {
                self.ingest_port = port;
            }
        }

        if let Ok(val) = std::env::var("TOWER_INGEST_UDP_PORT") {
            if let Ok(port) = val.parse() {
                self.ingest_udp_port = Some(port);
            }
        }

        if let Ok(val) = std::env::var("TOWER_FFMPEG_BIN") {
            if !val.is_empty() {
                self.ffmpeg_bin = val;
            }
        }

        if let Ok(val) = std::env::var("TOWER_ENCODER_ENABLED") {
            self.encoder_enabled = !matches!(val.as_str(), "0" | "false" | "False" | "FALSE");
        }
    }

    /// Converts to tower-core's Config type.
    ///
    /// The server is the production deployment, so a running encoder is
    /// also permitted to spawn (`allow_spawn` mirrors `encoder_enabled`).
    pub fn to_core_config(&self) -> tower_core::Config {
        tower_core::Config {
            encoder: tower_core::EncoderConfig {
                enabled: self.encoder_enabled,
                allow_spawn: self.encoder_enabled,
                ffmpeg_bin: self.ffmpeg_bin.clone(),
                bitrate_kbps: self.bitrate_kbps,
                startup_timeout_ms: self.startup_timeout_ms,
                stall_threshold_ms: self.stall_threshold_ms,
                backoff_ms: self.backoff_ms.clone(),
                max_restarts: self.max_restarts,
                grace_ms: self.grace_ms,
                loss_ms: self.loss_ms,
                threshold_frames: self.threshold_frames,
                recovery_minutes: self.recovery_minutes,
                fallback_tone: self.fallback_tone,
                ..Default::default()
            },
            ingest_port: Some(self.ingest_port),
            ingest_udp_port: self.ingest_udp_port,
            ..Default::default()
        }
    }
}
