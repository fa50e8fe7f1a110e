//! Core application configuration types.
//!
//! Provides [`Config`], [`EncoderConfig`], and [`StreamingConfig`] with
//! validated defaults. Every tunable of the encoding pipeline lives here;
//! the server binary layers YAML and environment overrides on top.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{EVENT_CHANNEL_CAPACITY, STREAM_CHANNEL_CAPACITY};

/// Configuration for the encoder subprocess and routing state machine.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EncoderConfig {
    /// If false, the pipeline runs in OFFLINE_TEST_MODE: no supervisor is
    /// created and all output is synthetic silence.
    pub enabled: bool,

    /// Guard preventing accidental subprocess launches. Defaults to false so
    /// tests must opt in explicitly; the server binary enables it.
    pub allow_spawn: bool,

    /// Encoder binary to execute.
    pub ffmpeg_bin: String,

    /// MP3 output bitrate in kbps (also used for the silence MP3 frame).
    pub bitrate_kbps: u32,

    /// Hard deadline for the first MP3 frame during BOOTING (ms).
    pub startup_timeout_ms: u64,

    /// No-output stall threshold once the first frame has been seen (ms).
    pub stall_threshold_ms: u64,

    /// Restart backoff schedule (ms). The last entry repeats for attempts
    /// beyond its length.
    pub backoff_ms: Vec<u64>,

    /// Restart budget before the supervisor enters FAILED.
    pub max_restarts: u32,

    /// Fallback silence phase before tone (ms).
    pub grace_ms: u64,

    /// PCM-absence tolerance while program audio is admitted (ms).
    pub loss_ms: u64,

    /// Consecutive tick-observed PCM frames required to admit program audio.
    pub threshold_frames: u32,

    /// DEGRADED retry cadence (minutes).
    pub recovery_minutes: u64,

    /// Whether the fallback provider emits a 440Hz tone after the grace
    /// period (false = silence throughout).
    pub fallback_tone: bool,

    /// Upstream PCM buffer capacity (frames, 4608 bytes each).
    pub pcm_buffer_capacity: usize,

    /// MP3 output buffer capacity (frames). ~400 frames is roughly ten
    /// seconds at the 24ms frame cadence.
    pub mp3_buffer_capacity: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_spawn: false,
            ffmpeg_bin: "ffmpeg".to_string(),
            bitrate_kbps: 128,
            startup_timeout_ms: 1500,
            stall_threshold_ms: 2000,
            backoff_ms: vec![1000, 2000, 4000, 8000, 10000],
            max_restarts: 5,
            grace_ms: 1500,
            loss_ms: 500,
            threshold_frames: 15,
            recovery_minutes: 10,
            fallback_tone: true,
            pcm_buffer_capacity: 64,
            mp3_buffer_capacity: 400,
        }
    }
}

impl EncoderConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.ffmpeg_bin.is_empty() {
            return Err("ffmpeg_bin must not be empty".to_string());
        }
        if self.bitrate_kbps == 0 {
            return Err("bitrate_kbps must be >= 1".to_string());
        }
        if self.startup_timeout_ms == 0 {
            return Err("startup_timeout_ms must be >= 1".to_string());
        }
        if self.stall_threshold_ms == 0 {
            return Err("stall_threshold_ms must be >= 1".to_string());
        }
        if self.backoff_ms.is_empty() {
            return Err("backoff_ms must contain at least one delay".to_string());
        }
        if self.threshold_frames == 0 {
            return Err("threshold_frames must be >= 1".to_string());
        }
        if self.recovery_minutes == 0 {
            return Err("recovery_minutes must be >= 1".to_string());
        }
        if self.pcm_buffer_capacity == 0 {
            return Err("pcm_buffer_capacity must be >= 1".to_string());
        }
        if self.mp3_buffer_capacity == 0 {
            return Err("mp3_buffer_capacity must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the HTTP fan-out behavior.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    /// Capacity of the MP3 broadcast channel feeding listeners.
    pub channel_capacity: usize,

    /// Capacity of the event broadcast channel for WebSocket clients.
    pub event_channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: STREAM_CHANNEL_CAPACITY,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl StreamingConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.channel_capacity == 0 {
            return Err(
                "channel_capacity must be >= 1 (broadcast::channel panics on 0)".to_string(),
            );
        }
        if self.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Tower service.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Encoder pipeline configuration.
    pub encoder: EncoderConfig,

    /// Streaming configuration.
    pub streaming: StreamingConfig,

    /// TCP port the PCM ingest edge listens on. `None` disables the ingest
    /// transport (frames can still be pushed programmatically).
    pub ingest_port: Option<u16>,

    /// UDP port for one-frame-per-datagram ingest. `None` disables the
    /// datagram transport.
    pub ingest_udp_port: Option<u16>,
}

impl Config {
    /// Validates the full configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.encoder.validate()?;
        self.streaming.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_config_default_is_valid() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn encoder_config_rejects_zero_values() {
        let mut config = EncoderConfig::default();
        config.threshold_frames = 0;
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::default();
        config.backoff_ms = vec![];
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::default();
        config.mp3_buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn streaming_config_rejects_zero_capacity() {
        let config = StreamingConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_keeps_spawn_guard_closed() {
        let config = Config::default();
        assert!(config.encoder.enabled);
        assert!(!config.encoder.allow_spawn);
        assert!(config.validate().is_ok());
    }
}
