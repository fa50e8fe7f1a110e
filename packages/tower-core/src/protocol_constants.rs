//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (MPEG audio framing,
//! the canonical Tower PCM format) and changing them would break the wire
//! contract between the ingest edge, the encoder subprocess, and listeners.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Canonical PCM format
// ─────────────────────────────────────────────────────────────────────────────

/// Audio sample rate (Hz).
///
/// 48kHz is the broadcast standard and the only rate the pipeline accepts.
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels (stereo).
pub const CHANNELS: u16 = 2;

/// Bytes per sample (signed 16-bit little-endian).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one canonical frame.
///
/// 1152 matches the MPEG-1 Layer III granule size, so one PCM frame maps to
/// exactly one MP3 frame at the encoder output.
pub const FRAME_SAMPLES: usize = 1152;

/// Size of one canonical PCM frame in bytes.
///
/// 1152 samples × 2 channels × 2 bytes = 4608. This is the *only* valid
/// Tower PCM frame size; anything else is malformed and dropped at the edge.
pub const PCM_FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS as usize * BYTES_PER_SAMPLE;

/// Duration of one canonical frame (1152 / 48000 s = 24ms).
///
/// This is the cadence of the AudioPump metronome and of MP3 frames at the
/// fan-out edge.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(24);

// ─────────────────────────────────────────────────────────────────────────────
// Timing bounds
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded wait applied when popping upstream PCM inside a pump tick.
///
/// Short enough to leave most of the 24ms tick budget for the stdin write.
pub const PCM_POP_TIMEOUT: Duration = Duration::from_millis(5);

/// Bounded wait applied inside `get_frame()` before falling back to the
/// canonical silence MP3 frame.
pub const GET_FRAME_WAIT: Duration = Duration::from_millis(250);

/// Bounded timeout for a single PCM write to encoder stdin.
///
/// The pipe normally absorbs a 4608-byte frame instantly; a write that cannot
/// complete in this window is dropped rather than stalling the tick.
pub const STDIN_WRITE_TIMEOUT: Duration = Duration::from_millis(20);

/// Read timeout used by the stdout drain loop so stall checks run even when
/// the encoder emits nothing.
pub const STDOUT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Soft startup target: a cold encoder that has not produced its first MP3
/// frame by this point gets a WARN. Informational only, never a failure.
pub const SOFT_STARTUP_TARGET: Duration = Duration::from_millis(500);

/// Grace window between closing encoder stdin and escalating to a kill.
pub const PROCESS_TERM_GRACE: Duration = Duration::from_millis(200);

// ─────────────────────────────────────────────────────────────────────────────
// Bounded capture sizes
// ─────────────────────────────────────────────────────────────────────────────

/// Ceiling for the stdout frame accumulator.
pub const STDOUT_ACCUMULATOR_MAX: usize = 1024 * 1024;

/// Bytes kept (most recent) when the stdout accumulator overflows.
pub const STDOUT_ACCUMULATOR_KEEP: usize = 512 * 1024;

/// Ceiling for the captured encoder stderr tail, truncated oldest-first.
pub const STDERR_TAIL_MAX: usize = 10 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// ICY Protocol (Shoutcast/Icecast metadata)
// ─────────────────────────────────────────────────────────────────────────────

/// ICY metadata interval (audio bytes between metadata blocks).
///
/// This is a protocol constant announced in the `icy-metaint` response
/// header, not a tunable parameter.
pub const ICY_METAINT: usize = 8192;

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in protocol data (ICY headers).
pub const APP_NAME: &str = "Tower";

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "tower";

// ─────────────────────────────────────────────────────────────────────────────
// Channel capacities
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the event broadcast channel for WebSocket clients.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the MP3 broadcast channel feeding HTTP listeners.
///
/// ~128 frames ≈ 3 seconds at the 24ms frame cadence; a listener that lags
/// further than this skips ahead (freshest audio wins).
pub const STREAM_CHANNEL_CAPACITY: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_frame_is_4608_bytes() {
        assert_eq!(PCM_FRAME_BYTES, 4608);
    }

    #[test]
    fn frame_interval_matches_sample_count() {
        let secs = FRAME_SAMPLES as f64 / SAMPLE_RATE as f64;
        assert_eq!(Duration::from_secs_f64(secs), FRAME_INTERVAL);
    }
}
