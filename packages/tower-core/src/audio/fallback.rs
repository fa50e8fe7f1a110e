//! Program-substitute PCM synthesis.
//!
//! The fallback provider produces canonical 4608-byte frames on demand:
//! either all-zero silence or a continuous 440Hz sine. It holds only a phase
//! accumulator, never touches disk or network, and is called synchronously
//! from the routing authority inside the pump tick - there is no second
//! timing loop here.

use std::f64::consts::TAU;

use bytes::Bytes;

use crate::protocol_constants::{FRAME_SAMPLES, PCM_FRAME_BYTES, SAMPLE_RATE};

/// Fallback tone frequency (Hz).
const TONE_HZ: f64 = 440.0;

/// Tone amplitude, well below full scale to be unmistakable but gentle.
const TONE_AMPLITUDE: f64 = 0.20;

static SILENCE: [u8; PCM_FRAME_BYTES] = [0u8; PCM_FRAME_BYTES];

/// Returns the canonical all-zero PCM frame. Zero-allocation clone.
pub fn silence_frame() -> Bytes {
    Bytes::from_static(&SILENCE)
}

/// Synthesizes program-substitute PCM frames on demand.
///
/// `next_frame()` is non-blocking and deterministic; the phase accumulator
/// carries across calls so consecutive tone frames are free of
/// discontinuities. With `tone` disabled the provider always returns
/// silence.
pub struct FallbackProvider {
    tone: bool,
    phase: f64,
    phase_step: f64,
}

impl FallbackProvider {
    pub fn new(tone: bool) -> Self {
        Self {
            tone,
            phase: 0.0,
            phase_step: TAU * TONE_HZ / SAMPLE_RATE as f64,
        }
    }

    /// Returns one canonical 4608-byte PCM frame (silence or tone).
    pub fn next_frame(&mut self) -> Bytes {
        if !self.tone {
            return silence_frame();
        }

        let mut frame = Vec::with_capacity(PCM_FRAME_BYTES);
        for _ in 0..FRAME_SAMPLES {
            let sample = (self.phase.sin() * TONE_AMPLITUDE * i16::MAX as f64) as i16;
            let le = sample.to_le_bytes();
            // Same sample on both stereo channels.
            frame.extend_from_slice(&le);
            frame.extend_from_slice(&le);
            self.phase += self.phase_step;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
        Bytes::from(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(frame: &Bytes) -> Vec<i16> {
        frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn silence_frame_is_canonical_zeros() {
        let frame = silence_frame();
        assert_eq!(frame.len(), PCM_FRAME_BYTES);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn silence_only_provider_returns_zeros() {
        let mut provider = FallbackProvider::new(false);
        assert_eq!(provider.next_frame(), silence_frame());
    }

    #[test]
    fn tone_frame_is_canonical_size_and_non_silent() {
        let mut provider = FallbackProvider::new(true);
        let frame = provider.next_frame();
        assert_eq!(frame.len(), PCM_FRAME_BYTES);
        assert!(frame.iter().any(|&b| b != 0));
    }

    #[test]
    fn tone_is_continuous_across_frames() {
        let mut provider = FallbackProvider::new(true);
        let first = samples(&provider.next_frame());
        let second = samples(&provider.next_frame());

        // Largest sample-to-sample step a 440Hz sine at this amplitude can
        // take between consecutive samples at 48kHz, plus truncation slack.
        let max_step = (TAU * TONE_HZ / SAMPLE_RATE as f64 * TONE_AMPLITUDE * i16::MAX as f64)
            .ceil() as i32
            + 3;

        let boundary_jump =
            (second[0] as i32 - first[first.len() - 2] as i32).abs();
        assert!(
            boundary_jump <= max_step,
            "discontinuity at frame boundary: {boundary_jump} > {max_step}"
        );
    }

    #[test]
    fn stereo_channels_carry_identical_samples() {
        let mut provider = FallbackProvider::new(true);
        let s = samples(&provider.next_frame());
        for pair in s.chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
