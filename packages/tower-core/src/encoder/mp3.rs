//! MP3 frame boundary detection at the encoder output edge.
//!
//! The pipeline is PCM-only internally; MP3 exists solely at the encoder's
//! stdout and in the output buffer. This module holds the pure functions for
//! locating sync words and deriving frame lengths from the 4-byte header,
//! plus the bounded accumulator that turns a byte stream into whole frames.
//! It is a boundary detector, not a decoder.

use bytes::{Bytes, BytesMut};

use crate::protocol_constants::{STDOUT_ACCUMULATOR_KEEP, STDOUT_ACCUMULATOR_MAX};

/// MPEG-1 Layer III bitrate table (kbps), indexed by the header's bitrate
/// bits. Index 0 is "free" and 15 is invalid; both map to 0 here.
const BITRATE_TABLE_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// MPEG-1 sample rate table (Hz). Index 3 is reserved.
const SAMPLE_RATE_TABLE_HZ: [u32; 4] = [44_100, 48_000, 32_000, 0];

/// Locates the next MP3 sync word (`0xFF` followed by a byte whose top three
/// bits are set). Returns the offset of the sync, or `None`.
pub fn find_sync(data: &[u8]) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }
    data.windows(2)
        .position(|w| w[0] == 0xFF && (w[1] & 0xE0) == 0xE0)
}

/// Derives the frame length in bytes from a header starting at `data[0]`.
///
/// Frame size = 144 × bitrate / sample_rate + padding. Returns `None` when
/// fewer than 4 bytes are available or the header carries an invalid
/// bitrate/sample-rate index.
pub fn frame_size(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    if data[0] != 0xFF || (data[1] & 0xE0) != 0xE0 {
        return None;
    }

    let bitrate_index = (data[2] >> 4) & 0x0F;
    let sample_rate_index = (data[2] >> 2) & 0x03;
    let padding = ((data[2] >> 1) & 0x01) as usize;

    let bitrate_kbps = BITRATE_TABLE_KBPS[bitrate_index as usize];
    let sample_rate = SAMPLE_RATE_TABLE_HZ[sample_rate_index as usize];
    if bitrate_kbps == 0 || sample_rate == 0 {
        return None;
    }

    let size = (144 * bitrate_kbps as usize * 1000) / sample_rate as usize + padding;
    if size < 4 {
        return None;
    }
    Some(size)
}

/// Builds a minimal valid MPEG-1 Layer III frame that decodes as silence.
///
/// Header: sync + Layer III without CRC, with the bitrate and sample-rate
/// indices matching the encoder settings; the payload is zeroed. Used as the
/// never-None fallback at the fan-out edge.
pub fn silence_frame(bitrate_kbps: u32, sample_rate: u32) -> Bytes {
    let bitrate_index = BITRATE_TABLE_KBPS
        .iter()
        .position(|&b| b == bitrate_kbps)
        .unwrap_or(9); // 128kbps
    let sample_rate_index = SAMPLE_RATE_TABLE_HZ
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(1); // 48kHz

    let size = (144 * bitrate_kbps as usize * 1000) / sample_rate as usize;
    let mut frame = vec![0u8; size.max(4)];
    frame[0] = 0xFF;
    frame[1] = 0xFB; // MPEG-1 Layer III, no CRC
    frame[2] = ((bitrate_index as u8) << 4) | ((sample_rate_index as u8) << 2);
    frame[3] = 0x00;
    Bytes::from(frame)
}

/// Accumulates encoder stdout bytes and yields complete MP3 frames.
///
/// Prefix bytes before a sync word are discarded. The accumulator is capped
/// at 1MB; on overflow the most recent 512KB are kept and a WARN is logged.
pub struct FrameScanner {
    acc: BytesMut,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self { acc: BytesMut::new() }
    }

    /// Feeds a chunk of bytes, returning every complete frame now available
    /// in arrival order. Incomplete trailing data is retained for the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.acc.extend_from_slice(chunk);

        if self.acc.len() > STDOUT_ACCUMULATOR_MAX {
            let excess = self.acc.len() - STDOUT_ACCUMULATOR_KEEP;
            log::warn!(
                "[FFMPEG] stdout accumulator exceeded {} bytes, truncating oldest {}",
                STDOUT_ACCUMULATOR_MAX,
                excess
            );
            let _ = self.acc.split_to(excess);
        }

        let mut frames = Vec::new();
        loop {
            let Some(sync) = find_sync(&self.acc) else {
                // Keep at most one dangling byte that could begin a sync word.
                if self.acc.len() > 1 {
                    let keep_from = self.acc.len() - 1;
                    let _ = self.acc.split_to(keep_from);
                }
                break;
            };
            if sync > 0 {
                let _ = self.acc.split_to(sync);
            }

            let Some(size) = frame_size(&self.acc) else {
                if self.acc.len() < 4 {
                    // Header incomplete; wait for more bytes.
                    break;
                }
                // Sync-looking bytes with an invalid header: false positive,
                // skip one byte and keep scanning.
                let _ = self.acc.split_to(1);
                continue;
            };
            if self.acc.len() < size {
                break;
            }

            frames.push(self.acc.split_to(size).freeze());
        }
        frames
    }

    /// Discards all buffered bytes (used when a new encoder process starts).
    pub fn reset(&mut self) {
        self.acc.clear();
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.acc.len()
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 128kbps @ 48kHz, no padding: 144 * 128000 / 48000 = 384 bytes.
    fn test_frame(fill: u8) -> Vec<u8> {
        let mut f = vec![fill; 384];
        f[0] = 0xFF;
        f[1] = 0xFB;
        f[2] = 0x94;
        f[3] = 0x00;
        f
    }

    #[test]
    fn finds_sync_after_noise() {
        let mut data = vec![0x01, 0x02, 0x03];
        data.extend_from_slice(&test_frame(0xAA));
        assert_eq!(find_sync(&data), Some(3));
    }

    #[test]
    fn no_sync_in_plain_noise() {
        assert_eq!(find_sync(&[0x00, 0x11, 0x22, 0x33]), None);
    }

    #[test]
    fn frame_size_for_128kbps_48khz() {
        assert_eq!(frame_size(&[0xFF, 0xFB, 0x94, 0x00]), Some(384));
    }

    #[test]
    fn padding_bit_adds_one_byte() {
        assert_eq!(frame_size(&[0xFF, 0xFB, 0x96, 0x00]), Some(385));
    }

    #[test]
    fn invalid_bitrate_index_rejected() {
        // Bitrate index 15 is invalid.
        assert_eq!(frame_size(&[0xFF, 0xFB, 0xF4, 0x00]), None);
    }

    #[test]
    fn reserved_sample_rate_rejected() {
        // Sample-rate index 3 is reserved.
        assert_eq!(frame_size(&[0xFF, 0xFB, 0x9C, 0x00]), None);
    }

    #[test]
    fn scanner_extracts_frames_between_noise() {
        let mut scanner = FrameScanner::new();
        let mut stream = vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]; // 7 noise bytes
        stream.extend_from_slice(&test_frame(0xAA));
        stream.extend_from_slice(&test_frame(0xBB));

        let frames = scanner.feed(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 384);
        assert_eq!(frames[0][4], 0xAA);
        assert_eq!(frames[1][4], 0xBB);
    }

    #[test]
    fn scanner_holds_incomplete_frame_until_remainder_arrives() {
        let mut scanner = FrameScanner::new();
        let frame = test_frame(0xCC);

        let frames = scanner.feed(&frame[..200]);
        assert!(frames.is_empty());

        let frames = scanner.feed(&frame[200..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), frame.as_slice());
    }

    #[test]
    fn scanner_reassembles_a_byte_trickle() {
        let mut scanner = FrameScanner::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&test_frame(0x11));
        stream.extend_from_slice(&test_frame(0x22));

        let mut frames = Vec::new();
        for byte in stream {
            frames.extend(scanner.feed(&[byte]));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][4], 0x11);
        assert_eq!(frames[1][4], 0x22);
    }

    #[test]
    fn scanner_discards_pure_noise() {
        let mut scanner = FrameScanner::new();
        let frames = scanner.feed(&[0x10; 64]);
        assert!(frames.is_empty());
        assert!(scanner.buffered() <= 1);
    }

    #[test]
    fn scanner_stays_bounded_under_sync_flood() {
        let mut scanner = FrameScanner::new();
        // All 0xFF reads as endless sync candidates with invalid headers;
        // each one is skipped and the accumulator never extracts a frame.
        let chunk = vec![0xFF; 256 * 1024];
        for _ in 0..5 {
            assert!(scanner.feed(&chunk).is_empty());
        }
        assert!(scanner.buffered() <= STDOUT_ACCUMULATOR_MAX);
    }

    #[test]
    fn silence_frame_is_valid_and_sized() {
        let frame = silence_frame(128, 48_000);
        assert_eq!(frame.len(), 384);
        assert_eq!(find_sync(&frame), Some(0));
        assert_eq!(frame_size(&frame), Some(384));
        assert!(frame[4..].iter().all(|&b| b == 0));
    }
}
