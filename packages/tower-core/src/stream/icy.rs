//! ICY (Shoutcast) metadata injection.
//!
//! Listeners that send `icy-metadata: 1` receive a metadata block every
//! `ICY_METAINT` audio bytes. The block is a length byte (count of 16-byte
//! units) followed by `StreamTitle='...';` padded with zeros; a single zero
//! byte means "no change". Injection runs on the per-listener delivery
//! path, so the rendered block is cached until the metadata actually
//! changes.

use bytes::{Bytes, BytesMut};

use crate::protocol_constants::ICY_METAINT;
use crate::stream::StreamMetadata;

/// Renders one ICY metadata block for the given metadata.
pub fn metadata_block(metadata: &StreamMetadata) -> Vec<u8> {
    let Some(title) = metadata.stream_title().filter(|t| !t.is_empty()) else {
        return vec![0];
    };

    // ICY delimits with single quotes; swap embedded apostrophes for the
    // identical-looking U+2019 so renderers do not show escape characters.
    let title = title.replace('\'', "\u{2019}");
    let payload = format!("StreamTitle='{title}';");

    let blocks = payload.len().div_ceil(16);
    let mut out = Vec::with_capacity(blocks * 16 + 1);
    out.push(blocks as u8);
    out.extend_from_slice(payload.as_bytes());
    out.resize(blocks * 16 + 1, 0);
    out
}

/// Stateful per-listener injector.
///
/// Tracks the byte position within the metadata interval across frames and
/// splices a block in whenever the interval boundary falls inside a frame.
pub struct IcyInjector {
    metaint: usize,
    since_block: usize,
    rendered: Vec<u8>,
    rendered_for: StreamMetadata,
}

impl IcyInjector {
    pub fn new() -> Self {
        Self::with_interval(ICY_METAINT)
    }

    /// Interval-parameterized constructor (tests use small intervals).
    pub fn with_interval(metaint: usize) -> Self {
        let rendered_for = StreamMetadata::default();
        Self {
            metaint,
            since_block: 0,
            rendered: metadata_block(&rendered_for),
            rendered_for,
        }
    }

    /// The ICY interval this injector announces via `icy-metaint`.
    pub fn interval(&self) -> usize {
        self.metaint
    }

    fn refresh(&mut self, metadata: &StreamMetadata) {
        if *metadata != self.rendered_for {
            self.rendered = metadata_block(metadata);
            self.rendered_for = metadata.clone();
        }
    }

    /// Splices metadata blocks into an audio frame at interval boundaries.
    pub fn inject(&mut self, frame: &[u8], metadata: &StreamMetadata) -> Bytes {
        self.refresh(metadata);

        let insertions = (self.since_block + frame.len()) / self.metaint;
        let mut out = BytesMut::with_capacity(frame.len() + insertions * self.rendered.len());

        let mut rest = frame;
        while self.since_block + rest.len() >= self.metaint {
            let take = self.metaint - self.since_block;
            out.extend_from_slice(&rest[..take]);
            out.extend_from_slice(&self.rendered);
            rest = &rest[take..];
            self.since_block = 0;
        }
        out.extend_from_slice(rest);
        self.since_block += rest.len();

        out.freeze()
    }
}

impl Default for IcyInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(artist: &str, title: &str) -> StreamMetadata {
        StreamMetadata {
            title: Some(title.to_string()),
            artist: Some(artist.to_string()),
        }
    }

    #[test]
    fn empty_metadata_renders_zero_byte() {
        assert_eq!(metadata_block(&StreamMetadata::default()), vec![0]);
    }

    #[test]
    fn block_is_length_prefixed_and_padded() {
        let block = metadata_block(&meta("Artist", "Song"));
        let units = block[0] as usize;
        assert_eq!(block.len(), units * 16 + 1);
        let content = String::from_utf8_lossy(&block[1..]);
        assert!(content.starts_with("StreamTitle='Artist - Song';"));
        assert!(block[1..].iter().rev().take_while(|&&b| b == 0).count() < 16);
    }

    #[test]
    fn apostrophes_are_swapped_for_u2019() {
        let block = metadata_block(&meta("O'Brien", "Don't Stop"));
        let content = String::from_utf8_lossy(&block[1..]);
        assert!(content.contains("O\u{2019}Brien - Don\u{2019}t Stop"));
        assert!(!content.contains("O'Brien"));
    }

    #[test]
    fn no_block_before_interval_boundary() {
        let mut injector = IcyInjector::with_interval(100);
        let out = injector.inject(&[7u8; 60], &StreamMetadata::default());
        assert_eq!(out.len(), 60);
    }

    #[test]
    fn block_inserted_exactly_at_boundary() {
        let mut injector = IcyInjector::with_interval(100);
        let out = injector.inject(&[7u8; 100], &StreamMetadata::default());
        assert_eq!(out.len(), 101);
        assert_eq!(out[100], 0);
    }

    #[test]
    fn boundary_splits_a_frame() {
        let mut injector = IcyInjector::with_interval(100);
        injector.inject(&[7u8; 60], &StreamMetadata::default());

        // 60 + 80 crosses one boundary at offset 40 of this frame.
        let out = injector.inject(&[8u8; 80], &StreamMetadata::default());
        assert_eq!(out.len(), 81);
        assert_eq!(out[40], 0);
        assert_eq!(out[41], 8);
    }

    #[test]
    fn multiple_boundaries_in_one_frame() {
        let mut injector = IcyInjector::with_interval(50);
        let out = injector.inject(&[9u8; 125], &StreamMetadata::default());
        assert_eq!(out.len(), 127);
    }

    #[test]
    fn rendered_block_follows_metadata_changes() {
        let mut injector = IcyInjector::with_interval(50);

        let first = injector.inject(&[0u8; 50], &meta("A", "One"));
        let first_block = first[50..].to_vec();

        let unchanged = injector.inject(&[0u8; 50], &meta("A", "One"));
        assert_eq!(unchanged[50..].to_vec(), first_block);

        let changed = injector.inject(&[0u8; 50], &meta("A", "Two"));
        let content = String::from_utf8_lossy(&changed[51..]);
        assert!(content.contains("Two"));
    }
}
