//! Stream-level concerns shared by the HTTP delivery path: now-playing
//! metadata and ICY (Shoutcast) injection.

pub mod icy;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use icy::IcyInjector;

/// Now-playing metadata for the broadcast.
///
/// Set by the upstream producer (the program source announcing tracks) and
/// embedded into ICY metadata blocks for listeners that request them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl StreamMetadata {
    /// Renders the ICY `StreamTitle` value: `Artist - Title`, either half
    /// alone, or `None` when nothing is set.
    pub fn stream_title(&self) -> Option<String> {
        match (&self.artist, &self.title) {
            (Some(a), Some(t)) => Some(format!("{a} - {t}")),
            (None, Some(t)) => Some(t.clone()),
            (Some(a), None) => Some(a.clone()),
            (None, None) => None,
        }
    }
}

/// Shared, concurrently-updatable metadata slot.
pub type SharedMetadata = Arc<RwLock<StreamMetadata>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_title_joins_artist_and_title() {
        let meta = StreamMetadata {
            title: Some("Neon Skyline".to_string()),
            artist: Some("The Weather Station".to_string()),
        };
        assert_eq!(
            meta.stream_title().as_deref(),
            Some("The Weather Station - Neon Skyline")
        );
    }

    #[test]
    fn stream_title_falls_back_to_either_half() {
        let title_only = StreamMetadata {
            title: Some("Interlude".to_string()),
            artist: None,
        };
        assert_eq!(title_only.stream_title().as_deref(), Some("Interlude"));

        assert_eq!(StreamMetadata::default().stream_title(), None);
    }
}
