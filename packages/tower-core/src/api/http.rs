//! REST handlers: health probe, operational status, and now-playing
//! metadata updates.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::audio::FrameRingBufferStats;
use crate::encoder::manager::EncoderStatus;
use crate::events::{EventEmitter, TowerEvent};
use crate::ingest::IngestStats;
use crate::protocol_constants::SERVICE_ID;
use crate::stream::StreamMetadata;

use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    service: &'static str,
    version: &'static str,
    mode: &'static str,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: SERVICE_ID,
        version: env!("CARGO_PKG_VERSION"),
        mode: state.manager.mode().as_str(),
    })
}

#[derive(Serialize)]
pub(super) struct BufferStatsResponse {
    pcm: FrameRingBufferStats,
    mp3: FrameRingBufferStats,
}

#[derive(Serialize)]
pub(super) struct StatusResponse {
    mode: &'static str,
    uptime_secs: u64,
    listeners: usize,
    buffers: BufferStatsResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoder: Option<EncoderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingest: Option<IngestStats>,
    metadata: StreamMetadata,
}

pub(super) async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let buffers = state.manager.buffer_stats();
    Json(StatusResponse {
        mode: state.manager.mode().as_str(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        listeners: state.listeners.len(),
        buffers: BufferStatsResponse {
            pcm: buffers.pcm,
            mp3: buffers.mp3,
        },
        encoder: state.manager.encoder_status(),
        ingest: state.ingest.as_ref().map(|i| i.stats()),
        metadata: state.metadata.read().clone(),
    })
}

/// Replaces the now-playing metadata. The producer calls this when the
/// program source changes tracks.
pub(super) async fn update_metadata(
    State(state): State<AppState>,
    Json(metadata): Json<StreamMetadata>,
) -> Json<StreamMetadata> {
    log::info!(
        "Now playing: {}",
        metadata.stream_title().as_deref().unwrap_or("(cleared)")
    );
    *state.metadata.write() = metadata.clone();
    state.events.emit(TowerEvent::MetadataChanged {
        title: metadata.title.clone(),
        artist: metadata.artist.clone(),
    });
    Json(metadata)
}
