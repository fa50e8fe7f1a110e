//! HTTP API: the MP3 fan-out edge, health/status, and the event WebSocket.

mod http;
mod stream;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, put};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::encoder::EncoderManager;
use crate::events::BroadcastEventBridge;
use crate::ingest::PcmIngest;
use crate::stream::SharedMetadata;

pub use stream::ListenerGuard;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EncoderManager>,
    pub broadcast_tx: broadcast::Sender<Bytes>,
    pub events: Arc<BroadcastEventBridge>,
    pub listeners: Arc<DashMap<String, Arc<ListenerGuard>>>,
    pub ingest: Option<Arc<PcmIngest>>,
    pub metadata: SharedMetadata,
    pub started_at: Instant,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/status", get(http::status))
        .route("/metadata", put(http::update_metadata))
        .route("/stream", get(stream::stream_audio))
        .route("/events", get(ws::events_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on an already-bound listener until the task is dropped.
pub async fn start_server(
    state: AppState,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
