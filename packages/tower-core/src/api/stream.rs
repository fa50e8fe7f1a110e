//! Live MP3 delivery to HTTP listeners.
//!
//! Each listener subscribes to the broadcast channel fed by the bootstrap
//! pump and receives sync-aligned MP3 frames as a chunked `audio/mpeg`
//! body. A listener that lags past the channel capacity skips ahead to the
//! freshest audio rather than stalling the pipeline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{connect_info::ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{TowerError, TowerResult};
use crate::events::{EventEmitter, TowerEvent};
use crate::protocol_constants::APP_NAME;
use crate::stream::IcyInjector;

use super::AppState;

/// Minimum spacing between lag warnings per listener.
const LAG_LOG_INTERVAL_SECS: u64 = 1;

/// Tracks one HTTP listener's delivery and logs its lifecycle on drop.
pub struct ListenerGuard {
    id: String,
    remote: SocketAddr,
    connected_at: Instant,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_skipped: AtomicU64,
    last_lag_log: parking_lot::Mutex<Option<Instant>>,
    registry: Arc<DashMap<String, Arc<ListenerGuard>>>,
    events: Arc<crate::events::BroadcastEventBridge>,
}

impl ListenerGuard {
    fn new(
        remote: SocketAddr,
        registry: Arc<DashMap<String, Arc<ListenerGuard>>>,
        events: Arc<crate::events::BroadcastEventBridge>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        log::info!("[Stream] Listener connected: id={id}, remote={remote}");
        events.emit(TowerEvent::ListenerConnected {
            id: id.clone(),
            remote: remote.to_string(),
        });

        let guard = Arc::new(Self {
            id: id.clone(),
            remote,
            connected_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            last_lag_log: parking_lot::Mutex::new(None),
            registry: Arc::clone(&registry),
            events,
        });
        registry.insert(id, Arc::clone(&guard));
        guard
    }

    fn record_frame(&self, len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn note_lag(&self, skipped: u64) {
        self.frames_skipped.fetch_add(skipped, Ordering::Relaxed);
        let mut last = self.last_lag_log.lock();
        let now = Instant::now();
        if last.map_or(true, |t| (now - t).as_secs() >= LAG_LOG_INTERVAL_SECS) {
            log::warn!(
                "[Stream] Listener {} lagged by {} frames, skipping ahead",
                self.id,
                skipped
            );
            *last = Some(now);
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        let frames = self.frames_sent.load(Ordering::Relaxed);
        log::info!(
            "[Stream] Listener ended: id={}, remote={}, duration={:?}, frames_sent={}, \
             bytes_sent={}, frames_skipped={}",
            self.id,
            self.remote,
            self.connected_at.elapsed(),
            frames,
            self.bytes_sent.load(Ordering::Relaxed),
            self.frames_skipped.load(Ordering::Relaxed),
        );
        self.events.emit(TowerEvent::ListenerDisconnected {
            id: self.id.clone(),
            frames_sent: frames,
        });
    }
}

pub(super) async fn stream_audio(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> TowerResult<Response> {
    let mut rx = state.broadcast_tx.subscribe();
    let guard = ListenerGuard::new(remote, Arc::clone(&state.listeners), Arc::clone(&state.events));

    // Shoutcast-style clients opt into interleaved metadata blocks.
    let wants_icy = headers
        .get("icy-metadata")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "1")
        .unwrap_or(false);
    let mut injector = wants_icy.then(IcyInjector::new);
    let icy_metaint = injector.as_ref().map(|i| i.interval());
    let metadata = Arc::clone(&state.metadata);

    let body_stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    guard.record_frame(frame.len());
                    let frame = match injector.as_mut() {
                        Some(injector) => {
                            let now_playing = metadata.read().clone();
                            injector.inject(&frame, &now_playing)
                        }
                        None => frame,
                    };
                    yield Ok::<_, std::io::Error>(frame);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    guard.note_lag(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        // `guard` dropped here closes out the listener entry.
        drop(guard);
    };

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("icy-name", APP_NAME);

    if let Some(metaint) = icy_metaint {
        builder = builder.header("icy-metaint", metaint.to_string());
    }

    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| TowerError::Internal(e.to_string()))
}
