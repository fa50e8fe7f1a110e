//! Event system for real-time observers.
//!
//! Domain events are emitted through the [`EventEmitter`] trait and bridged
//! onto a `tokio::sync::broadcast` channel, which the WebSocket API fans out
//! to connected clients. Emission is fire-and-forget: a slow or absent
//! observer never blocks the pipeline.

use serde::Serialize;
use tokio::sync::broadcast;

/// Domain events visible to external observers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TowerEvent {
    /// The operational mode changed (COLD_START, LIVE_INPUT, DEGRADED...).
    ModeChanged { mode: String },

    /// The encoder supervisor announced a state transition.
    EncoderState { state: String },

    /// Now-playing metadata was updated by the producer.
    MetadataChanged {
        title: Option<String>,
        artist: Option<String>,
    },

    /// An HTTP listener connected to the MP3 stream.
    ListenerConnected { id: String, remote: String },

    /// An HTTP listener disconnected.
    ListenerDisconnected { id: String, frames_sent: u64 },
}

/// Trait for emitting domain events.
///
/// Services hold an `Arc<dyn EventEmitter>` so tests can capture emissions
/// without a broadcast channel.
pub trait EventEmitter: Send + Sync {
    /// Emits an event to all observers. Must never block.
    fn emit(&self, event: TowerEvent);
}

/// Bridges domain events onto a broadcast channel for WebSocket clients.
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<TowerEvent>,
}

impl BroadcastEventBridge {
    /// Creates a bridge with a fresh channel of the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<TowerEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit(&self, event: TowerEvent) {
        // A send error just means no observer is connected right now.
        if let Err(e) = self.tx.send(event) {
            log::trace!("Event dropped (no observers): {}", e);
        }
    }
}

/// No-op emitter for tests and embedded use.
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: TowerEvent) {}
}
