//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where the
//! pipeline is instantiated and wired together, bottom-up: buffers and
//! fallback inside the manager, then the pump, then the fan-out pump, then
//! the ingest edge. Tasks start only after the graph is complete, in strict
//! forward order, so no component ever observes a half-built upstream.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::encoder::{EncoderManager, OperationalMode};
use crate::error::{TowerError, TowerResult};
use crate::events::BroadcastEventBridge;
use crate::ingest::PcmIngest;
use crate::protocol_constants::FRAME_INTERVAL;
use crate::pump::{AudioPump, FrameSource};
use crate::state::Config;
use crate::stream::SharedMetadata;

/// Container for all bootstrapped services.
pub struct TowerServices {
    /// The routing authority.
    pub manager: Arc<EncoderManager>,
    /// PCM ingest edge (always constructed; its transport binds on start
    /// only when an ingest port is configured).
    pub ingest: Arc<PcmIngest>,
    /// Broadcast channel carrying MP3 frames to HTTP listeners.
    pub broadcast_tx: broadcast::Sender<Bytes>,
    /// Event bridge for WebSocket observers.
    pub events: Arc<BroadcastEventBridge>,
    /// Now-playing metadata slot shared with the HTTP surface.
    pub metadata: SharedMetadata,
    config: Config,
    pump: AudioPump,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

/// Bootstraps the pipeline with its dependencies. Nothing is started; call
/// [`TowerServices::start`] once the graph is in hand.
pub fn bootstrap_services(config: &Config) -> TowerResult<TowerServices> {
    config
        .validate()
        .map_err(TowerError::Configuration)?;

    let events = Arc::new(BroadcastEventBridge::new(
        config.streaming.event_channel_capacity,
    ));

    let manager = Arc::new(EncoderManager::new(
        config.encoder.clone(),
        Arc::clone(&events) as Arc<dyn crate::events::EventEmitter>,
    )?);

    let ingest = Arc::new(PcmIngest::new(manager.pcm_buffer()));

    let (broadcast_tx, _) = broadcast::channel(config.streaming.channel_capacity);

    let pump = AudioPump::new(Arc::clone(&manager) as Arc<dyn FrameSource>);

    Ok(TowerServices {
        manager,
        ingest,
        broadcast_tx,
        events,
        metadata: SharedMetadata::default(),
        config: config.clone(),
        pump,
        cancel_token: CancellationToken::new(),
        tasks: Mutex::new(Vec::new()),
        started_at: Instant::now(),
    })
}

impl TowerServices {
    /// Starts the pipeline in strict forward order: encoder manager (and its
    /// supervisor), then the metronome, then the fan-out pump, then the
    /// ingest transport.
    pub async fn start(&self) -> TowerResult<()> {
        self.manager.start().await.map_err(TowerError::from)?;
        self.pump.start();
        self.start_broadcast_pump();

        if let Some(port) = self.config.ingest_port {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|e| {
                    TowerError::Network(format!("failed to bind ingest port {port}: {e}"))
                })?;
            let ingest = Arc::clone(&self.ingest);
            let cancel = self.cancel_token.clone();
            self.tasks
                .lock()
                .push(tokio::spawn(ingest.run(listener, cancel)));
        }

        if let Some(port) = self.config.ingest_udp_port {
            let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port))
                .await
                .map_err(|e| {
                    TowerError::Network(format!("failed to bind ingest UDP port {port}: {e}"))
                })?;
            let ingest = Arc::clone(&self.ingest);
            let cancel = self.cancel_token.clone();
            self.tasks
                .lock()
                .push(tokio::spawn(ingest.run_udp(socket, cancel)));
        }

        log::info!("[Bootstrap] Pipeline started (mode: {})", self.mode().as_str());
        Ok(())
    }

    /// The internal consumer of `get_frame()`: pulls one MP3 frame per tick
    /// and fans it into the broadcast channel. Listener absence is fine; the
    /// send just reports no receivers.
    fn start_broadcast_pump(&self) {
        let manager = Arc::clone(&self.manager);
        let tx = self.broadcast_tx.clone();
        let cancel = self.cancel_token.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let frame = manager.get_frame().await;
                let _ = tx.send(frame);
            }
            log::debug!("[Bootstrap] Broadcast pump stopped");
        }));
    }

    /// Current operational mode.
    pub fn mode(&self) -> OperationalMode {
        self.manager.mode()
    }

    /// Builds the HTTP API state over these services.
    pub fn app_state(&self) -> AppState {
        AppState {
            manager: Arc::clone(&self.manager),
            broadcast_tx: self.broadcast_tx.clone(),
            events: Arc::clone(&self.events),
            listeners: Arc::new(DashMap::new()),
            ingest: (self.config.ingest_port.is_some() || self.config.ingest_udp_port.is_some())
                .then(|| Arc::clone(&self.ingest)),
            metadata: Arc::clone(&self.metadata),
            started_at: self.started_at,
        }
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.pump.stop().await;
        self.manager.stop().await;

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        log::info!("[Bootstrap] Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EncoderConfig;

    fn offline_config() -> Config {
        Config {
            encoder: EncoderConfig {
                enabled: false,
                ..Default::default()
            },
            ingest_port: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let mut config = offline_config();
        config.encoder.backoff_ms = vec![];
        assert!(bootstrap_services(&config).is_err());
    }

    #[tokio::test]
    async fn offline_bootstrap_reports_offline_mode() {
        let services = bootstrap_services(&offline_config()).unwrap();
        services.start().await.unwrap();
        assert_eq!(services.mode(), OperationalMode::OfflineTestMode);
        services.shutdown().await;
    }
}
