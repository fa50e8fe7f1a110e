//! The routing authority of the encoding pipeline.
//!
//! On every pump tick [`EncoderManager::next_frame`] selects exactly one
//! source - upstream program audio, grace-period silence, or fallback tone -
//! and forwards one canonical PCM frame to the supervisor. It owns the
//! supervisor exclusively, derives the operational mode published to
//! observers, and supplies MP3 frames to the fan-out edge with a never-None
//! guarantee.
//!
//! Supervisor state transitions arrive over a typed channel and are applied
//! by a dedicated consumer task; no callback ever crosses components
//! synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::{silence_frame, FallbackProvider, FrameRingBuffer, FrameRingBufferStats};
use crate::encoder::admission::{Admission, AudioState};
use crate::encoder::supervisor::SupervisorState;
use crate::encoder::{derive_mode, mp3, EncoderError, FfmpegSupervisor, OperationalMode};
use crate::events::{EventEmitter, TowerEvent};
use crate::protocol_constants::{GET_FRAME_WAIT, PCM_FRAME_BYTES, PCM_POP_TIMEOUT, SAMPLE_RATE};
use crate::pump::FrameSource;
use crate::state::EncoderConfig;
use crate::TowerError;

/// Per-buffer statistics exposed through the status API.
#[derive(Debug, Clone, Copy)]
pub struct ManagerBufferStats {
    pub pcm: FrameRingBufferStats,
    pub mp3: FrameRingBufferStats,
}

/// Supervisor health snapshot exposed through the status API.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EncoderStatus {
    pub state: &'static str,
    pub restart_attempts: u32,
}

/// Single routing authority between the ingest edge, the fallback provider,
/// and the encoder supervisor.
pub struct EncoderManager {
    config: EncoderConfig,
    pcm_buffer: Arc<FrameRingBuffer>,
    mp3_buffer: Arc<FrameRingBuffer>,
    supervisor: RwLock<Option<Arc<FfmpegSupervisor>>>,
    admission: Mutex<Admission>,
    fallback: Mutex<FallbackProvider>,
    silence_mp3: Bytes,
    shutdown: AtomicBool,
    events: Arc<dyn EventEmitter>,
    last_mode: Mutex<Option<OperationalMode>>,
    recovery: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EncoderManager {
    /// Builds the manager and its buffers. Does not start anything.
    pub fn new(config: EncoderConfig, events: Arc<dyn EventEmitter>) -> Result<Self, TowerError> {
        config.validate().map_err(TowerError::Configuration)?;

        let pcm_buffer = Arc::new(FrameRingBuffer::with_frame_size(
            config.pcm_buffer_capacity,
            PCM_FRAME_BYTES,
        )?);
        let mp3_buffer = Arc::new(FrameRingBuffer::new(config.mp3_buffer_capacity)?);
        let silence_mp3 = mp3::silence_frame(config.bitrate_kbps, SAMPLE_RATE);
        let admission = Admission::new(
            config.threshold_frames,
            Duration::from_millis(config.loss_ms),
            Duration::from_millis(config.grace_ms),
        );
        let fallback = FallbackProvider::new(config.fallback_tone);

        Ok(Self {
            config,
            pcm_buffer,
            mp3_buffer,
            supervisor: RwLock::new(None),
            admission: Mutex::new(admission),
            fallback: Mutex::new(fallback),
            silence_mp3,
            shutdown: AtomicBool::new(false),
            events,
            last_mode: Mutex::new(None),
            recovery: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Handle to the upstream PCM buffer; the ingest edge writes here.
    pub fn pcm_buffer(&self) -> Arc<FrameRingBuffer> {
        Arc::clone(&self.pcm_buffer)
    }

    /// Snapshot of both buffer statistics.
    pub fn buffer_stats(&self) -> ManagerBufferStats {
        ManagerBufferStats {
            pcm: self.pcm_buffer.stats(),
            mp3: self.mp3_buffer.stats(),
        }
    }

    /// Starts the supervisor (when the encoder is enabled) and the
    /// supervisor-event consumer task.
    pub async fn start(self: &Arc<Self>) -> Result<(), EncoderError> {
        if !self.config.enabled {
            log::info!("Encoder disabled (OFFLINE_TEST_MODE) - supervisor not created");
            self.publish_mode();
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(FfmpegSupervisor::new(
            self.config.clone(),
            Arc::clone(&self.mp3_buffer),
            tx,
        ));
        *self.supervisor.write() = Some(Arc::clone(&supervisor));

        let manager = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            manager.consume_supervisor_events(rx).await;
        }));

        supervisor.start().await?;
        self.publish_mode();
        log::info!("EncoderManager started");
        Ok(())
    }

    /// Stops the manager: supervisor teardown, recovery cancel, and a
    /// permanent switch to silence for any late callers. Idempotent.
    pub async fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping EncoderManager");
        self.stop_recovery();

        let supervisor = self.supervisor.write().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop(Duration::from_millis(500)).await;
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        log::info!("EncoderManager stopped");
    }

    /// Supervisor health snapshot, `None` until a supervisor exists.
    pub fn encoder_status(&self) -> Option<EncoderStatus> {
        self.supervisor.read().as_ref().map(|s| EncoderStatus {
            state: s.get_state().as_str(),
            restart_attempts: s.restart_attempts(),
        })
    }

    /// Current operational mode, derived from observable state.
    pub fn mode(&self) -> OperationalMode {
        let supervisor_state = self.supervisor.read().as_ref().map(|s| s.get_state());
        let admission = self.admission.lock().snapshot();
        derive_mode(self.config.enabled, supervisor_state, admission)
    }

    /// Returns one MP3 frame for the fan-out edge. Never returns an empty
    /// payload once the system has advanced past COLD_START: when the output
    /// buffer stays empty through a bounded wait, the canonical silence MP3
    /// frame is substituted.
    pub async fn get_frame(&self) -> Bytes {
        if self.shutdown.load(Ordering::SeqCst) || !self.config.enabled {
            return self.silence_mp3.clone();
        }

        let supervisor = self.supervisor.read().as_ref().map(Arc::clone);
        let Some(supervisor) = supervisor else {
            return self.silence_mp3.clone();
        };

        match supervisor.get_state() {
            SupervisorState::Running | SupervisorState::Booting => {
                if let Some(frame) = self.mp3_buffer.pop() {
                    return frame;
                }
                match self.mp3_buffer.pop_timeout(GET_FRAME_WAIT).await {
                    Some(frame) => frame,
                    None => self.silence_mp3.clone(),
                }
            }
            _ => {
                // Keep draining so queued frames cannot accumulate while the
                // encoder is down; listeners get silence.
                let _ = self.mp3_buffer.pop();
                self.silence_mp3.clone()
            }
        }
    }

    // ── Per-tick selection ───────────────────────────────────────────────

    async fn tick(&self) -> Bytes {
        if self.shutdown.load(Ordering::SeqCst) {
            return silence_frame();
        }

        let mode = self.mode();
        match mode {
            OperationalMode::OfflineTestMode | OperationalMode::ColdStart => {
                // No supervisor to feed; the caller still gets canonical
                // silence.
                silence_frame()
            }

            OperationalMode::Booting
            | OperationalMode::RestartRecovery
            | OperationalMode::Degraded => {
                let now = Instant::now();
                {
                    let mut admission = self.admission.lock();
                    admission.reset_counter();
                    admission.ensure_grace(now);
                }
                let frame = self.fallback_frame(now);
                if mode == OperationalMode::Booting {
                    // The encoder must receive PCM while booting, so even
                    // fallback rides the program path.
                    self.forward_pcm(&frame).await;
                } else {
                    self.forward_fallback(&frame).await;
                }
                frame
            }

            OperationalMode::LiveInput | OperationalMode::FallbackOnly => {
                let pcm = self.pcm_buffer.pop_timeout(PCM_POP_TIMEOUT).await;
                let now = Instant::now();
                match pcm {
                    Some(frame) => {
                        let threshold_met = self.admission.lock().observe_pcm(now);
                        if threshold_met {
                            self.admission.lock().admit_program(true);
                            self.forward_pcm(&frame).await;
                            self.publish_mode();
                            frame
                        } else {
                            // A stray frame must not be admitted.
                            self.admission.lock().hold_pre_admission(now, true);
                            let fallback = self.fallback_frame(now);
                            self.forward_fallback(&fallback).await;
                            fallback
                        }
                    }
                    None => {
                        let demoted = self.admission.lock().observe_absence(now, true);
                        if demoted {
                            self.publish_mode();
                        }
                        let fallback = self.fallback_frame(now);
                        self.forward_fallback(&fallback).await;
                        fallback
                    }
                }
            }
        }
    }

    /// Selects the fallback payload: silence while the grace timer is young,
    /// the provider's frame afterwards.
    fn fallback_frame(&self, now: Instant) -> Bytes {
        let supervisor_running = self.supervisor_running();
        let in_grace = {
            let mut admission = self.admission.lock();
            if admission.in_grace(now) {
                true
            } else {
                admission.note_tone_phase(supervisor_running);
                false
            }
        };
        if in_grace {
            silence_frame()
        } else {
            self.fallback.lock().next_frame()
        }
    }

    fn supervisor_running(&self) -> bool {
        self.supervisor
            .read()
            .as_ref()
            .map(|s| s.get_state() == SupervisorState::Running)
            .unwrap_or(false)
    }

    /// Program-path write. Forwards only while BOOTING (the encoder needs
    /// continuous stdin regardless of source) or while program audio is
    /// admitted.
    async fn forward_pcm(&self, frame: &Bytes) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let supervisor = self.supervisor.read().as_ref().map(Arc::clone);
        let Some(supervisor) = supervisor else {
            return;
        };
        match supervisor.get_state() {
            SupervisorState::Booting => supervisor.write_pcm(frame).await,
            SupervisorState::Running => {
                if self.admission.lock().state() == AudioState::Program {
                    supervisor.write_pcm(frame).await;
                }
            }
            _ => {}
        }
    }

    /// Fallback-path write. The supervisor itself drops frames outside
    /// BOOTING/RUNNING, so restart and failure windows degrade to no-ops.
    async fn forward_fallback(&self, frame: &Bytes) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let supervisor = self.supervisor.read().as_ref().map(Arc::clone);
        let Some(supervisor) = supervisor else {
            return;
        };
        if matches!(
            supervisor.get_state(),
            SupervisorState::Booting
                | SupervisorState::Running
                | SupervisorState::Restarting
                | SupervisorState::Failed
        ) {
            supervisor.write_pcm(frame).await;
        }
    }

    // ── Supervisor event handling ────────────────────────────────────────

    async fn consume_supervisor_events(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SupervisorState>,
    ) {
        while let Some(state) = rx.recv().await {
            self.events.emit(TowerEvent::EncoderState {
                state: state.as_str().to_string(),
            });

            let now = Instant::now();
            match state {
                SupervisorState::Booting => {
                    self.admission.lock().reset(now, "encoder booting", false);
                }
                SupervisorState::Restarting => {
                    self.admission.lock().reset(now, "encoder restart", false);
                }
                SupervisorState::Running => {
                    // Post-(re)start: admission restarts from zero and
                    // fallback stays active until the threshold is met
                    // again.
                    let mut admission = self.admission.lock();
                    admission.reset_counter();
                    admission.ensure_grace(now);
                    admission.set_state(
                        AudioState::FallbackTone,
                        "encoder running, awaiting program",
                        true,
                    );
                }
                SupervisorState::Failed => {
                    self.admission
                        .lock()
                        .set_state(AudioState::Degraded, "encoder failed", false);
                }
                SupervisorState::Starting | SupervisorState::Stopped => {}
            }

            if state == SupervisorState::Failed {
                self.start_recovery();
            } else {
                self.stop_recovery();
            }
            self.publish_mode();
        }
    }

    fn publish_mode(&self) {
        let mode = self.mode();
        let mut last = self.last_mode.lock();
        if *last != Some(mode) {
            if let Some(previous) = *last {
                log::info!(
                    "Operational mode: {} -> {}",
                    previous.as_str(),
                    mode.as_str()
                );
            } else {
                log::info!("Operational mode: {}", mode.as_str());
            }
            *last = Some(mode);
            self.events.emit(TowerEvent::ModeChanged {
                mode: mode.as_str().to_string(),
            });
        }
    }

    // ── DEGRADED self-healing ────────────────────────────────────────────

    fn start_recovery(self: &Arc<Self>) {
        let mut slot = self.recovery.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let interval = Duration::from_secs(self.config.recovery_minutes * 60);
        log::info!(
            "Recovery task started (retry interval: {} minutes)",
            self.config.recovery_minutes
        );

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let supervisor = manager.supervisor.read().as_ref().map(Arc::clone);
                let Some(supervisor) = supervisor else { break };
                if supervisor.get_state() == SupervisorState::Failed {
                    log::info!("Recovery attempt: resetting restart budget");
                    supervisor.begin_recovery();
                } else {
                    log::info!("Encoder recovered, stopping recovery task");
                    break;
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn stop_recovery(&self) {
        if let Some(token) = self.recovery.lock().take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl FrameSource for EncoderManager {
    async fn next_frame(&self) -> Bytes {
        self.tick().await
    }
}
