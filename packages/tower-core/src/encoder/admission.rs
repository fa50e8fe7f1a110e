//! Program-audio admission state machine.
//!
//! Tracks the consecutive run of upstream PCM frames observed on tick
//! boundaries, the grace timer that splits fallback output into a silence
//! phase and a tone phase, and the audio state label published alongside the
//! operational mode. Pure state: every method takes `now` so the manager
//! (and tests) control the clock.

use std::time::Duration;

use tokio::time::Instant;

/// Internal audio state of the routing authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    SilenceGrace,
    FallbackTone,
    Program,
    Degraded,
}

impl AudioState {
    /// Returns the state as an uppercase string identifier.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SilenceGrace => "SILENCE_GRACE",
            Self::FallbackTone => "FALLBACK_TONE",
            Self::Program => "PROGRAM",
            Self::Degraded => "DEGRADED",
        }
    }
}

/// Read-only view used for operational-mode derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub state: AudioState,
    pub threshold_met: bool,
}

/// Admission counters, grace timer, and audio-state transitions.
pub struct Admission {
    threshold_frames: u32,
    loss_window: Duration,
    grace_period: Duration,
    consecutive_frames: u32,
    last_pcm_at: Option<Instant>,
    grace_started_at: Option<Instant>,
    state: AudioState,
}

impl Admission {
    pub fn new(threshold_frames: u32, loss_window: Duration, grace_period: Duration) -> Self {
        Self {
            threshold_frames,
            loss_window,
            grace_period,
            consecutive_frames: 0,
            last_pcm_at: None,
            grace_started_at: None,
            state: AudioState::SilenceGrace,
        }
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            state: self.state,
            threshold_met: self.threshold_met(),
        }
    }

    pub fn state(&self) -> AudioState {
        self.state
    }

    pub fn threshold_met(&self) -> bool {
        self.consecutive_frames >= self.threshold_frames
    }

    /// Records one upstream PCM frame observed on a tick boundary. Returns
    /// true when the consecutive run now satisfies the admission threshold.
    pub fn observe_pcm(&mut self, now: Instant) -> bool {
        self.consecutive_frames = self.consecutive_frames.saturating_add(1);
        self.last_pcm_at = Some(now);
        self.threshold_met()
    }

    /// Admits program audio: clears the grace timer and enters PROGRAM.
    pub fn admit_program(&mut self, supervisor_running: bool) {
        self.grace_started_at = None;
        self.set_state(
            AudioState::Program,
            "PCM threshold satisfied",
            supervisor_running,
        );
    }

    /// Called on a tick that observed no upstream PCM. Pre-admission, an
    /// absent tick breaks the consecutive run; once in PROGRAM, the loss
    /// window governs instead, and absence beyond it demotes back to
    /// SILENCE_GRACE and resets the counter. Returns true when demotion
    /// happened.
    pub fn observe_absence(&mut self, now: Instant, supervisor_running: bool) -> bool {
        if self.state != AudioState::Program {
            self.consecutive_frames = 0;
        }
        if self.state == AudioState::Program {
            if let Some(last) = self.last_pcm_at {
                if now.duration_since(last) > self.loss_window {
                    log::warn!(
                        "PCM loss detected: no frames for {}ms (threshold: {}ms)",
                        now.duration_since(last).as_millis(),
                        self.loss_window.as_millis()
                    );
                    self.consecutive_frames = 0;
                    self.last_pcm_at = None;
                    self.set_state(AudioState::SilenceGrace, "PCM lost", supervisor_running);
                    self.ensure_grace(now);
                    return true;
                }
            }
        }
        // Grace runs even during a brief gap in PROGRAM, so sub-window
        // absences emit silence rather than jumping straight to tone.
        self.ensure_grace(now);
        false
    }

    /// A stray pre-threshold PCM frame must not admit program audio: keep a
    /// fallback-side audio state and make sure the grace timer runs.
    pub fn hold_pre_admission(&mut self, now: Instant, supervisor_running: bool) {
        if !matches!(
            self.state,
            AudioState::SilenceGrace | AudioState::FallbackTone
        ) {
            self.set_state(
                AudioState::SilenceGrace,
                "PCM below admission threshold",
                supervisor_running,
            );
        }
        self.ensure_grace(now);
    }

    /// Full reset: counter to zero, grace timer armed, SILENCE_GRACE.
    /// Used on supervisor restarts and startups.
    pub fn reset(&mut self, now: Instant, reason: &str, supervisor_running: bool) {
        self.consecutive_frames = 0;
        self.last_pcm_at = None;
        self.set_state(AudioState::SilenceGrace, reason, supervisor_running);
        self.grace_started_at = Some(now);
    }

    /// Resets the admission counter without touching the audio state (the
    /// fallback-driven modes do this every tick).
    pub fn reset_counter(&mut self) {
        self.consecutive_frames = 0;
    }

    /// Arms the grace timer if it is not already running.
    pub fn ensure_grace(&mut self, now: Instant) {
        if self.grace_started_at.is_none() {
            self.grace_started_at = Some(now);
        }
    }

    /// Whether fallback output is still inside its initial silence phase.
    pub fn in_grace(&self, now: Instant) -> bool {
        match self.grace_started_at {
            Some(start) => now.duration_since(start) < self.grace_period,
            None => false,
        }
    }

    /// Marks that fallback output has progressed into the tone phase.
    pub fn note_tone_phase(&mut self, supervisor_running: bool) {
        if self.state == AudioState::SilenceGrace {
            self.set_state(
                AudioState::FallbackTone,
                "grace period expired",
                supervisor_running,
            );
        }
    }

    /// Transitions the audio state, logging the transition. The one
    /// forbidden transition - FALLBACK_TONE back to SILENCE_GRACE while the
    /// supervisor is RUNNING - is rejected and logged at WARN.
    pub fn set_state(&mut self, new_state: AudioState, reason: &str, supervisor_running: bool) {
        if self.state == new_state {
            return;
        }
        if self.state == AudioState::FallbackTone
            && new_state == AudioState::SilenceGrace
            && supervisor_running
        {
            log::warn!(
                "Blocked invalid transition: FALLBACK_TONE -> SILENCE_GRACE \
                 (supervisor is RUNNING, reason: {reason})"
            );
            return;
        }
        log::info!(
            "Audio state transition: {} -> {} (reason: {})",
            self.state.as_str(),
            new_state.as_str(),
            reason
        );
        self.state = new_state;
    }
}
