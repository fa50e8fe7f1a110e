//! Encoding pipeline: supervisor, routing authority, admission machine, and
//! the MP3 output edge.

pub mod admission;
pub mod manager;
pub mod mp3;
pub mod supervisor;

use thiserror::Error;

use crate::encoder::admission::{AdmissionSnapshot, AudioState};
use crate::encoder::supervisor::SupervisorState;

pub use manager::EncoderManager;
pub use supervisor::FfmpegSupervisor;

/// Errors raised by the encoding pipeline.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The supervisor was asked to launch the encoder subprocess without
    /// explicit permission. Tests must opt in via `allow_spawn`.
    #[error(
        "encoder subprocess launch not permitted: set allow_spawn=true \
         (production) or keep the encoder disabled (tests)"
    )]
    SpawnNotPermitted,

    /// The encoder binary could not be spawned.
    #[error("failed to spawn encoder process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Start was called twice.
    #[error("encoder already started")]
    AlreadyStarted,
}

/// Coarse, externally-visible label describing the current output source and
/// pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    ColdStart,
    Booting,
    LiveInput,
    FallbackOnly,
    RestartRecovery,
    Degraded,
    OfflineTestMode,
}

impl OperationalMode {
    /// Returns the mode as an uppercase string identifier.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ColdStart => "COLD_START",
            Self::Booting => "BOOTING",
            Self::LiveInput => "LIVE_INPUT",
            Self::FallbackOnly => "FALLBACK_ONLY",
            Self::RestartRecovery => "RESTART_RECOVERY",
            Self::Degraded => "DEGRADED",
            Self::OfflineTestMode => "OFFLINE_TEST_MODE",
        }
    }
}

/// Derives the operational mode from observable state. Pure and
/// deterministic: two calls with the same inputs return the same mode.
pub(crate) fn derive_mode(
    encoder_enabled: bool,
    supervisor: Option<SupervisorState>,
    admission: AdmissionSnapshot,
) -> OperationalMode {
    if !encoder_enabled {
        return OperationalMode::OfflineTestMode;
    }
    match supervisor {
        None | Some(SupervisorState::Stopped) | Some(SupervisorState::Starting) => {
            OperationalMode::ColdStart
        }
        Some(SupervisorState::Booting) => OperationalMode::Booting,
        Some(SupervisorState::Running) => {
            if admission.state == AudioState::Program && admission.threshold_met {
                OperationalMode::LiveInput
            } else {
                OperationalMode::FallbackOnly
            }
        }
        Some(SupervisorState::Restarting) => OperationalMode::RestartRecovery,
        Some(SupervisorState::Failed) => OperationalMode::Degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(state: AudioState, threshold_met: bool) -> AdmissionSnapshot {
        AdmissionSnapshot {
            state,
            threshold_met,
        }
    }

    #[test]
    fn disabled_encoder_is_offline_test_mode() {
        assert_eq!(
            derive_mode(false, None, snap(AudioState::SilenceGrace, false)),
            OperationalMode::OfflineTestMode
        );
        // Disabled wins over any supervisor state.
        assert_eq!(
            derive_mode(
                false,
                Some(SupervisorState::Running),
                snap(AudioState::Program, true)
            ),
            OperationalMode::OfflineTestMode
        );
    }

    #[test]
    fn absent_or_stopped_supervisor_is_cold_start() {
        let s = snap(AudioState::SilenceGrace, false);
        assert_eq!(derive_mode(true, None, s), OperationalMode::ColdStart);
        assert_eq!(
            derive_mode(true, Some(SupervisorState::Stopped), s),
            OperationalMode::ColdStart
        );
        assert_eq!(
            derive_mode(true, Some(SupervisorState::Starting), s),
            OperationalMode::ColdStart
        );
    }

    #[test]
    fn running_splits_on_admission() {
        assert_eq!(
            derive_mode(
                true,
                Some(SupervisorState::Running),
                snap(AudioState::Program, true)
            ),
            OperationalMode::LiveInput
        );
        assert_eq!(
            derive_mode(
                true,
                Some(SupervisorState::Running),
                snap(AudioState::SilenceGrace, false)
            ),
            OperationalMode::FallbackOnly
        );
        // Threshold without PROGRAM (loss window active) is still fallback.
        assert_eq!(
            derive_mode(
                true,
                Some(SupervisorState::Running),
                snap(AudioState::FallbackTone, true)
            ),
            OperationalMode::FallbackOnly
        );
    }

    #[test]
    fn restart_and_failure_map_directly() {
        let s = snap(AudioState::SilenceGrace, false);
        assert_eq!(
            derive_mode(true, Some(SupervisorState::Booting), s),
            OperationalMode::Booting
        );
        assert_eq!(
            derive_mode(true, Some(SupervisorState::Restarting), s),
            OperationalMode::RestartRecovery
        );
        assert_eq!(
            derive_mode(true, Some(SupervisorState::Failed), s),
            OperationalMode::Degraded
        );
    }

    #[test]
    fn derivation_is_pure() {
        let s = snap(AudioState::Program, true);
        let a = derive_mode(true, Some(SupervisorState::Running), s);
        let b = derive_mode(true, Some(SupervisorState::Running), s);
        assert_eq!(a, b);
    }
}
