//! Tower Core - broadcast-grade audio encoding pipeline.
//!
//! This crate guarantees uninterrupted MP3 output to HTTP listeners
//! regardless of upstream PCM availability, encoder process health, or
//! client behavior. It ingests canonical PCM frames from a network source,
//! paces them through an external MP3 encoder subprocess, and fans the
//! resulting stream out to concurrent listeners.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`pump`]: the single 24ms metronome driving all downstream activity
//! - [`encoder`]: the routing authority, admission machine, and the
//!   self-healing encoder process supervisor
//! - [`audio`]: the shared frame ring buffer and fallback PCM synthesis
//! - [`ingest`]: the PCM validation edge
//! - [`api`]: HTTP fan-out, health/status, and the event WebSocket
//! - [`stream`]: now-playing metadata and ICY injection
//! - [`bootstrap`]: the composition root
//! - [`events`]: event system for real-time observers
//! - [`state`]: configuration
//! - [`error`]: centralized error types
//!
//! There is exactly one timing loop in the system (the pump); every other
//! component reacts on demand. The encoder supervisor is source-agnostic
//! and treats every valid 4608-byte PCM frame identically - source
//! selection between program audio, grace silence, and fallback tone is the
//! EncoderManager's job alone.

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod bootstrap;
pub mod encoder;
pub mod error;
pub mod events;
pub mod ingest;
pub mod protocol_constants;
pub mod pump;
pub mod state;
pub mod stream;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState};
pub use audio::{silence_frame, FallbackProvider, FrameRingBuffer, FrameRingBufferStats};
pub use bootstrap::{bootstrap_services, TowerServices};
pub use encoder::{EncoderError, EncoderManager, FfmpegSupervisor, OperationalMode};
pub use error::{TowerError, TowerResult};
pub use events::{BroadcastEventBridge, EventEmitter, TowerEvent};
pub use ingest::{FrameAssembler, IngestStats, PcmIngest};
pub use pump::{AudioPump, FrameSource};
pub use state::{Config, EncoderConfig, StreamingConfig};
pub use stream::{IcyInjector, SharedMetadata, StreamMetadata};
