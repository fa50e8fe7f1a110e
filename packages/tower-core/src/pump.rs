//! The 24ms metronome.
//!
//! [`AudioPump`] is the single timing authority of the pipeline: one
//! background task firing every frame interval and calling
//! [`FrameSource::next_frame`]. Every other component reacts on demand. The
//! pump never generates audio and never selects sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::FRAME_INTERVAL;

/// Seam between the metronome and the routing authority. Tests provide
/// fakes at construction.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Routes and returns exactly one canonical PCM frame for this tick.
    async fn next_frame(&self) -> Bytes;
}

/// Drives one [`FrameSource::next_frame`] call every 24ms.
///
/// Late ticks may skip catch-up firings, but the schedule stays aligned to
/// the original start so there is no cumulative drift.
pub struct AudioPump {
    source: Arc<dyn FrameSource>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    ticks: Arc<AtomicU64>,
}

impl AudioPump {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total ticks fired since start.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Spawns the tick task. Calling start twice is a no-op.
    pub fn start(&self) {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return;
        }

        let source = Arc::clone(&self.source);
        let cancel = self.cancel.clone();
        let ticks = Arc::clone(&self.ticks);

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!(
                "AudioPump started ({}ms tick interval)",
                FRAME_INTERVAL.as_millis()
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                ticks.fetch_add(1, Ordering::Relaxed);

                // One bad tick must not stall subsequent ticks.
                let tick = std::panic::AssertUnwindSafe(source.next_frame());
                if let Err(panic) = tick.catch_unwind().await {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!("AudioPump tick failed: {msg}");
                }
            }
            log::info!("AudioPump stopped");
        }));
    }

    /// Signals shutdown and joins the tick task with a bounded timeout.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .is_err()
            {
                log::warn!("AudioPump task did not stop within timeout, abandoning");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn next_frame(&self) -> Bytes {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Bytes::from_static(&[0u8; 4])
        }
    }

    struct PanickySource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl FrameSource for PanickySource {
        async fn next_frame(&self) -> Bytes {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("tick exploded");
            }
            Bytes::from_static(&[0u8; 4])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_frame_cadence() {
        let source = Arc::new(CountingSource {
            calls: AtomicU64::new(0),
        });
        let pump = AudioPump::new(Arc::clone(&source) as Arc<dyn FrameSource>);
        pump.start();

        // One second of paused-clock time: 1000/24 ≈ 41.67, and the first
        // interval tick fires immediately.
        for _ in 0..1000 {
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        pump.stop().await;

        let calls = source.calls.load(Ordering::SeqCst);
        assert!(
            (38..=45).contains(&calls),
            "expected ~42 ticks over one second, got {calls}"
        );
        assert_eq!(pump.tick_count(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn one_bad_tick_does_not_stall_the_loop() {
        let source = Arc::new(PanickySource {
            calls: AtomicU64::new(0),
        });
        let pump = AudioPump::new(Arc::clone(&source) as Arc<dyn FrameSource>);
        pump.start();

        for _ in 0..240 {
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        pump.stop().await;

        assert!(
            source.calls.load(Ordering::SeqCst) > 1,
            "ticks should continue after a panicking tick"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_and_halts_ticking() {
        let source = Arc::new(CountingSource {
            calls: AtomicU64::new(0),
        });
        let pump = AudioPump::new(Arc::clone(&source) as Arc<dyn FrameSource>);
        pump.start();

        for _ in 0..48 {
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        pump.stop().await;
        let after_stop = source.calls.load(Ordering::SeqCst);

        for _ in 0..480 {
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn start_twice_spawns_one_task() {
        let source = Arc::new(CountingSource {
            calls: AtomicU64::new(0),
        });
        let pump = AudioPump::new(source as Arc<dyn FrameSource>);
        pump.start();
        pump.start();
        pump.stop().await;
    }
}
