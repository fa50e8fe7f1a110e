//! End-to-end wiring test with the encoder disabled.
//!
//! Exercises the full bootstrap graph - manager, pump, broadcast fan-out -
//! without launching any subprocess, and verifies the never-empty output
//! guarantee plus the shutdown time budget.

use std::time::{Duration, Instant};

use tower_core::{bootstrap_services, Config, EncoderConfig, OperationalMode};

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
async fn offline_pipeline_streams_synthetic_frames_end_to_end() {
    let services = bootstrap_services(&offline_config()).unwrap();
    services.start().await.unwrap();

    assert_eq!(services.mode(), OperationalMode::OfflineTestMode);

    // The broadcast pump must deliver frames at the output cadence even
    // with no encoder and no ingest attached.
    let mut rx = services.broadcast_tx.subscribe();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("no frame within 500ms")
            .expect("broadcast channel closed");
        assert!(!frame.is_empty());
        assert_eq!(frame[0], 0xFF, "expected a sync-aligned MP3 frame");
        assert_eq!(frame[1] & 0xE0, 0xE0);
    }

    // Direct pulls honor the never-empty guarantee too.
    let frame = services.manager.get_frame().await;
    assert!(!frame.is_empty());

    let begun = Instant::now();
    services.shutdown().await;
    assert!(
        begun.elapsed() < Duration::from_millis(200),
        "shutdown exceeded the test-mode budget: {:?}",
        begun.elapsed()
    );
}

#[tokio::test]
async fn pump_routes_silence_every_tick_from_cold_start() {
    let services = bootstrap_services(&offline_config()).unwrap();
    services.start().await.unwrap();

    // Give the metronome a few intervals of real time.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let frame = services.manager.get_frame().await;
    assert!(!frame.is_empty());

    services.shutdown().await;
}
