//! End-to-end lifecycle tests driving the engine through its public API,
//! with synthetic sources standing in for camera hardware.

use gridwatch::collector::BatchCollector;
use gridwatch::config::{BatchConfig, CaptureConfig};
use gridwatch::detector::SyntheticDetector;
use gridwatch::registry::{CameraRegistry, RegistryError};
use gridwatch::source::{SyntheticSourceConfig, SyntheticSourceFactory};
use gridwatch::stats::StatsAggregator;
use gridwatch::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn test_capture_config() -> CaptureConfig {
    CaptureConfig {
        queue_capacity: 8,
        io_timeout_ms: 20,
        ..CaptureConfig::default()
    }
}

fn test_registry() -> Arc<CameraRegistry> {
    let factory = Arc::new(SyntheticSourceFactory::new(SyntheticSourceConfig {
        width: 16,
        height: 16,
        fps: 100.0,
    }));
    Arc::new(CameraRegistry::new(test_capture_config(), factory))
}

/// The full control-plane scenario: start, duplicate start, stop, duplicate
/// stop, and an out-of-range channel.
#[test]
fn control_plane_scenario() {
    let registry = test_registry();

    registry.start(1).expect("start 1");
    registry.start(2).expect("start 2");
    assert_eq!(registry.list_active(), vec![1, 2]);

    assert!(matches!(
        registry.start(1),
        Err(RegistryError::AlreadyActive(1))
    ));
    assert_eq!(registry.list_active(), vec![1, 2]);

    registry.stop(1).expect("stop 1");
    assert_eq!(registry.list_active(), vec![2]);

    assert!(matches!(registry.stop(1), Err(RegistryError::NotActive(1))));
    assert_eq!(registry.list_active(), vec![2]);

    assert!(matches!(
        registry.start(99),
        Err(RegistryError::InvalidChannel { channel: 99, .. })
    ));
    assert_eq!(registry.list_active(), vec![2]);

    registry.stop_all();
    assert!(registry.list_active().is_empty());
}

/// Frames flow from capture through batching and inference back into session
/// detection state, and the published snapshot is self-consistent.
#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_detection_flow() {
    let registry = test_registry();
    let pool = Arc::new(WorkerPool::new(2));
    let collector = Arc::new(BatchCollector::new(
        registry.clone(),
        pool.clone(),
        Arc::new(SyntheticDetector::new()),
        BatchConfig {
            window_ms: 50,
            ..BatchConfig::default()
        },
    ));
    let aggregator = Arc::new(StatsAggregator::new(
        registry.clone(),
        collector.metrics(),
        Duration::from_millis(100),
        8,
    ));

    registry.start(1).unwrap();
    registry.start(2).unwrap();
    registry.start(3).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector_handle = tokio::spawn(collector.clone().run(shutdown_rx.clone()));
    let aggregator_handle = tokio::spawn(aggregator.clone().run(shutdown_rx));

    // Every camera eventually receives a detection result.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let with_results = registry
            .sessions()
            .iter()
            .filter(|s| s.latest_detection().is_some())
            .count();
        if with_results == 3 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "detections never reached all cameras"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Snapshot consistency over live data.
    let snapshot = aggregator.build_snapshot();
    assert_eq!(snapshot.active_cameras, 3);
    assert_eq!(snapshot.cameras.len(), 3);
    if snapshot.active_cameras > 0 {
        let expected = snapshot.total_fps / snapshot.active_cameras as f64;
        assert!((snapshot.average_fps - expected).abs() < 1e-9);
    }
    assert!(snapshot.frames_processed_total >= 3);
    assert!(snapshot.batches_completed >= 1);

    // Push subscribers see published snapshots.
    let mut rx = aggregator.subscribe();
    let pushed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("publish cycle timed out")
        .expect("broadcast closed");
    assert_eq!(pushed.active_cameras, 3);

    // Graceful shutdown: cadence loops, cameras, then the pool.
    let _ = shutdown_tx.send(true);
    collector_handle.await.unwrap();
    aggregator_handle.await.unwrap();

    let stop_registry = registry.clone();
    tokio::task::spawn_blocking(move || stop_registry.stop_all())
        .await
        .unwrap();
    assert!(registry.list_active().is_empty());

    let stop_pool = pool.clone();
    tokio::task::spawn_blocking(move || stop_pool.shutdown())
        .await
        .unwrap();
}

/// Stopping one camera does not disturb the others.
#[tokio::test(flavor = "multi_thread")]
async fn stop_is_isolated_per_channel() {
    let registry = test_registry();
    registry.start(10).unwrap();
    registry.start(11).unwrap();

    // Let both produce frames.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let producing = registry
            .sessions()
            .iter()
            .filter(|s| s.metrics_snapshot().frames_total > 0)
            .count();
        if producing == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "cameras never produced frames");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stop_registry = registry.clone();
    tokio::task::spawn_blocking(move || stop_registry.stop(10))
        .await
        .unwrap()
        .unwrap();

    // Channel 11 keeps producing after 10 is gone.
    let session = registry.get(11).expect("channel 11 still active");
    let before = session.metrics_snapshot().frames_total;
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.metrics_snapshot().frames_total <= before {
        assert!(Instant::now() < deadline, "channel 11 stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stop_registry = registry.clone();
    tokio::task::spawn_blocking(move || stop_registry.stop_all())
        .await
        .unwrap();
}
