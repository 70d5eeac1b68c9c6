//! Stats aggregator: periodically snapshots per-camera and system metrics
//! into an immutable structure for external consumption.
//!
//! Publication is copy-then-publish: a snapshot is fully built, wrapped in an
//! `Arc`, and only then swapped into the shared slot and broadcast to push
//! subscribers. Consumers never observe a partially updated snapshot.

use crate::collector::CollectorMetrics;
use crate::registry::CameraRegistry;
use crate::session::{CameraMetricsSnapshot, SessionState};
use crate::types::ChannelId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Host-level resource counters, read from the hosting environment.
#[derive(Debug, Clone, Serialize, Default)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_percent: f32,
}

/// Summary of one channel's most recent detection result.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSummary {
    pub detection_count: usize,
    pub top_label: Option<String>,
    pub max_confidence: Option<f32>,
    pub captured_wall: DateTime<Utc>,
}

/// Per-camera summary inside a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    pub channel: ChannelId,
    pub state: SessionState,
    #[serde(flatten)]
    pub metrics: CameraMetricsSnapshot,
    pub last_detection: Option<DetectionSummary>,
}

/// Immutable point-in-time copy of system-wide counters and per-camera
/// summaries.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub active_cameras: usize,
    pub total_fps: f64,
    pub average_fps: f64,
    pub avg_decode_ms: f64,
    pub avg_inference_ms: f64,
    pub frames_processed_total: u64,
    pub frames_dropped_total: u64,
    pub batches_submitted: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub host: HostStats,
    pub cameras: Vec<CameraStats>,
}

impl StatsSnapshot {
    fn empty() -> Self {
        Self {
            generated_at: Utc::now(),
            active_cameras: 0,
            total_fps: 0.0,
            average_fps: 0.0,
            avg_decode_ms: 0.0,
            avg_inference_ms: 0.0,
            frames_processed_total: 0,
            frames_dropped_total: 0,
            batches_submitted: 0,
            batches_completed: 0,
            batches_failed: 0,
            host: HostStats::default(),
            cameras: Vec::new(),
        }
    }

    /// Whether any camera is in error state; drives the health endpoint.
    pub fn degraded(&self) -> bool {
        self.cameras.iter().any(|c| c.state == SessionState::Error)
    }
}

/// Periodically builds and publishes stats snapshots.
pub struct StatsAggregator {
    registry: Arc<CameraRegistry>,
    collector_metrics: Arc<CollectorMetrics>,
    interval: std::time::Duration,
    latest: RwLock<Arc<StatsSnapshot>>,
    publisher: broadcast::Sender<Arc<StatsSnapshot>>,
    system: Mutex<System>,
}

impl StatsAggregator {
    pub fn new(
        registry: Arc<CameraRegistry>,
        collector_metrics: Arc<CollectorMetrics>,
        interval: std::time::Duration,
        broadcast_capacity: usize,
    ) -> Self {
        let (publisher, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            registry,
            collector_metrics,
            interval,
            latest: RwLock::new(Arc::new(StatsSnapshot::empty())),
            publisher,
            system: Mutex::new(System::new()),
        }
    }

    /// The most recently published snapshot. Never mid-update state.
    pub fn latest(&self) -> Arc<StatsSnapshot> {
        self.latest.read().clone()
    }

    /// Register a push consumer; it receives one snapshot per publish cycle
    /// until dropped. A slow subscriber only lags its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StatsSnapshot>> {
        self.publisher.subscribe()
    }

    /// Per-camera stats for one channel, if active.
    pub fn camera_stats(&self, channel: ChannelId) -> Option<CameraStats> {
        let session = self.registry.get(channel)?;
        Some(camera_stats_for(&session))
    }

    /// Build one snapshot from current session metrics, collector counters,
    /// and host resource figures.
    pub fn build_snapshot(&self) -> StatsSnapshot {
        let sessions = self.registry.sessions();
        let cameras: Vec<CameraStats> = sessions.iter().map(|s| camera_stats_for(s)).collect();

        let active_cameras = cameras.len();
        let total_fps: f64 = cameras.iter().map(|c| c.metrics.fps).sum();
        let average_fps = if active_cameras > 0 {
            total_fps / active_cameras as f64
        } else {
            0.0
        };
        let avg_decode_ms = if active_cameras > 0 {
            cameras.iter().map(|c| c.metrics.avg_decode_ms).sum::<f64>() / active_cameras as f64
        } else {
            0.0
        };
        let frames_processed_total = cameras.iter().map(|c| c.metrics.frames_processed).sum();
        let frames_dropped_total = cameras.iter().map(|c| c.metrics.frames_dropped).sum();

        StatsSnapshot {
            generated_at: Utc::now(),
            active_cameras,
            total_fps,
            average_fps,
            avg_decode_ms,
            avg_inference_ms: self.collector_metrics.avg_inference_ms(),
            frames_processed_total,
            frames_dropped_total,
            batches_submitted: self.collector_metrics.batches_submitted(),
            batches_completed: self.collector_metrics.batches_completed(),
            batches_failed: self.collector_metrics.batches_failed(),
            host: self.read_host_stats(),
            cameras,
        }
    }

    fn read_host_stats(&self) -> HostStats {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let memory_used = system.used_memory();
        let memory_total = system.total_memory();
        let memory_percent = if memory_total > 0 {
            (memory_used as f64 / memory_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        HostStats {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: memory_used / (1024 * 1024),
            memory_total_mb: memory_total / (1024 * 1024),
            memory_percent,
        }
    }

    /// Build, publish, and broadcast one snapshot.
    pub fn publish_cycle(&self) {
        let snapshot = Arc::new(self.build_snapshot());
        *self.latest.write() = snapshot.clone();
        // No receivers is fine; polling consumers use `latest`.
        let _ = self.publisher.send(snapshot);
    }

    /// Drive publication on the configured cadence until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Stats aggregator started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.publish_cycle();
                    debug!("Stats snapshot published");
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!("Stats aggregator stopped");
    }
}

fn camera_stats_for(session: &crate::session::CaptureSession) -> CameraStats {
    let last_detection = session.latest_detection().map(|result| {
        let top = result
            .detections
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        DetectionSummary {
            detection_count: result.detections.len(),
            top_label: top.map(|d| d.label.clone()),
            max_confidence: top.map(|d| d.confidence),
            captured_wall: result.captured_wall,
        }
    });

    CameraStats {
        channel: session.channel(),
        state: session.state(),
        metrics: session.metrics_snapshot(),
        last_detection,
    }
}
