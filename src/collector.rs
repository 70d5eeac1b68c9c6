//! Batch collector: drains ready frames across cameras on a fixed cadence,
//! dispatches inference batches to the worker pool, and writes completed
//! results back into their sessions.
//!
//! Fairness: each cycle takes at most one frame per running camera, so a fast
//! camera cannot starve a slow one of inference cycles; the starting camera
//! rotates between cycles so the max-batch-size cutoff does not repeatedly
//! hit the same channels. This samples per-camera frame rate down to the
//! collection cadence, trading peak per-camera FPS for bounded, predictable
//! end-to-end latency across all cameras.
//!
//! Results flow back through explicit message passing: the completion handle
//! carries the batch's per-channel detections, and the dispatch step here is
//! the only writer of session detection fields. No callback ever re-enters
//! decode-thread state.

use crate::config::BatchConfig;
use crate::detector::{Detector, DetectorError};
use crate::registry::CameraRegistry;
use crate::session::CaptureSession;
use crate::types::{Batch, BatchItem, ChannelId, DetectionResult};
use crate::worker_pool::{TaskHandle, WorkerPool};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate counters for the batching/inference path.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    batches_submitted: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    frames_batched: AtomicU64,
    cycles_skipped_backlog: AtomicU64,
    inference_ewma_ms: AtomicU64,
}

const EWMA_ALPHA: f64 = 0.2;

impl CollectorMetrics {
    fn record_completed(&self, inference: Duration) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        let ms = inference.as_secs_f64() * 1000.0;
        let prev = f64::from_bits(self.inference_ewma_ms.load(Ordering::Relaxed));
        let next = if prev == 0.0 {
            ms
        } else {
            prev + EWMA_ALPHA * (ms - prev)
        };
        self.inference_ewma_ms.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn batches_submitted(&self) -> u64 {
        self.batches_submitted.load(Ordering::Relaxed)
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn frames_batched(&self) -> u64 {
        self.frames_batched.load(Ordering::Relaxed)
    }

    /// Rolling average inference time per batch, in milliseconds.
    pub fn avg_inference_ms(&self) -> f64 {
        f64::from_bits(self.inference_ewma_ms.load(Ordering::Relaxed))
    }
}

/// What the worker thread sends back through its completion handle.
struct BatchReply {
    batch_id: Uuid,
    results: Result<Vec<crate::detector::ChannelDetections>, DetectorError>,
    inference: Duration,
}

/// Capture-side facts about a frame in flight, kept out of the worker
/// closure so lag can be measured against the monotonic capture time.
struct InFlightFrame {
    channel: ChannelId,
    sequence: u64,
    captured_at: Instant,
    captured_wall: DateTime<Utc>,
}

struct PendingBatch {
    handle: TaskHandle<BatchReply>,
    frames: Vec<InFlightFrame>,
}

/// Assembles and dispatches inference batches on a fixed cadence.
pub struct BatchCollector {
    registry: Arc<CameraRegistry>,
    pool: Arc<WorkerPool>,
    detector: Arc<dyn Detector>,
    config: BatchConfig,
    metrics: Arc<CollectorMetrics>,
    pending: Mutex<Vec<PendingBatch>>,
}

impl BatchCollector {
    pub fn new(
        registry: Arc<CameraRegistry>,
        pool: Arc<WorkerPool>,
        detector: Arc<dyn Detector>,
        config: BatchConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            detector,
            config,
            metrics: Arc::new(CollectorMetrics::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn metrics(&self) -> Arc<CollectorMetrics> {
        self.metrics.clone()
    }

    /// One collector cycle: dispatch finished batches, then assemble and
    /// submit a new one. `rotation` advances so the starting camera differs
    /// between cycles.
    pub fn run_cycle(&self, rotation: &mut usize) {
        self.dispatch_completed();

        if self.pending.lock().len() >= self.config.max_inflight {
            self.metrics
                .cycles_skipped_backlog
                .fetch_add(1, Ordering::Relaxed);
            debug!("Inference backlog full, skipping collection cycle");
            return;
        }

        let sessions = self.registry.running_sessions();
        let batch = Self::assemble(&sessions, *rotation, self.config.max_batch_size);
        *rotation = rotation.wrapping_add(1);

        if batch.is_empty() {
            // No camera had a ready frame; nothing to do this cycle.
            return;
        }

        self.submit(batch);
    }

    /// Take at most one ready frame per running session, starting at
    /// `rotation` into the session list, until `max_size` frames are
    /// gathered.
    fn assemble(
        sessions: &[Arc<CaptureSession>],
        rotation: usize,
        max_size: usize,
    ) -> Batch {
        let mut items = Vec::new();
        let n = sessions.len();

        for i in 0..n {
            if items.len() >= max_size {
                break;
            }
            let session = &sessions[(rotation + i) % n];
            if let Some(frame) = session.take_latest_ready_frame() {
                items.push(BatchItem {
                    channel: session.channel(),
                    frame,
                });
            }
        }

        Batch::new(items)
    }

    fn submit(&self, batch: Batch) {
        let frames: Vec<InFlightFrame> = batch
            .items
            .iter()
            .map(|item| InFlightFrame {
                channel: item.channel,
                sequence: item.frame.sequence,
                captured_at: item.frame.captured_at,
                captured_wall: item.frame.captured_wall,
            })
            .collect();

        let batch_id = batch.id;
        let batch_len = batch.len();
        let detector = self.detector.clone();

        let submitted = self.pool.submit(move || {
            let started = Instant::now();
            let results = detector.infer(&batch);
            BatchReply {
                batch_id: batch.id,
                results,
                inference: started.elapsed(),
            }
        });

        match submitted {
            Ok(handle) => {
                self.metrics.batches_submitted.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .frames_batched
                    .fetch_add(batch_len as u64, Ordering::Relaxed);
                counter!("gridwatch_batches_submitted_total").increment(1);
                histogram!("gridwatch_batch_size").record(batch_len as f64);
                debug!(batch_id = %batch_id, size = batch_len, "Batch submitted");

                self.pending.lock().push(PendingBatch { handle, frames });
            }
            Err(e) => {
                // Pool is shutting down; the frames simply miss this cycle.
                warn!(batch_id = %batch_id, error = %e, "Batch submission rejected");
            }
        }
    }

    /// Drain completed handles and write each (channel, result) pair back
    /// into its session. Channels stopped since submission miss the result.
    pub fn dispatch_completed(&self) {
        let completed: Vec<(PendingBatch, Result<BatchReply, crate::worker_pool::WorkerError>)> = {
            let mut pending = self.pending.lock();
            let mut done = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].handle.is_finished() {
                    let entry = pending.swap_remove(i);
                    if let Some(result) = entry.handle.try_take() {
                        done.push((entry, result));
                    }
                } else {
                    i += 1;
                }
            }
            done
        };

        for (entry, result) in completed {
            match result {
                Ok(reply) => self.dispatch_reply(entry, reply),
                Err(fault) => {
                    self.metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                    counter!("gridwatch_batches_failed_total").increment(1);
                    warn!(error = %fault, "Inference work item faulted; cameras miss one result cycle");
                }
            }
        }
    }

    fn dispatch_reply(&self, entry: PendingBatch, reply: BatchReply) {
        let inference_ms = reply.inference.as_secs_f64() * 1000.0;

        let detections = match reply.results {
            Ok(detections) => detections,
            Err(e) => {
                self.metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                counter!("gridwatch_batches_failed_total").increment(1);
                warn!(batch_id = %reply.batch_id, error = %e, "Inference failed for batch");
                return;
            }
        };

        self.metrics.record_completed(reply.inference);
        histogram!("gridwatch_inference_ms").record(inference_ms);

        for channel_result in detections {
            let Some(frame) = entry
                .frames
                .iter()
                .find(|f| f.channel == channel_result.channel)
            else {
                warn!(
                    batch_id = %reply.batch_id,
                    channel = channel_result.channel,
                    "Result for a channel not in the batch"
                );
                continue;
            };

            let Some(session) = self.registry.get(channel_result.channel) else {
                // Stopped while the batch was in flight.
                debug!(channel = channel_result.channel, "Dropping result for stopped channel");
                continue;
            };

            let lag = frame.captured_at.elapsed();
            session.record_detection(
                DetectionResult {
                    channel: channel_result.channel,
                    sequence: frame.sequence,
                    captured_wall: frame.captured_wall,
                    inference_ms,
                    detections: channel_result.detections,
                },
                lag,
            );
        }
    }

    /// Number of batches awaiting dispatch.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drive the collector on its configured cadence until shutdown, then
    /// flush whatever already completed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.window());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rotation = 0usize;

        info!(
            window_ms = self.config.window_ms,
            max_batch_size = self.config.max_batch_size,
            "Batch collector started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle(&mut rotation);
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        self.dispatch_completed();
        info!(
            submitted = self.metrics.batches_submitted(),
            completed = self.metrics.batches_completed(),
            failed = self.metrics.batches_failed(),
            "Batch collector stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::detector::SyntheticDetector;
    use crate::session::SessionState;
    use crate::source::{SyntheticSourceConfig, SyntheticSourceFactory};
    use bytes::Bytes;
    use crate::types::Frame;

    fn create_test_registry() -> Arc<CameraRegistry> {
        let config = CaptureConfig {
            queue_capacity: 8,
            io_timeout_ms: 20,
            ..CaptureConfig::default()
        };
        let factory = Arc::new(SyntheticSourceFactory::new(SyntheticSourceConfig {
            width: 8,
            height: 8,
            fps: 100.0,
        }));
        Arc::new(CameraRegistry::new(config, factory))
    }

    fn create_manual_session(channel: ChannelId, frames: u64) -> Arc<CaptureSession> {
        let session = Arc::new(CaptureSession::new(channel, 8));
        session.force_state(SessionState::Running);
        for sequence in 0..frames {
            session.ingest_frame(Frame {
                channel,
                data: Bytes::from_static(&[7u8; 12]),
                width: 2,
                height: 2,
                pixel_format: "RGB".to_string(),
                sequence,
                captured_at: Instant::now(),
                captured_wall: Utc::now(),
            });
        }
        session
    }

    fn create_test_collector(registry: Arc<CameraRegistry>) -> BatchCollector {
        BatchCollector::new(
            registry,
            Arc::new(WorkerPool::new(2)),
            Arc::new(SyntheticDetector::new()),
            BatchConfig::default(),
        )
    }

    #[test]
    fn test_one_frame_per_camera_per_cycle() {
        let sessions: Vec<_> = (1u16..=3).map(|c| create_manual_session(c, 1)).collect();

        let batch = BatchCollector::assemble(&sessions, 0, 32);

        assert_eq!(batch.len(), 3);
        let mut channels = batch.channels();
        channels.sort_unstable();
        assert_eq!(channels, vec![1, 2, 3]);
    }

    #[test]
    fn test_fast_camera_contributes_only_latest_frame() {
        // One camera has 5 queued frames, another has 1; the batch still
        // holds exactly one frame per camera, and the fast camera's entry is
        // its most recent frame.
        let fast = create_manual_session(1, 5);
        let slow = create_manual_session(2, 1);
        let sessions = vec![fast.clone(), slow];

        let batch = BatchCollector::assemble(&sessions, 0, 32);

        assert_eq!(batch.len(), 2);
        let fast_item = batch.items.iter().find(|i| i.channel == 1).unwrap();
        assert_eq!(fast_item.frame.sequence, 4);
        assert_eq!(fast.metrics_snapshot().frames_skipped, 4);
    }

    #[test]
    fn test_empty_cycle_is_noop() {
        let sessions: Vec<_> = (1u16..=2).map(|c| create_manual_session(c, 0)).collect();
        let batch = BatchCollector::assemble(&sessions, 0, 32);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_rotation_shifts_batch_cutoff() {
        let sessions: Vec<_> = (1u16..=4).map(|c| create_manual_session(c, 1)).collect();

        // max_size 2 with rotation 0 takes sessions[0..2]
        let first = BatchCollector::assemble(&sessions, 0, 2);
        assert_eq!(first.channels(), vec![1, 2]);

        // refill and rotate: now sessions[2..4] go first
        let sessions: Vec<_> = (1u16..=4).map(|c| create_manual_session(c, 1)).collect();
        let second = BatchCollector::assemble(&sessions, 2, 2);
        assert_eq!(second.channels(), vec![3, 4]);
    }

    #[test]
    fn test_results_dispatched_back_to_sessions() {
        let registry = create_test_registry();
        let collector = create_test_collector(registry.clone());

        registry.start(1).unwrap();
        registry.start(2).unwrap();

        // Wait for both cameras to reach running with ready frames.
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.running_sessions().len() < 2 {
            assert!(Instant::now() < deadline, "cameras never reached running");
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));

        let mut rotation = 0;
        collector.run_cycle(&mut rotation);
        assert_eq!(collector.metrics().batches_submitted(), 1);

        // Dispatch happens at the start of a later cycle.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            collector.dispatch_completed();
            if collector.metrics().batches_completed() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "batch never completed");
            std::thread::sleep(Duration::from_millis(10));
        }

        let processed: u64 = registry
            .sessions()
            .iter()
            .map(|s| s.metrics_snapshot().frames_processed)
            .sum();
        assert_eq!(processed, 2);
        assert!(collector.metrics().avg_inference_ms() >= 0.0);

        registry.stop_all();
    }

    #[test]
    fn test_worker_fault_counted_not_fatal() {
        struct PanickingDetector;
        impl Detector for PanickingDetector {
            fn infer(
                &self,
                _batch: &Batch,
            ) -> Result<Vec<crate::detector::ChannelDetections>, DetectorError> {
                panic!("model crashed");
            }
        }

        let registry = create_test_registry();
        let collector = BatchCollector::new(
            registry.clone(),
            Arc::new(WorkerPool::new(1)),
            Arc::new(PanickingDetector),
            BatchConfig::default(),
        );

        registry.start(1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.running_sessions().is_empty() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(30));

        let mut rotation = 0;
        collector.run_cycle(&mut rotation);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            collector.dispatch_completed();
            if collector.metrics().batches_failed() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "fault never surfaced");
            std::thread::sleep(Duration::from_millis(10));
        }

        // The pool survived; the camera simply missed one result cycle.
        assert_eq!(collector.in_flight(), 0);
        registry.stop_all();
    }
}
