//! Per-channel capture session: lifecycle state machine, decode loop, and
//! single-writer metrics.
//!
//! Lifecycle: `stopped → connecting → running → stopping → stopped`, with
//! `running → error` on unrecoverable decode failure and bounded
//! backoff-driven reconnect out of `error`. State transitions are serialized:
//! the registry claims `stopping` with a compare-and-swap, and the decode
//! thread only advances state it still owns.
//!
//! Field discipline on the hot path: decode metrics are written only by the
//! owning decode thread, detection fields only by the result-dispatch path.
//! The two sets are disjoint, so neither path takes a lock the other holds.

use crate::config::CaptureConfig;
use crate::queue::{BoundedQueue, OverflowPolicy, PushOutcome};
use crate::source::{FrameSource, SourceError};
use crate::types::{ChannelId, DetectionResult, Frame};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Connecting,
    Running,
    Stopping,
    Error,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Running,
            3 => SessionState::Stopping,
            4 => SessionState::Error,
            _ => SessionState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Connecting => "connecting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        }
    }
}

/// Smoothing factor for the rolling decode-time and FPS averages.
const EWMA_ALPHA: f64 = 0.2;

/// Decode-side and result-side counters for one session.
///
/// Counters are monotonic and independently readable; there are no
/// cross-field invariants, so the aggregator reads them without locking.
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    frames_total: AtomicU64,
    frames_processed: AtomicU64,
    frames_skipped: AtomicU64,
    decode_ewma_us: AtomicU64,
    fps_ewma: AtomicU64,
    lag_ms: AtomicU64,
    reconnects: AtomicU32,
}

impl CaptureMetrics {
    fn record_decode(&self, decode_time: Duration, interarrival: Option<Duration>) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);

        let us = decode_time.as_micros() as f64;
        update_ewma(&self.decode_ewma_us, us);

        if let Some(gap) = interarrival {
            let secs = gap.as_secs_f64();
            if secs > 0.0 {
                update_ewma(&self.fps_ewma, 1.0 / secs);
            }
        }
    }

    fn record_skipped(&self, n: u64) {
        if n > 0 {
            self.frames_skipped.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn record_result(&self, lag: Duration) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.lag_ms.store(lag.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

fn update_ewma(cell: &AtomicU64, sample: f64) {
    let prev = f64::from_bits(cell.load(Ordering::Relaxed));
    let next = if prev == 0.0 {
        sample
    } else {
        prev + EWMA_ALPHA * (sample - prev)
    };
    cell.store(next.to_bits(), Ordering::Relaxed);
}

/// Point-in-time copy of one session's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CameraMetricsSnapshot {
    pub frames_total: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub avg_decode_ms: f64,
    pub fps: f64,
    pub lag_ms: u64,
    pub reconnects: u32,
    pub queue_depth: usize,
}

/// The live state owned by one channel's decode thread.
pub struct CaptureSession {
    channel: ChannelId,
    state: AtomicU8,
    metrics: CaptureMetrics,
    queue: BoundedQueue<Frame>,
    latest_frame: RwLock<Option<Frame>>,
    latest_detection: RwLock<Option<DetectionResult>>,
}

impl CaptureSession {
    /// Create a session in `connecting` state with an evict-oldest frame
    /// queue: for a live system a stale frame is worse than a dropped one.
    pub fn new(channel: ChannelId, queue_capacity: usize) -> Self {
        Self {
            channel,
            state: AtomicU8::new(SessionState::Connecting as u8),
            metrics: CaptureMetrics::default(),
            queue: BoundedQueue::new(queue_capacity, OverflowPolicy::EvictOldest),
            latest_frame: RwLock::new(None),
            latest_detection: RwLock::new(None),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == SessionState::Stopping
    }

    /// Claim the stopping transition. Returns false if the session is
    /// already stopping or stopped, so concurrent stops race
    /// deterministically: exactly one caller wins.
    pub(crate) fn begin_stop(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            let state = SessionState::from_u8(current);
            if matches!(state, SessionState::Stopping | SessionState::Stopped) {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    SessionState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(SessionState::Stopped as u8, Ordering::SeqCst);
    }

    /// Advance state, but never clobber a stop request.
    fn transition_if_not_stopping(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Admit one decoded frame: update the live-view copy, then queue it for
    /// collection. Called only by the owning decode thread.
    pub(crate) fn ingest_frame(&self, frame: Frame) -> PushOutcome {
        *self.latest_frame.write() = Some(frame.clone());
        self.queue.push(frame)
    }

    /// Take the most recent ready frame, counting frames superseded within
    /// the collection window as skipped. Non-blocking; called by the batch
    /// collector at most once per cycle.
    pub fn take_latest_ready_frame(&self) -> Option<Frame> {
        let mut drained = self.queue.drain();
        let latest = drained.pop()?;
        self.metrics.record_skipped(drained.len() as u64);
        Some(latest)
    }

    /// Latest frame pushed by the decode thread, for on-demand live view.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest_frame.read().clone()
    }

    /// Most recent detection result for this channel, if any.
    pub fn latest_detection(&self) -> Option<DetectionResult> {
        self.latest_detection.read().clone()
    }

    /// Write one batch result back into the session. Called only by the
    /// result-dispatch path.
    pub fn record_detection(&self, result: DetectionResult, lag: Duration) {
        self.metrics.record_result(lag);
        *self.latest_detection.write() = Some(result);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn metrics_snapshot(&self) -> CameraMetricsSnapshot {
        CameraMetricsSnapshot {
            frames_total: self.metrics.frames_total.load(Ordering::Relaxed),
            frames_processed: self.metrics.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.metrics.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.queue.total_dropped(),
            avg_decode_ms: f64::from_bits(self.metrics.decode_ewma_us.load(Ordering::Relaxed))
                / 1000.0,
            fps: f64::from_bits(self.metrics.fps_ewma.load(Ordering::Relaxed)),
            lag_ms: self.metrics.lag_ms.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }
}

/// Run one channel's decode loop until stop, unrecoverable error, or source
/// teardown. Owns the source exclusively; this is the only writer of decode
/// metrics and queue pushes for the session.
pub fn run_decode_loop(
    session: Arc<CaptureSession>,
    mut source: Box<dyn FrameSource>,
    config: CaptureConfig,
) {
    let channel = session.channel();
    info!(channel, "Decode loop starting");

    if !connect(&session, source.as_mut(), &config, SessionState::Connecting) {
        source.close();
        info!(channel, state = session.state().as_str(), "Decode loop exited before connect");
        return;
    }

    let io_timeout = config.io_timeout();
    let mut sequence: u64 = 0;
    let mut consecutive_failures: u32 = 0;
    let mut last_frame_at: Option<Instant> = None;

    loop {
        if session.is_stopping() {
            break;
        }

        let read_started = Instant::now();
        match source.read_frame(io_timeout) {
            Ok(pixels) => {
                consecutive_failures = 0;
                let now = Instant::now();

                // First frame after connecting (or reconnecting) flips the
                // session to running, unless a stop already claimed it.
                session.transition_if_not_stopping(SessionState::Connecting, SessionState::Running);

                let frame = Frame {
                    channel,
                    data: pixels.data,
                    width: pixels.width,
                    height: pixels.height,
                    pixel_format: pixels.pixel_format,
                    sequence,
                    captured_at: now,
                    captured_wall: Utc::now(),
                };
                sequence += 1;

                let interarrival = last_frame_at.map(|t| now.duration_since(t));
                last_frame_at = Some(now);
                session
                    .metrics
                    .record_decode(now.duration_since(read_started), interarrival);

                if session.ingest_frame(frame) == PushOutcome::Evicted {
                    counter!("gridwatch_frames_evicted_total").increment(1);
                }
                counter!("gridwatch_frames_decoded_total").increment(1);
            }
            Err(SourceError::TimedOut) => {
                // No frame within budget; loop back to re-check the stop flag.
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    channel,
                    failures = consecutive_failures,
                    error = %e,
                    "Frame read failed"
                );

                if consecutive_failures >= config.max_consecutive_failures {
                    // CAS into error from whichever state the decode thread
                    // still owns; if neither succeeds a stop claimed the
                    // session and the loop must exit, not reconnect.
                    let entered_error = session
                        .transition_if_not_stopping(SessionState::Running, SessionState::Error)
                        || session
                            .transition_if_not_stopping(SessionState::Connecting, SessionState::Error);
                    if !entered_error {
                        break;
                    }
                    error!(channel, "Stream unusable, entering error state");
                    counter!("gridwatch_stream_errors_total").increment(1);

                    session.metrics.record_reconnect();
                    source.close();
                    if !connect(&session, source.as_mut(), &config, SessionState::Error) {
                        break;
                    }
                    consecutive_failures = 0;
                    last_frame_at = None;
                }
            }
        }
    }

    source.close();
    info!(
        channel,
        state = session.state().as_str(),
        frames = session.metrics.frames_total.load(Ordering::Relaxed),
        "Decode loop exited"
    );
}

/// Open the source with bounded attempts and exponential backoff, observing
/// stop requests between attempts. On success moves the session from
/// `from_state` to `connecting`; returns false if stopped or attempts were
/// exhausted (session left in `error`).
fn connect(
    session: &CaptureSession,
    source: &mut dyn FrameSource,
    config: &CaptureConfig,
    from_state: SessionState,
) -> bool {
    let channel = session.channel();
    let mut backoff = ExponentialBackoff {
        initial_interval: config.reconnect_base_delay(),
        max_interval: config.reconnect_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };

    for attempt in 1..=config.connect_attempts {
        if session.is_stopping() {
            return false;
        }

        match source.open() {
            Ok(()) => {
                if from_state == SessionState::Error {
                    session.transition_if_not_stopping(SessionState::Error, SessionState::Connecting);
                    info!(channel, attempt, "Stream reconnected");
                } else {
                    debug!(channel, attempt, "Stream opened");
                }
                return !session.is_stopping();
            }
            Err(e) => {
                warn!(channel, attempt, error = %e, "Stream open failed");
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| config.reconnect_max_delay());
                if sleep_observing_stop(session, delay, config.io_timeout()) {
                    return false;
                }
            }
        }
    }

    // Only enter error if a stop hasn't already claimed the session.
    if session.transition_if_not_stopping(from_state, SessionState::Error) {
        error!(
            channel,
            attempts = config.connect_attempts,
            "Stream unavailable after bounded retries"
        );
    }
    false
}

/// Sleep `total`, checking the stop flag every `interval` so stop latency
/// stays bounded by the I/O timeout. Returns true if a stop was observed.
fn sleep_observing_stop(session: &CaptureSession, total: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if session.is_stopping() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(interval));
    }
}
