//! Frame source abstraction for camera streams.
//!
//! Decoding real camera transports (RTSP, V4L2, ...) lives behind the
//! [`FrameSource`] trait so the engine's scheduling and data plane can be run
//! and tested without hardware. The built-in [`SyntheticSource`] produces
//! paced RGB test-pattern frames and is the default factory wired in `main`.
//!
//! Reads take a bounded timeout: a source must return [`SourceError::TimedOut`]
//! rather than block indefinitely, so the decode loop can observe a stop
//! request within one timeout interval.

use crate::types::ChannelId;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors a frame source can report.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no frame available within the read timeout")]
    TimedOut,

    #[error("stream source unreachable: {0}")]
    Unavailable(String),

    #[error("stream disconnected: {0}")]
    Disconnected(String),

    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Raw pixels read from a source, before the session stamps them into a
/// [`crate::types::Frame`].
#[derive(Debug, Clone)]
pub struct SourcePixels {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
}

/// One open-able, readable camera stream. Implementations are driven from a
/// single decode thread and need not be `Sync`.
pub trait FrameSource: Send {
    /// Open the stream. Called once before the first read and again on
    /// reconnect attempts.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Read the next decoded frame, waiting at most `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<SourcePixels, SourceError>;

    /// Release the stream. Must be safe to call on an unopened source.
    fn close(&mut self);
}

/// Creates a [`FrameSource`] for a channel. The registry owns one factory and
/// calls it on every successful `start`.
pub trait SourceFactory: Send + Sync {
    fn create(&self, channel: ChannelId) -> Box<dyn FrameSource>;
}

/// Configuration for the synthetic source.
#[derive(Debug, Clone)]
pub struct SyntheticSourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 30.0,
        }
    }
}

/// Deterministic test-pattern source pacing frames at a configured rate.
pub struct SyntheticSource {
    channel: ChannelId,
    config: SyntheticSourceConfig,
    opened: bool,
    sequence: u64,
    next_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(channel: ChannelId, config: SyntheticSourceConfig) -> Self {
        Self {
            channel,
            config,
            opened: false,
            sequence: 0,
            next_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps.max(0.001))
    }

    /// Render a gradient pattern that varies per channel and per frame, so
    /// consumers can tell frames apart.
    fn render(&self) -> Bytes {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let mut data = vec![0u8; w * h * 3];
        let seed = (self.channel as u64).wrapping_mul(31).wrapping_add(self.sequence) as u8;

        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) * 3;
                data[idx] = (x * 255 / w.max(1)) as u8;
                data[idx + 1] = (y * 255 / h.max(1)) as u8;
                data[idx + 2] = seed;
            }
        }
        Bytes::from(data)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<(), SourceError> {
        self.opened = true;
        self.next_frame_at = Some(Instant::now());
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<SourcePixels, SourceError> {
        if !self.opened {
            return Err(SourceError::Unavailable("source not opened".to_string()));
        }

        let due = self
            .next_frame_at
            .unwrap_or_else(Instant::now);
        let now = Instant::now();

        if due > now {
            let wait = due - now;
            if wait > timeout {
                // Frame not due within this read's budget; let the caller
                // re-check its stop flag.
                std::thread::sleep(timeout);
                return Err(SourceError::TimedOut);
            }
            std::thread::sleep(wait);
        }

        let pixels = SourcePixels {
            data: self.render(),
            width: self.config.width,
            height: self.config.height,
            pixel_format: "RGB".to_string(),
        };

        self.sequence += 1;
        self.next_frame_at = Some(due + self.frame_interval());

        Ok(pixels)
    }

    fn close(&mut self) {
        self.opened = false;
        self.next_frame_at = None;
    }
}

/// Factory producing a [`SyntheticSource`] per channel.
pub struct SyntheticSourceFactory {
    config: SyntheticSourceConfig,
}

impl SyntheticSourceFactory {
    pub fn new(config: SyntheticSourceConfig) -> Self {
        Self { config }
    }
}

impl SourceFactory for SyntheticSourceFactory {
    fn create(&self, channel: ChannelId) -> Box<dyn FrameSource> {
        Box::new(SyntheticSource::new(channel, self.config.clone()))
    }
}
