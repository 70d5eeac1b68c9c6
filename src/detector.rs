//! Inference boundary.
//!
//! The engine treats inference as an opaque function over a batch of images:
//! implement [`Detector`] to plug in a real accelerator-backed model. The
//! built-in [`SyntheticDetector`] emits deterministic detections from the
//! fixed label set so the data plane runs end to end without a model.

use crate::types::{Batch, BoundingBox, ChannelId, Detection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// The fixed label set detections are drawn from.
pub const LABELS: &[&str] = &["person", "vehicle", "bicycle", "animal"];

/// Errors an inference backend can report for a whole batch.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Detections for one channel's frame within a batch response.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDetections {
    pub channel: ChannelId,
    pub sequence: u64,
    pub captured_wall: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Opaque inference function: consumes a batch of images, returns per-image
/// detections. Called from worker pool threads; may block.
pub trait Detector: Send + Sync {
    fn infer(&self, batch: &Batch) -> Result<Vec<ChannelDetections>, DetectorError>;
}

/// Deterministic stand-in detector.
///
/// Derives zero to two boxes per frame from the frame's channel and sequence
/// so results are stable across runs and visibly differ between frames.
pub struct SyntheticDetector;

impl SyntheticDetector {
    pub fn new() -> Self {
        Self
    }

    fn detections_for(channel: ChannelId, sequence: u64) -> Vec<Detection> {
        let seed = (channel as u64).wrapping_mul(2654435761).wrapping_add(sequence);
        let count = (seed % 3) as usize;

        (0..count)
            .map(|i| {
                let s = seed.wrapping_add(i as u64 * 97);
                let label = LABELS[(s % LABELS.len() as u64) as usize].to_string();
                let confidence = 0.5 + ((s % 50) as f32) / 100.0;
                let x = ((s % 60) as f32) / 100.0;
                let y = ((s / 7 % 60) as f32) / 100.0;
                Detection {
                    label,
                    confidence,
                    bbox: BoundingBox {
                        x,
                        y,
                        width: 0.2,
                        height: 0.3,
                    },
                }
            })
            .collect()
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for SyntheticDetector {
    fn infer(&self, batch: &Batch) -> Result<Vec<ChannelDetections>, DetectorError> {
        Ok(batch
            .items
            .iter()
            .map(|item| ChannelDetections {
                channel: item.channel,
                sequence: item.frame.sequence,
                captured_wall: item.frame.captured_wall,
                detections: Self::detections_for(item.channel, item.frame.sequence),
            })
            .collect())
    }
}
