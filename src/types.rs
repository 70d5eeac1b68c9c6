//! Core data types shared across the engine.
//!
//! Frames are owned exclusively by the queue that holds them until consumed;
//! ownership transfers on dequeue. Detection results are replaced, never
//! accumulated: each channel retains only the most recent result for live
//! display while aggregate counters accumulate separately in session metrics.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

/// Stable external identifier for one camera stream.
pub type ChannelId = u16;

/// One decoded image plus its capture timestamps and channel identifier.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel this frame was captured on
    pub channel: ChannelId,

    /// Decoded pixel data
    pub data: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel format (e.g., "RGB")
    pub pixel_format: String,

    /// Per-session sequence number, monotonic in capture order
    pub sequence: u64,

    /// Monotonic capture timestamp, used for lag measurement
    pub captured_at: Instant,

    /// Wall-clock capture timestamp, used in API payloads
    pub captured_wall: DateTime<Utc>,
}

/// An axis-aligned bounding region, normalized to [0,1] image coordinates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single classified region within one frame.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Classification label from the fixed label set
    pub label: String,

    /// Confidence in [0, 1]
    pub confidence: f32,

    /// Region the label applies to
    pub bbox: BoundingBox,
}

/// The detections computed from one frame of one channel.
///
/// Superseded by each new batch result for the channel.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub channel: ChannelId,

    /// Sequence number of the frame the result was computed from
    pub sequence: u64,

    /// Wall-clock capture time of the source frame
    pub captured_wall: DateTime<Utc>,

    /// Time spent in the inference call for the whole batch, in milliseconds
    pub inference_ms: f64,

    pub detections: Vec<Detection>,
}

/// One entry of an inference batch: a frame tagged with its channel.
#[derive(Debug)]
pub struct BatchItem {
    pub channel: ChannelId,
    pub frame: Frame,
}

/// An ephemeral cross-camera group of frames submitted together for
/// inference. Bounded by a maximum size and a collection window; exists only
/// for the duration of one dispatch and is never persisted.
#[derive(Debug)]
pub struct Batch {
    /// Correlation id for logging
    pub id: Uuid,

    /// Ordered (channel, frame) pairs, at most one per channel
    pub items: Vec<BatchItem>,

    /// When the collector assembled this batch
    pub assembled_at: Instant,
}

impl Batch {
    pub fn new(items: Vec<BatchItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            items,
            assembled_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Channels represented in this batch, in batch order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.items.iter().map(|i| i.channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn create_test_frame(channel: ChannelId, sequence: u64) -> Frame {
        let (width, height) = (32u32, 24u32);
        Frame {
            channel,
            data: Bytes::from(vec![128u8; (width * height * 3) as usize]),
            width,
            height,
            pixel_format: "RGB".to_string(),
            sequence,
            captured_at: Instant::now(),
            captured_wall: Utc::now(),
        }
    }

    #[test]
    fn test_batch_channels_preserve_order() {
        let batch = Batch::new(vec![
            BatchItem {
                channel: 3,
                frame: create_test_frame(3, 0),
            },
            BatchItem {
                channel: 1,
                frame: create_test_frame(1, 0),
            },
        ]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.channels(), vec![3, 1]);
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::new(Vec::new());
        assert!(batch.is_empty());
        assert!(batch.channels().is_empty());
    }
}
