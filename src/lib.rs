//! Gridwatch: multi-camera real-time detection serving engine.
//!
//! Ingests many independent live camera streams, decodes frames under a
//! latency budget, batches frames across streams for throughput-efficient
//! inference, and exposes per-stream and system-wide state to control and
//! monitoring clients.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> CaptureSession (decode thread, per camera)
//!                      | bounded evict-oldest queue
//!                      v
//!               BatchCollector (fixed cadence, one frame per camera)
//!                      | inference batch
//!                      v
//!                 WorkerPool -> Detector (opaque inference)
//!                      | (channel, result) pairs
//!                      v
//!               result dispatch -> session detection state
//!                      |
//!                      v
//!               StatsAggregator -> HTTP server (poll + SSE push)
//! ```
//!
//! The [`registry::CameraRegistry`] is the single point of synchronized
//! mutation for camera lifecycle; no other component creates or destroys a
//! capture session. No single camera's failure is fatal to the process.

pub mod collector;
pub mod config;
pub mod detector;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod source;
pub mod stats;
pub mod types;
pub mod worker_pool;
