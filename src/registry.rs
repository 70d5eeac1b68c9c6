//! Process-wide map from channel id to capture session.
//!
//! The registry is the sole owner of the start/stop decision: nothing else
//! may create or destroy a session. Map mutations are serialized under one
//! mutex so a concurrent start and stop on the same channel observe a
//! consistent outcome. The join of a stopping decode thread happens outside
//! the map lock, so one channel's teardown never stalls operations on other
//! channels.

use crate::config::CaptureConfig;
use crate::session::{run_decode_loop, CaptureSession, SessionState};
use crate::source::SourceFactory;
use crate::types::ChannelId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{info, warn};

/// Control-plane errors, returned synchronously and side-effect free.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("channel {channel} outside valid range {min}..={max}")]
    InvalidChannel {
        channel: ChannelId,
        min: ChannelId,
        max: ChannelId,
    },

    #[error("channel {0} already active")]
    AlreadyActive(ChannelId),

    #[error("channel {0} not active")]
    NotActive(ChannelId),
}

struct SessionEntry {
    session: Arc<CaptureSession>,
    decode_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of active capture sessions.
pub struct CameraRegistry {
    config: CaptureConfig,
    factory: Arc<dyn SourceFactory>,
    sessions: Mutex<HashMap<ChannelId, Arc<SessionEntry>>>,
}

impl CameraRegistry {
    pub fn new(config: CaptureConfig, factory: Arc<dyn SourceFactory>) -> Self {
        Self {
            config,
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn validate_channel(&self, channel: ChannelId) -> Result<(), RegistryError> {
        if !self.config.channel_in_range(channel) {
            return Err(RegistryError::InvalidChannel {
                channel,
                min: self.config.channel_min,
                max: self.config.channel_max,
            });
        }
        Ok(())
    }

    /// Start capturing on a channel. The session connects asynchronously on
    /// its own decode thread; connection failure surfaces through the
    /// session's `error` state and stats, not through this call.
    pub fn start(&self, channel: ChannelId) -> Result<Arc<CaptureSession>, RegistryError> {
        self.validate_channel(channel)?;

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&channel) {
            return Err(RegistryError::AlreadyActive(channel));
        }

        let session = Arc::new(CaptureSession::new(channel, self.config.queue_capacity));
        let source = self.factory.create(channel);

        let loop_session = session.clone();
        let loop_config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("gridwatch-decode-{channel}"))
            .spawn(move || run_decode_loop(loop_session, source, loop_config))
            .expect("failed to spawn decode thread");

        sessions.insert(
            channel,
            Arc::new(SessionEntry {
                session: session.clone(),
                decode_thread: Mutex::new(Some(handle)),
            }),
        );

        info!(channel, "Camera started");
        Ok(session)
    }

    /// Stop capturing on a channel. Not complete until the decode thread has
    /// exited; caller-visible latency is bounded by the capture I/O timeout.
    pub fn stop(&self, channel: ChannelId) -> Result<(), RegistryError> {
        self.validate_channel(channel)?;

        let entry = {
            let sessions = self.sessions.lock();
            match sessions.get(&channel) {
                Some(entry) => entry.clone(),
                None => return Err(RegistryError::NotActive(channel)),
            }
        };

        // Exactly one caller wins the stopping transition; losers see the
        // channel as no longer active.
        if !entry.session.begin_stop() {
            return Err(RegistryError::NotActive(channel));
        }

        // Join outside the map lock so other channels stay responsive.
        if let Some(handle) = entry.decode_thread.lock().take() {
            if handle.join().is_err() {
                warn!(channel, "Decode thread exited abnormally");
            }
        }
        entry.session.mark_stopped();

        self.sessions.lock().remove(&channel);
        info!(channel, "Camera stopped");
        Ok(())
    }

    /// Stop every active channel; used during shutdown.
    pub fn stop_all(&self) {
        for channel in self.list_active() {
            if let Err(e) = self.stop(channel) {
                // A concurrent stop may have beaten us to it.
                warn!(channel, error = %e, "Stop during shutdown failed");
            }
        }
    }

    /// Active channel ids, ascending.
    pub fn list_active(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.sessions.lock().keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// Session view for one channel, if active.
    pub fn get(&self, channel: ChannelId) -> Option<Arc<CaptureSession>> {
        self.sessions.lock().get(&channel).map(|e| e.session.clone())
    }

    /// All active sessions, for the collector and aggregator sweeps.
    pub fn sessions(&self) -> Vec<Arc<CaptureSession>> {
        self.sessions.lock().values().map(|e| e.session.clone()).collect()
    }

    /// Sessions currently in `running` state.
    pub fn running_sessions(&self) -> Vec<Arc<CaptureSession>> {
        self.sessions()
            .into_iter()
            .filter(|s| s.state() == SessionState::Running)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether any active session is in `error` state.
    pub fn any_errored(&self) -> bool {
        self.sessions()
            .iter()
            .any(|s| s.state() == SessionState::Error)
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.config
    }
}
