//! Control and streaming HTTP server.
//!
//! Control requests complete synchronously against the camera registry and
//! return a definitive success or failure; streaming subscriptions register
//! the caller as a consumer of the aggregator's publish cycle until the
//! client disconnects. Requests for different channels proceed
//! independently, and a stalled SSE subscriber only lags its own broadcast
//! receiver.

use crate::config::ServerConfig;
use crate::registry::{CameraRegistry, RegistryError};
use crate::stats::StatsAggregator;
use crate::types::ChannelId;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CameraRegistry>,
    pub stats: Arc<StatsAggregator>,
}

/// Response to a start command.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub success: bool,
    pub channel: ChannelId,
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to a stop command.
#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub success: bool,
    pub channel: ChannelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Active channel listing.
#[derive(Debug, Serialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelId>,
}

/// Latest frame + detection view for one channel.
#[derive(Debug, Serialize)]
pub struct LatestFrameResponse {
    pub channel: ChannelId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    /// Base64-encoded raw frame bytes
    pub data: String,
    pub detection: Option<crate::types::DetectionResult>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the API router.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/cameras", get(list_cameras))
        .route("/api/v1/cameras/:channel/start", post(start_camera))
        .route("/api/v1/cameras/:channel/stop", post(stop_camera))
        .route("/api/v1/cameras/:channel/stats", get(camera_stats))
        .route("/api/v1/cameras/:channel/latest", get(latest_frame))
        .route("/api/v1/stats", get(system_stats))
        .route("/api/v1/stats/stream", get(stream_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process shuts down.
pub async fn start_api_server(state: AppState, config: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "Control/streaming server listening");

    let app = create_router(state, config);
    axum::serve(listener, app)
        .await
        .context("API server failed")?;

    Ok(())
}

/// Health: degraded when any camera sits in error state.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let degraded = state.registry.any_errored();
    let status = if degraded { "degraded" } else { "healthy" };
    Json(serde_json::json!({
        "status": status,
        "service": "gridwatch"
    }))
}

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChannelListResponse {
        channels: state.registry.list_active(),
    })
}

async fn start_camera(
    State(state): State<AppState>,
    Path(channel): Path<ChannelId>,
) -> impl IntoResponse {
    match state.registry.start(channel) {
        Ok(session) => (
            StatusCode::OK,
            Json(StartResponse {
                success: true,
                channel,
                status: Some(session.state().as_str().to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            registry_error_status(&e),
            Json(StartResponse {
                success: false,
                channel,
                status: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn stop_camera(
    State(state): State<AppState>,
    Path(channel): Path<ChannelId>,
) -> impl IntoResponse {
    // Stop joins the decode thread; keep that off the async runtime.
    let registry = state.registry.clone();
    let result = tokio::task::spawn_blocking(move || registry.stop(channel)).await;

    match result {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(StopResponse {
                success: true,
                channel,
                error: None,
            }),
        ),
        Ok(Err(e)) => (
            registry_error_status(&e),
            Json(StopResponse {
                success: false,
                channel,
                error: Some(e.to_string()),
            }),
        ),
        Err(join_error) => {
            error!(channel, error = %join_error, "Stop task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StopResponse {
                    success: false,
                    channel,
                    error: Some("internal error".to_string()),
                }),
            )
        }
    }
}

async fn camera_stats(
    State(state): State<AppState>,
    Path(channel): Path<ChannelId>,
) -> impl IntoResponse {
    match state.stats.camera_stats(channel) {
        Some(stats) => (StatusCode::OK, Json(stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("channel {channel} not active"),
            }),
        )
            .into_response(),
    }
}

async fn system_stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.stats.latest();
    Json(snapshot.as_ref().clone())
}

/// Latest frame + detection for one channel, the live-view collaborator
/// boundary.
async fn latest_frame(
    State(state): State<AppState>,
    Path(channel): Path<ChannelId>,
) -> impl IntoResponse {
    let Some(session) = state.registry.get(channel) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("channel {channel} not active"),
            }),
        )
            .into_response();
    };

    let Some(frame) = session.latest_frame() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("channel {channel} has no frame yet"),
            }),
        )
            .into_response();
    };

    Json(LatestFrameResponse {
        channel,
        sequence: frame.sequence,
        captured_at: frame.captured_wall,
        width: frame.width,
        height: frame.height,
        pixel_format: frame.pixel_format.clone(),
        data: BASE64.encode(&frame.data),
        detection: session.latest_detection(),
    })
    .into_response()
}

/// SSE push stream: one snapshot per aggregator publish cycle until the
/// client disconnects. Lagged subscribers skip missed snapshots rather than
/// stalling the publisher.
async fn stream_stats(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.stats.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(snapshot) => Event::default()
                .event("stats")
                .json_data(snapshot.as_ref())
                .ok()
                .map(Ok),
            // Receiver lagged behind the publisher; drop the gap.
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn registry_error_status(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::InvalidChannel { .. } => StatusCode::BAD_REQUEST,
        RegistryError::AlreadyActive(_) | RegistryError::NotActive(_) => StatusCode::CONFLICT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorMetrics;
    use crate::config::CaptureConfig;
    use crate::source::{SyntheticSourceConfig, SyntheticSourceFactory};
    use std::time::Duration;

    fn create_test_state() -> AppState {
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
        let registry = Arc::new(CameraRegistry::new(config, factory));
        let stats = Arc::new(StatsAggregator::new(
            registry.clone(),
            Arc::new(CollectorMetrics::default()),
            Duration::from_millis(100),
            8,
        ));
        AppState { registry, stats }
    }

    #[test]
    fn test_registry_error_status_mapping() {
        assert_eq!(
            registry_error_status(&RegistryError::InvalidChannel {
                channel: 99,
                min: 1,
                max: 30
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            registry_error_status(&RegistryError::AlreadyActive(1)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            registry_error_status(&RegistryError::NotActive(1)),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_router_builds() {
        let state = create_test_state();
        let _router = create_router(state, &ServerConfig::default());
    }

    #[tokio::test]
    async fn test_start_handler_conflict_on_double_start() {
        let state = create_test_state();
        state.registry.start(1).unwrap();

        let response = start_camera(State(state.clone()), Path(1)).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let registry = state.registry.clone();
        tokio::task::spawn_blocking(move || registry.stop_all())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_handler_not_active() {
        let state = create_test_state();
        let response = stop_camera(State(state), Path(5)).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_camera_stats_not_found() {
        let state = create_test_state();
        let response = camera_stats(State(state), Path(9)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
