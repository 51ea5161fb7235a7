//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::device::{list_devices, parse_device_id, DeviceKind};
use crate::control::{OverrideOutcome, PttOutcome};
use crate::error::TransportError;
use crate::nets::{RoutingOutcome, SubmixRequest};
use crate::protocol::{
    AudioDeviceInfo, ConnectionState, NetId, Participant, PriorityLevel, VoiceNet,
    WhisperSession, WhisperTarget,
};
use crate::session::{ConnectParams, MicOutcome, SessionStatus};
use crate::transport::MicState;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }

    /// A refusal that still carries the structured reason
    pub fn rejected(data: T, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::ok(data)))
}

fn failed<T>(e: TransportError) -> ApiResult<T> {
    let status = match e {
        TransportError::NotConnected(_) | TransportError::InvalidTransition(_) => {
            StatusCode::CONFLICT
        }
        TransportError::ConnectionFailed(_) | TransportError::ConnectionLost(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!("API request failed: {}", e);
    (status, Json(ApiResponse::error(e.to_string())))
}

/// System status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    #[serde(flatten)]
    pub session: SessionStatus,
    pub uptime_seconds: u64,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        session: state.session.status().await,
        uptime_seconds: state.started.elapsed().as_secs(),
    };
    Json(ApiResponse::ok(status))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    Json(ApiResponse::ok(list_devices()))
}

/// Get the net roster
pub async fn get_nets(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<VoiceNet>>> {
    Json(ApiResponse::ok(state.session.nets()))
}

pub async fn get_participants(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<Participant>>> {
    Json(ApiResponse::ok(state.session.participants()))
}

/// Join a net
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ConnectParams>,
) -> ApiResult<ConnectionState> {
    match state.session.connect(params).await {
        Ok(()) => ok(state.session.state()),
        Err(e) => failed(e),
    }
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<ConnectionState> {
    match state.session.disconnect().await {
        Ok(()) => ok(state.session.state()),
        Err(e) => failed(e),
    }
}

/// Select TX and monitored nets
pub async fn configure_submix(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmixRequest>,
) -> ApiResult<RoutingOutcome> {
    match state.session.configure_submix(request).await {
        Ok(outcome @ RoutingOutcome::Rejected { .. }) => (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::rejected(outcome, "routing rejected")),
        ),
        Ok(outcome) => ok(outcome),
        Err(e) => failed(e),
    }
}

pub async fn ptt_press(
    State(state): State<Arc<AppState>>,
    Path(net): Path<String>,
) -> ApiResult<PttOutcome> {
    match state.session.press(&NetId::from(net)).await {
        Ok(outcome) => ok(outcome),
        Err(e) => failed(e),
    }
}

pub async fn ptt_release(
    State(state): State<Arc<AppState>>,
    Path(net): Path<String>,
) -> ApiResult<PttOutcome> {
    match state.session.release(&NetId::from(net)).await {
        Ok(outcome) => ok(outcome),
        Err(e) => failed(e),
    }
}

/// Open-mic toggle
#[derive(Debug, Deserialize)]
pub struct MicRequest {
    pub enabled: bool,
}

pub async fn set_mic(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MicRequest>,
) -> ApiResult<MicOutcome> {
    match state.session.set_mic_enabled(req.enabled).await {
        Ok(outcome @ MicOutcome::Refused { .. }) => (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::rejected(outcome, "cannot transmit")),
        ),
        Ok(outcome) => ok(outcome),
        Err(e) => failed(e),
    }
}

/// Switch the capture device
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub device_id: String,
}

pub async fn set_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<MicState> {
    if parse_device_id(&req.device_id).0 != DeviceKind::Input {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!(
                "{} is not a capture device",
                req.device_id
            ))),
        );
    }
    match state.session.set_audio_device(&req.device_id).await {
        Ok(()) => ok(state.session.mic_state()),
        Err(e) => failed(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct WhisperRequest {
    pub target: WhisperTarget,
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn start_whisper(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WhisperRequest>,
) -> ApiResult<WhisperSession> {
    let label = req.label.unwrap_or_else(|| req.target.to_string());
    match state.session.start_whisper(req.target, label).await {
        Ok(session) => ok(session),
        Err(e) => failed(e),
    }
}

pub async fn stop_whisper(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Option<WhisperSession>> {
    match state.session.stop_whisper().await {
        Ok(ended) => ok(ended),
        Err(e) => failed(e),
    }
}

/// Issue a priority override on the TX net
#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub message: String,
    #[serde(default)]
    pub priority: PriorityLevel,
}

pub async fn trigger_override(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<OverrideOutcome> {
    match state
        .session
        .trigger_priority_override(req.message, req.priority)
        .await
    {
        outcome @ OverrideOutcome::Rejected { .. } => (
            StatusCode::FORBIDDEN,
            Json(ApiResponse::rejected(outcome, "override rejected")),
        ),
        outcome => ok(outcome),
    }
}
