//! The real-time media session the adapter drives
//!
//! Implementations wrap an SFU/WebRTC client (or, for tests and the demo
//! console, the in-memory [`LoopbackSession`](super::loopback::LoopbackSession)).
//! The core treats everything behind this trait as opaque.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::protocol::{Bus, NetId, Participant};

/// Identity presented when joining
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: String,
    pub callsign: String,
}

/// Everything needed to (re)join a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_token: String,
    pub endpoint_url: String,
    pub net_id: NetId,
    pub user: SessionUser,
}

/// Unsolicited signals from the media session while joined
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    ParticipantJoined(Participant),
    ParticipantLeft { user_id: String },
    SpeakingChanged { user_id: String, is_speaking: bool },
    /// Network blip; the adapter owns recovery
    LinkLost { reason: String },
    /// Remote side closed the session
    Closed,
    /// Unrecoverable failure
    Fatal { message: String },
}

/// A successfully joined room
#[derive(Debug)]
pub struct JoinedRoom {
    pub room_name: String,
    pub participants: Vec<Participant>,
    /// Signals for this join only; closed when the room is left or lost
    pub signals: mpsc::UnboundedReceiver<SessionSignal>,
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn join(&self, request: &JoinRequest) -> Result<JoinedRoom, MediaError>;

    async fn leave(&self) -> Result<(), MediaError>;

    /// Enable or disable the local audio publish track
    async fn set_track_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    /// Open a capture stream; `None` selects the system default device
    async fn open_capture(&self, device_id: Option<&str>) -> Result<(), MediaError>;

    /// Release the capture device handle
    async fn close_capture(&self) -> Result<(), MediaError>;

    /// Feed the local track into a bus
    async fn bind_publish(&self, bus: &Bus) -> Result<(), MediaError>;

    /// Stop feeding the local track into a bus
    async fn unbind_publish(&self, bus: &Bus) -> Result<(), MediaError>;

    /// Receive audio from a net
    async fn subscribe(&self, net: &NetId) -> Result<(), MediaError>;

    async fn unsubscribe(&self, net: &NetId) -> Result<(), MediaError>;
}
