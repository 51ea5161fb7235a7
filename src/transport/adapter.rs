//! Transport adapter
//!
//! Wraps one [`MediaSession`] and owns the connection state machine, the
//! participant list and the local mic state. Every mutating call is
//! serialized through a FIFO-fair async mutex, so calls against the media
//! session are applied in the order they were made.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::events::{EventBus, Subscription};
use super::media::{JoinRequest, JoinedRoom, MediaSession, SessionSignal};
use crate::connection::{ConnectionInput, ConnectionMachine, InvalidTransition, ReconnectPolicy};
use crate::error::{MediaError, TransportError};
use crate::protocol::{Bus, ConnectionState, ErrorCode, EventKind, NetId, Participant, TransportEvent};

/// Local microphone / publish track state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicState {
    pub enabled: bool,
    pub ptt_active: bool,
    /// Selected capture device, `None` for the system default
    pub device_id: Option<String>,
    /// Last device switch failure, cleared by the next successful switch
    pub device_error: Option<String>,
    /// A capture stream is open on the joined session
    pub capture_ready: bool,
}

/// Capture stream left open after a failed device switch
enum CaptureLeft {
    /// The previous device; `live` if its track is publishing again
    Previous { live: bool },
    /// The new device stayed open with the track off
    New,
    Nothing,
}

struct AdapterInner {
    media: Arc<dyn MediaSession>,
    policy: ReconnectPolicy,
    machine: Mutex<ConnectionMachine>,
    participants: RwLock<Vec<Participant>>,
    mic: RwLock<MicState>,
    request: Mutex<Option<JoinRequest>>,
    /// Bumped by every connect, disconnect and terminal failure; background
    /// tasks holding an older value stop acting
    epoch: AtomicU64,
    ops: tokio::sync::Mutex<()>,
    events: EventBus,
}

/// Cheaply cloneable handle to one transport session
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<AdapterInner>,
}

impl TransportAdapter {
    pub fn new(media: Arc<dyn MediaSession>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                media,
                policy,
                machine: Mutex::new(ConnectionMachine::new()),
                participants: RwLock::new(Vec::new()),
                mic: RwLock::new(MicState::default()),
                request: Mutex::new(None),
                epoch: AtomicU64::new(0),
                ops: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.participants.read().clone()
    }

    pub fn mic_state(&self) -> MicState {
        self.inner.mic.read().clone()
    }

    /// Net the current session was joined with
    pub fn joined_net(&self) -> Option<NetId> {
        self.inner.request.lock().as_ref().map(|r| r.net_id.clone())
    }

    /// Join a room. An already active session is torn down first.
    pub async fn connect(&self, request: JoinRequest) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;

        let state = self.state();
        if state.is_active() {
            tracing::warn!("connect() while {}; tearing down the previous session first", state);
            self.teardown_locked().await;
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.transition(ConnectionInput::ConnectRequested)?;
        tracing::info!("Joining net {} at {}", request.net_id, request.endpoint_url);

        let room = match self.join_and_capture(&request).await {
            Ok(room) => room,
            Err(e) => {
                let message = e.to_string();
                let _ = self.transition(ConnectionInput::JoinFailed);
                tracing::error!("Join failed: {}", message);
                self.emit_error(ErrorCode::ConnectionFailed, &message);
                return Err(TransportError::ConnectionFailed(message));
            }
        };

        *self.inner.participants.write() = room.participants.clone();
        *self.inner.request.lock() = Some(request.clone());
        {
            let mut mic = self.inner.mic.write();
            mic.enabled = false;
            mic.ptt_active = false;
            mic.capture_ready = true;
        }
        self.transition(ConnectionInput::JoinSucceeded)?;
        self.spawn_pump(epoch, room.signals);

        tracing::info!(
            "Connected to {} with {} participant(s)",
            room.room_name,
            room.participants.len()
        );
        self.emit(TransportEvent::Connected {
            net_id: request.net_id,
            room_name: room.room_name,
            participants: room.participants,
        });
        Ok(())
    }

    /// Leave the room. Calling this while idle does nothing.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;

        if self.state() == ConnectionState::Idle {
            tracing::debug!("disconnect() while idle; nothing to do");
            return Ok(());
        }

        self.teardown_locked().await;
        Ok(())
    }

    /// Enable or disable the local publish track without leaving the room
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;
        self.ensure_connected()?;

        match self.inner.media.set_track_enabled(enabled).await {
            Ok(()) => {
                {
                    let mut mic = self.inner.mic.write();
                    mic.enabled = enabled;
                    if !enabled {
                        mic.ptt_active = false;
                    }
                }
                tracing::info!("Microphone {}", if enabled { "enabled" } else { "disabled" });
                self.emit(TransportEvent::MicEnabled { enabled });
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Mic control failed: {}", message);
                self.emit_error(ErrorCode::MicControlFailed, &message);
                Err(TransportError::MicControl(message))
            }
        }
    }

    /// Transient press/hold variant of [`TransportAdapter::set_mic_enabled`].
    ///
    /// A request matching the current PTT state makes no media call. On
    /// failure the previous track state is re-asserted.
    pub async fn set_ptt_active(&self, active: bool) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;

        let (prior_active, prior_enabled) = {
            let mic = self.inner.mic.read();
            (mic.ptt_active, mic.enabled)
        };
        if prior_active == active {
            return Ok(());
        }
        self.ensure_connected()?;

        match self.inner.media.set_track_enabled(active).await {
            Ok(()) => {
                {
                    let mut mic = self.inner.mic.write();
                    mic.ptt_active = active;
                    mic.enabled = active;
                }
                tracing::debug!("PTT {}", if active { "active" } else { "released" });
                self.emit(TransportEvent::PttActive { active });
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(restore) = self.inner.media.set_track_enabled(prior_enabled).await {
                    tracing::error!(
                        "Failed to re-assert mic state {} after PTT failure: {}",
                        prior_enabled,
                        restore
                    );
                }
                tracing::warn!("PTT control failed: {}", message);
                self.emit_error(ErrorCode::PttControlFailed, &message);
                Err(TransportError::PttControl(message))
            }
        }
    }

    /// Switch the capture device.
    ///
    /// The old capture stream is released before the new one is opened. If
    /// the new device cannot be opened or cannot publish, the previous one is
    /// reopened. While not connected only the preference is recorded.
    pub async fn set_audio_device(&self, device_id: &str) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;

        if !self.is_connected() {
            {
                let mut mic = self.inner.mic.write();
                mic.device_id = Some(device_id.to_string());
                mic.device_error = None;
            }
            self.emit(TransportEvent::DeviceChanged {
                device_id: device_id.to_string(),
            });
            return Ok(());
        }

        let (was_enabled, previous) = {
            let mic = self.inner.mic.read();
            (mic.enabled, mic.device_id.clone())
        };
        let media = &self.inner.media;

        // On failure, also report what is left running
        let result = async {
            if was_enabled {
                media
                    .set_track_enabled(false)
                    .await
                    .map_err(|e| (e, CaptureLeft::Previous { live: true }))?;
            }
            media
                .close_capture()
                .await
                .map_err(|e| (e, CaptureLeft::Previous { live: false }))?;

            let switched = match media.open_capture(Some(device_id)).await {
                Ok(()) if was_enabled => match media.set_track_enabled(true).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        tracing::warn!("Cannot publish from {}; restoring previous device", device_id);
                        if let Err(close) = media.close_capture().await {
                            tracing::error!("Failed to close {}: {}", device_id, close);
                            return Err((e, CaptureLeft::New));
                        }
                        Err(e)
                    }
                },
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!("Cannot open {}; restoring previous device", device_id);
                    Err(e)
                }
            };

            match switched {
                Ok(()) => Ok::<(), (MediaError, CaptureLeft)>(()),
                Err(e) => Err((e, self.reopen_capture(previous.as_deref(), was_enabled).await)),
            }
        }
        .await;

        match result {
            Ok(()) => {
                {
                    let mut mic = self.inner.mic.write();
                    mic.device_id = Some(device_id.to_string());
                    mic.device_error = None;
                    mic.capture_ready = true;
                }
                tracing::info!("Capture device switched to {}", device_id);
                self.emit(TransportEvent::DeviceChanged {
                    device_id: device_id.to_string(),
                });
                Ok(())
            }
            Err((e, left)) => {
                let message = e.to_string();
                {
                    let mut mic = self.inner.mic.write();
                    mic.device_error = Some(message.clone());
                    match left {
                        CaptureLeft::Previous { live } => {
                            mic.capture_ready = true;
                            if !live {
                                mic.enabled = false;
                                mic.ptt_active = false;
                            }
                        }
                        CaptureLeft::New => {
                            mic.device_id = Some(device_id.to_string());
                            mic.capture_ready = true;
                            mic.enabled = false;
                            mic.ptt_active = false;
                        }
                        CaptureLeft::Nothing => {
                            mic.capture_ready = false;
                            mic.enabled = false;
                            mic.ptt_active = false;
                        }
                    }
                }
                self.emit_error(ErrorCode::DeviceChangeFailed, &message);
                Err(TransportError::DeviceChange(message))
            }
        }
    }

    /// Reopen `previous` after a failed switch, republishing if the track
    /// was live before
    async fn reopen_capture(&self, previous: Option<&str>, was_enabled: bool) -> CaptureLeft {
        let media = &self.inner.media;
        if let Err(e) = media.open_capture(previous).await {
            tracing::error!("Failed to reopen previous device: {}", e);
            return CaptureLeft::Nothing;
        }
        if !was_enabled {
            return CaptureLeft::Previous { live: false };
        }
        match media.set_track_enabled(true).await {
            Ok(()) => CaptureLeft::Previous { live: true },
            Err(e) => {
                tracing::error!("Failed to republish previous device: {}", e);
                CaptureLeft::Previous { live: false }
            }
        }
    }

    /// Feed the local track into `bus`
    pub async fn bind_publish(&self, bus: &Bus) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;
        self.ensure_connected()?;
        self.inner
            .media
            .bind_publish(bus)
            .await
            .map_err(|e| TransportError::Routing(e.to_string()))
    }

    pub async fn unbind_publish(&self, bus: &Bus) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;
        self.ensure_connected()?;
        self.inner
            .media
            .unbind_publish(bus)
            .await
            .map_err(|e| TransportError::Routing(e.to_string()))
    }

    pub async fn subscribe(&self, net: &NetId) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;
        self.ensure_connected()?;
        self.inner
            .media
            .subscribe(net)
            .await
            .map_err(|e| TransportError::Routing(e.to_string()))
    }

    pub async fn unsubscribe(&self, net: &NetId) -> Result<(), TransportError> {
        let _op = self.inner.ops.lock().await;
        self.ensure_connected()?;
        self.inner
            .media
            .unsubscribe(net)
            .await
            .map_err(|e| TransportError::Routing(e.to_string()))
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn transition(&self, input: ConnectionInput) -> Result<ConnectionState, InvalidTransition> {
        self.inner.machine.lock().apply(input)
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(TransportError::NotConnected(state)),
        }
    }

    fn emit(&self, event: TransportEvent) {
        self.inner.events.emit(&event);
    }

    fn emit_error(&self, code: ErrorCode, message: &str) {
        self.emit(TransportEvent::Error {
            message: message.to_string(),
            code,
        });
    }

    fn reset_session_state(&self) {
        self.inner.participants.write().clear();
        *self.inner.request.lock() = None;
        let mut mic = self.inner.mic.write();
        mic.enabled = false;
        mic.ptt_active = false;
        mic.capture_ready = false;
    }

    async fn join_and_capture(&self, request: &JoinRequest) -> Result<JoinedRoom, MediaError> {
        let room = self.inner.media.join(request).await?;
        let device = self.inner.mic.read().device_id.clone();
        if let Err(e) = self.inner.media.open_capture(device.as_deref()).await {
            let _ = self.inner.media.leave().await;
            return Err(e);
        }
        Ok(room)
    }

    /// Caller must hold the ops lock
    async fn teardown_locked(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let media = &self.inner.media;

        let was_enabled = self.inner.mic.read().enabled;
        if was_enabled {
            if let Err(e) = media.set_track_enabled(false).await {
                tracing::warn!("Failed to disable publish track on disconnect: {}", e);
            }
        }
        if let Err(e) = media.close_capture().await {
            tracing::debug!("close_capture on disconnect: {}", e);
        }
        if let Err(e) = media.leave().await {
            tracing::debug!("leave on disconnect: {}", e);
        }

        self.reset_session_state();
        if let Err(e) = self.transition(ConnectionInput::Disconnected) {
            tracing::warn!("{}", e);
        }
        tracing::info!("Disconnected");
        self.emit(TransportEvent::Disconnected);
    }

    fn spawn_pump(&self, epoch: u64, mut signals: mpsc::UnboundedReceiver<SessionSignal>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let adapter = TransportAdapter { inner };
                if adapter.epoch() != epoch {
                    break;
                }
                if !adapter.handle_signal(epoch, signal).await {
                    break;
                }
            }
        });
    }

    /// Returns false once this join's signal stream is finished
    async fn handle_signal(&self, epoch: u64, signal: SessionSignal) -> bool {
        match signal {
            SessionSignal::ParticipantJoined(participant) => {
                {
                    let mut list = self.inner.participants.write();
                    list.retain(|p| p.user_id != participant.user_id);
                    list.push(participant.clone());
                }
                self.emit(TransportEvent::ParticipantJoined {
                    user_id: participant.user_id,
                    callsign: participant.callsign,
                    client_id: participant.client_id,
                });
                true
            }
            SessionSignal::ParticipantLeft { user_id } => {
                self.inner
                    .participants
                    .write()
                    .retain(|p| p.user_id != user_id);
                self.emit(TransportEvent::ParticipantLeft { user_id });
                true
            }
            SessionSignal::SpeakingChanged { user_id, is_speaking } => {
                {
                    let mut list = self.inner.participants.write();
                    if let Some(p) = list.iter_mut().find(|p| p.user_id == user_id) {
                        p.is_speaking = is_speaking;
                    }
                }
                self.emit(TransportEvent::SpeakingChanged { user_id, is_speaking });
                true
            }
            SessionSignal::LinkLost { reason } => {
                self.recover(epoch, reason).await;
                false
            }
            SessionSignal::Closed => {
                let _op = self.inner.ops.lock().await;
                if self.epoch() != epoch {
                    return false;
                }
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                self.reset_session_state();
                if let Err(e) = self.transition(ConnectionInput::Disconnected) {
                    tracing::warn!("{}", e);
                }
                tracing::info!("Session closed by the remote side");
                self.emit(TransportEvent::Disconnected);
                false
            }
            SessionSignal::Fatal { message } => {
                let _op = self.inner.ops.lock().await;
                if self.epoch() != epoch {
                    return false;
                }
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                let _ = self.inner.media.leave().await;
                self.reset_session_state();
                let _ = self.transition(ConnectionInput::Fatal);
                tracing::error!("Fatal transport error: {}", message);
                self.emit_error(ErrorCode::ConnectionLost, &message);
                false
            }
        }
    }

    /// Bounded rejoin loop after a link loss
    async fn recover(&self, epoch: u64, reason: String) {
        {
            let _op = self.inner.ops.lock().await;
            if self.epoch() != epoch {
                return;
            }
            if let Err(e) = self.transition(ConnectionInput::LinkLost) {
                tracing::warn!("{}", e);
                return;
            }
        }
        tracing::warn!("Transport link lost ({}); reconnecting", reason);
        self.emit(TransportEvent::Reconnecting);

        let Some(request) = self.inner.request.lock().clone() else {
            return;
        };
        let policy = self.inner.policy.clone();

        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;

            let op = self.inner.ops.lock().await;
            if self.epoch() != epoch {
                tracing::info!("Reconnect cancelled");
                return;
            }

            match self.join_and_capture(&request).await {
                Ok(room) => {
                    *self.inner.participants.write() = room.participants.clone();
                    self.inner.mic.write().capture_ready = true;
                    self.restore_mic().await;
                    if let Err(e) = self.transition(ConnectionInput::LinkRestored) {
                        tracing::warn!("{}", e);
                        return;
                    }
                    self.spawn_pump(epoch, room.signals);
                    drop(op);

                    tracing::info!("Reconnected after {} attempt(s)", attempt);
                    self.emit(TransportEvent::Reconnected {
                        participants: room.participants,
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Reconnect attempt {}/{} failed: {}",
                        attempt,
                        policy.max_attempts,
                        e
                    );
                }
            }
        }

        let _op = self.inner.ops.lock().await;
        if self.epoch() != epoch {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.reset_session_state();
        let _ = self.transition(ConnectionInput::RetriesExhausted);

        let message = format!("gave up after {} reconnect attempts", policy.max_attempts);
        tracing::error!("Transport {}", message);
        self.emit_error(ErrorCode::ConnectionLost, &message);
    }

    /// Re-assert the publish track on a freshly rejoined room
    async fn restore_mic(&self) {
        let enabled = self.inner.mic.read().enabled;
        if !enabled {
            return;
        }
        if let Err(e) = self.inner.media.set_track_enabled(true).await {
            tracing::warn!("Could not republish after reconnect: {}", e);
            let mut mic = self.inner.mic.write();
            mic.enabled = false;
            mic.ptt_active = false;
        }
    }
}
