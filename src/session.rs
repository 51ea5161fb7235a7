//! Voice session
//!
//! The one owner object per client. It builds the transport, roster, floor,
//! routing and control components, wires them together and keeps them in
//! step with transport events:
//!
//! ```text
//!   TransportAdapter ──events──► reconciler task
//!                                  ├─ connected / reconnected ─► NetRouter::reapply
//!                                  ├─ disconnected / lost      ─► NetRouter::detach, whisper and hold dropped
//!                                  ├─ mic or PTT off           ─► PriorityArbiter::expire_local
//!                                  └─ mic / PTT / error        ─► PttController::reconcile
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::connection::ReconnectPolicy;
use crate::constants::NOTICE_CHANNEL_CAPACITY;
use crate::control::{
    InputEvent, OverrideOutcome, PriorityArbiter, PttController, PttOutcome, WhisperManager,
};
use crate::error::TransportError;
use crate::nets::{
    DisciplinePolicy, FloorState, NetRoster, NetRouter, RoutingOutcome, RoutingSnapshot,
    SharedOperator, SubmixRequest, TransmitDecision,
};
use crate::protocol::{
    Bus, ConnectionState, DenyReason, ErrorCode, NetId, Operator, Participant, PriorityLevel,
    PriorityOverride, RejectReason, SessionNotice, TransportEvent, VoiceNet, WhisperSession,
    WhisperTarget,
};
use crate::transport::{
    JoinRequest, MediaSession, MicState, SessionUser, Subscription, TransportAdapter,
};

/// Parameters for joining a net
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub session_token: String,
    pub net_id: NetId,
    /// Falls back to the configured endpoint
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Answer to "why can't I transmit right now?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TransmitStatus {
    Ready { bus: Bus },
    Disconnected { state: ConnectionState },
    NoTransmitNet,
    Discipline { net_id: NetId, reason: DenyReason },
    DeviceFailure { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum MicOutcome {
    Applied { enabled: bool },
    Refused { status: TransmitStatus },
}

/// Everything the UI shows at a glance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub joined_net_id: Option<NetId>,
    pub participant_count: usize,
    pub routing: RoutingSnapshot,
    pub mic: MicState,
    pub transmitting: bool,
    pub whisper: Option<WhisperSession>,
    pub transmit_status: TransmitStatus,
}

pub struct VoiceSession {
    transport: TransportAdapter,
    roster: Arc<NetRoster>,
    floor: Arc<FloorState>,
    policy: DisciplinePolicy,
    operator: SharedOperator,
    router: Arc<NetRouter>,
    ptt: Arc<PttController>,
    whisper: Arc<WhisperManager>,
    arbiter: Arc<PriorityArbiter>,
    notices: broadcast::Sender<SessionNotice>,
    endpoint_url: String,
    forwarder: Option<Subscription>,
    reconciler: JoinHandle<()>,
}

impl VoiceSession {
    /// Build a session over `media`. Must be called inside a tokio runtime.
    pub fn new(media: Arc<dyn MediaSession>, config: &AppConfig) -> Self {
        let transport = TransportAdapter::new(
            media,
            ReconnectPolicy::from(config.transport.reconnect.clone()),
        );
        let roster = Arc::new(NetRoster::from_nets(config.nets.iter().cloned()));
        let floor = Arc::new(FloorState::new());
        let policy = DisciplinePolicy::new(floor.clone());
        let operator: SharedOperator = Arc::new(RwLock::new(config.operator.clone()));
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        let router = Arc::new(NetRouter::new(
            transport.clone(),
            roster.clone(),
            policy.clone(),
            operator.clone(),
            notices.clone(),
        ));
        let ptt = Arc::new(PttController::new(
            transport.clone(),
            router.clone(),
            roster.clone(),
            policy.clone(),
            operator.clone(),
            notices.clone(),
            config.ptt.keys.clone(),
        ));
        let whisper = Arc::new(WhisperManager::new(
            transport.clone(),
            router.clone(),
            notices.clone(),
        ));
        let arbiter = Arc::new(PriorityArbiter::new(
            transport.clone(),
            router.clone(),
            ptt.clone(),
            roster.clone(),
            floor.clone(),
            operator.clone(),
            notices.clone(),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let fanout = notices.clone();
        let forwarder = transport.events().on_any(move |event| {
            let _ = event_tx.send(event.clone());
            let _ = fanout.send(SessionNotice::Transport {
                event: event.clone(),
            });
        });

        let reconciler = tokio::spawn(reconcile_events(
            event_rx,
            router.clone(),
            ptt.clone(),
            whisper.clone(),
            arbiter.clone(),
        ));

        tracing::info!(
            "Voice session ready for {} with {} net(s)",
            config.operator.callsign,
            roster.len()
        );

        Self {
            transport,
            roster,
            floor,
            policy,
            operator,
            router,
            ptt,
            whisper,
            arbiter,
            notices,
            endpoint_url: config.transport.endpoint_url.clone(),
            forwarder: Some(forwarder),
            reconciler,
        }
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Join a net. A session that is already up is replaced, and its whisper
    /// and PTT hold end with it.
    pub async fn connect(&self, params: ConnectParams) -> Result<(), TransportError> {
        self.whisper_cleanup().await;
        self.ptt.clear_hold();

        let operator = self.operator.read().clone();
        let request = JoinRequest {
            session_token: params.session_token,
            endpoint_url: params
                .endpoint_url
                .unwrap_or_else(|| self.endpoint_url.clone()),
            net_id: params.net_id,
            user: SessionUser {
                user_id: operator.user_id,
                callsign: operator.callsign,
            },
        };
        self.transport.connect(request).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.whisper_cleanup().await;
        self.ptt.clear_hold();
        self.transport.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.transport.participants()
    }

    pub fn mic_state(&self) -> MicState {
        self.transport.mic_state()
    }

    pub async fn set_audio_device(&self, device_id: &str) -> Result<(), TransportError> {
        self.transport.set_audio_device(device_id).await
    }

    // -------------------------------------------------------------------------
    // Routing and transmit
    // -------------------------------------------------------------------------

    pub async fn configure_submix(
        &self,
        request: SubmixRequest,
    ) -> Result<RoutingOutcome, TransportError> {
        self.router.configure_submix(request).await
    }

    pub async fn routing(&self) -> RoutingSnapshot {
        self.router.snapshot().await
    }

    pub async fn handle_input(
        &self,
        net: &NetId,
        event: &InputEvent,
    ) -> Result<PttOutcome, TransportError> {
        self.ptt.handle_input(net, event).await
    }

    pub async fn press(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        self.ptt.press(net).await
    }

    pub async fn release(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        self.ptt.release(net).await
    }

    pub fn is_transmitting(&self) -> bool {
        self.ptt.is_transmitting()
    }

    /// Open-mic toggle. Enabling is held to the same discipline as a
    /// transmission on the TX net.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<MicOutcome, TransportError> {
        if enabled {
            let status = self.transmit_status().await;
            if !matches!(status, TransmitStatus::Ready { .. }) {
                tracing::warn!("Mic stays off: {:?}", status);
                return Ok(MicOutcome::Refused { status });
            }
        }
        self.transport.set_mic_enabled(enabled).await?;
        Ok(MicOutcome::Applied { enabled })
    }

    pub async fn transmit_status(&self) -> TransmitStatus {
        let state = self.transport.state();
        if state != ConnectionState::Connected {
            return TransmitStatus::Disconnected { state };
        }
        let mic = self.transport.mic_state();
        if !mic.capture_ready {
            return TransmitStatus::DeviceFailure {
                message: mic
                    .device_error
                    .unwrap_or_else(|| "no capture device open".to_string()),
            };
        }
        if let Some(target) = self.router.whisper_target().await {
            return TransmitStatus::Ready {
                bus: Bus::Whisper(target),
            };
        }

        let Some(code) = self.router.transmit_net().await else {
            return TransmitStatus::NoTransmitNet;
        };
        let Some(net) = self.roster.get(&code) else {
            return TransmitStatus::NoTransmitNet;
        };
        let operator = self.operator.read().clone();
        match self.policy.evaluate(&operator, &net) {
            TransmitDecision::Permitted => TransmitStatus::Ready { bus: Bus::Net(code) },
            TransmitDecision::Denied(reason) => TransmitStatus::Discipline {
                net_id: code,
                reason,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Whisper and priority
    // -------------------------------------------------------------------------

    pub async fn start_whisper(
        &self,
        target: WhisperTarget,
        label: impl Into<String>,
    ) -> Result<WhisperSession, TransportError> {
        self.whisper.start_whisper(target, label).await
    }

    pub async fn stop_whisper(&self) -> Result<Option<WhisperSession>, TransportError> {
        self.whisper.stop_whisper().await
    }

    pub async fn active_whisper(&self) -> Option<WhisperSession> {
        self.whisper.active().await
    }

    pub async fn trigger_priority_override(
        &self,
        message: impl Into<String>,
        priority: PriorityLevel,
    ) -> OverrideOutcome {
        self.arbiter.trigger_priority_override(message, priority).await
    }

    pub async fn receive_override(&self, issued: PriorityOverride) -> Result<bool, TransportError> {
        self.arbiter.receive_override(issued).await
    }

    pub fn clear_override(&self, net: &NetId) -> Option<PriorityOverride> {
        self.arbiter.clear_override(net)
    }

    pub fn active_override(&self, net: &NetId) -> Option<PriorityOverride> {
        self.arbiter.active_override(net)
    }

    // -------------------------------------------------------------------------
    // Roster, floor and operator
    // -------------------------------------------------------------------------

    pub fn nets(&self) -> Vec<VoiceNet> {
        self.roster.list()
    }

    pub async fn upsert_net(&self, net: VoiceNet) -> Result<(), TransportError> {
        self.roster.upsert(net);
        self.refresh().await
    }

    pub async fn remove_net(&self, code: &NetId) -> Result<Option<VoiceNet>, TransportError> {
        let removed = self.roster.remove(code);
        if removed.is_some() {
            self.floor.clear_net(code);
            self.refresh().await?;
        }
        Ok(removed)
    }

    pub async fn replace_roster(&self, nets: Vec<VoiceNet>) -> Result<Vec<NetId>, TransportError> {
        let removed = self.roster.replace_all(nets);
        for code in &removed {
            self.floor.clear_net(code);
        }
        self.refresh().await?;
        Ok(removed)
    }

    pub async fn grant_speaking_token(&self, net: &NetId, user_id: &str) {
        self.floor.grant_token(net, user_id);
    }

    pub async fn revoke_speaking_token(
        &self,
        net: &NetId,
        user_id: &str,
    ) -> Result<(), TransportError> {
        if self.floor.revoke_token(net, user_id) {
            self.enforce_floor().await?;
        }
        Ok(())
    }

    pub fn operator(&self) -> Operator {
        self.operator.read().clone()
    }

    pub async fn set_operator(&self, operator: Operator) -> Result<(), TransportError> {
        *self.operator.write() = operator;
        self.refresh().await
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn transport(&self) -> &TransportAdapter {
        &self.transport
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.transport.state(),
            joined_net_id: self.transport.joined_net(),
            participant_count: self.transport.participants().len(),
            routing: self.router.snapshot().await,
            mic: self.transport.mic_state(),
            transmitting: self.ptt.is_transmitting(),
            whisper: self.whisper.active().await,
            transmit_status: self.transmit_status().await,
        }
    }

    /// Roster, rank or floor changed: drop routes that no longer hold and
    /// cut a live transmission the policy no longer allows
    async fn refresh(&self) -> Result<(), TransportError> {
        let dropped = self.router.revalidate().await?;
        if !dropped.is_empty() {
            tracing::info!("Routing dropped {:?} after roster change", dropped);
        }
        self.enforce_floor().await
    }

    async fn enforce_floor(&self) -> Result<(), TransportError> {
        let mic = self.transport.mic_state();
        if !(mic.enabled || mic.ptt_active) || self.router.whisper_target().await.is_some() {
            return Ok(());
        }

        let status = self.transmit_status().await;
        let net_id = match &status {
            TransmitStatus::Discipline { net_id, .. } => Some(net_id.clone()),
            TransmitStatus::NoTransmitNet => None,
            _ => return Ok(()),
        };

        tracing::warn!("Cutting local transmission: {:?}", status);
        if mic.ptt_active {
            self.ptt.force_release().await?;
        } else {
            self.transport.set_mic_enabled(false).await?;
        }
        if let TransmitStatus::Discipline { reason, .. } = status {
            let _ = self.notices.send(SessionNotice::TransmitRejected {
                net_id,
                reason: RejectReason::Discipline { denied: reason },
            });
        }
        Ok(())
    }

    async fn whisper_cleanup(&self) {
        if let Err(e) = self.whisper.stop_whisper().await {
            tracing::warn!("Whisper cleanup on disconnect failed: {}", e);
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.unsubscribe();
        }
        self.reconciler.abort();
    }
}

/// The event marks the end of a joined session
fn ends_session(event: &TransportEvent) -> bool {
    matches!(
        event,
        TransportEvent::Disconnected
            | TransportEvent::Error {
                code: ErrorCode::ConnectionLost | ErrorCode::ConnectionFailed,
                ..
            }
    )
}

async fn reconcile_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    router: Arc<NetRouter>,
    ptt: Arc<PttController>,
    whisper: Arc<WhisperManager>,
    arbiter: Arc<PriorityArbiter>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            TransportEvent::Connected { .. } | TransportEvent::Reconnected { .. } => {
                if let Err(e) = router.reapply().await {
                    tracing::warn!("Routing re-apply failed: {}", e);
                }
            }
            event if ends_session(event) => {
                router.detach().await;
                if let Some(ended) = whisper.abandon().await {
                    tracing::info!("Whisper to {} dropped with the session", ended.target);
                }
                ptt.clear_hold();
            }
            TransportEvent::PttActive { active: false }
            | TransportEvent::MicEnabled { enabled: false } => {
                let expired = arbiter.expire_local();
                if !expired.is_empty() {
                    tracing::debug!("Overrides expired with the transmission: {:?}", expired);
                }
            }
            _ => {}
        }

        if matches!(
            event,
            TransportEvent::PttActive { .. }
                | TransportEvent::MicEnabled { .. }
                | TransportEvent::Error { .. }
        ) {
            ptt.reconcile();
        }
    }
}
