//! Push-to-talk handling
//!
//! Maps raw press/release input from pointer, touch and keyboard onto
//! transmit requests for one net. Hold-only: the mic is live exactly while
//! the control is held.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::nets::{DisciplinePolicy, NetRoster, NetRouter, RoutingOutcome, SharedOperator, TransmitDecision};
use crate::protocol::{NetId, RejectReason, SessionNotice};
use crate::transport::TransportAdapter;

// =============================================================================
// Input
// =============================================================================

/// Raw input from a PTT control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "kebab-case")]
pub enum InputEvent {
    PointerDown,
    PointerUp,
    /// Pointer left the control while it may still be pressed
    PointerLeave,
    TouchStart,
    TouchEnd,
    TouchCancel,
    KeyDown(String),
    KeyUp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Press,
    Release,
}

/// Result of one press or release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum PttOutcome {
    Transmitting,
    Released,
    Denied { reason: RejectReason },
    /// Not a PTT input, or a release for a net that is not held
    Ignored,
}

// =============================================================================
// PTT Controller
// =============================================================================

pub struct PttController {
    transport: TransportAdapter,
    router: Arc<NetRouter>,
    roster: Arc<NetRoster>,
    policy: DisciplinePolicy,
    operator: SharedOperator,
    notices: broadcast::Sender<SessionNotice>,
    /// Keyboard keys bound to PTT
    keys: Vec<String>,
    /// Serializes press/release so they reach the transport in input order
    gate: tokio::sync::Mutex<()>,
    /// Net whose control is currently held
    held: Mutex<Option<NetId>>,
    /// Optimistic "Transmitting" indicator
    indicator: AtomicBool,
    issued: AtomicU64,
    completed: AtomicU64,
}

impl PttController {
    pub fn new(
        transport: TransportAdapter,
        router: Arc<NetRouter>,
        roster: Arc<NetRoster>,
        policy: DisciplinePolicy,
        operator: SharedOperator,
        notices: broadcast::Sender<SessionNotice>,
        keys: Vec<String>,
    ) -> Self {
        Self {
            transport,
            router,
            roster,
            policy,
            operator,
            notices,
            keys,
            gate: tokio::sync::Mutex::new(()),
            held: Mutex::new(None),
            indicator: AtomicBool::new(false),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Classify an input. Leave and cancel count as release so a missed
    /// release can never latch the mic open.
    pub fn edge_for(&self, event: &InputEvent) -> Option<Edge> {
        match event {
            InputEvent::PointerDown | InputEvent::TouchStart => Some(Edge::Press),
            InputEvent::PointerUp
            | InputEvent::PointerLeave
            | InputEvent::TouchEnd
            | InputEvent::TouchCancel => Some(Edge::Release),
            InputEvent::KeyDown(key) if self.is_ptt_key(key) => Some(Edge::Press),
            InputEvent::KeyUp(key) if self.is_ptt_key(key) => Some(Edge::Release),
            InputEvent::KeyDown(_) | InputEvent::KeyUp(_) => None,
        }
    }

    pub async fn handle_input(
        &self,
        net: &NetId,
        event: &InputEvent,
    ) -> Result<PttOutcome, TransportError> {
        match self.edge_for(event) {
            Some(Edge::Press) => self.press(net).await,
            Some(Edge::Release) => self.release(net).await,
            None => Ok(PttOutcome::Ignored),
        }
    }

    /// Start transmitting on `net`, selecting it as TX net if needed
    pub async fn press(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        let ticket = self.issue(true);
        let _gate = self.gate.lock().await;
        let result = self.press_locked(net).await;
        self.settle(ticket);
        result
    }

    pub async fn release(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        let ticket = self.issue(false);
        let _gate = self.gate.lock().await;
        let result = self.release_locked(net).await;
        self.settle(ticket);
        result
    }

    /// Drop any hold and silence the mic regardless of input state
    pub async fn force_release(&self) -> Result<bool, TransportError> {
        let ticket = self.issue(false);
        let _gate = self.gate.lock().await;

        let held = self.held.lock().take();
        if let Some(net) = &held {
            self.policy.floor().set_ptt_held(net, false);
        }
        let was_active = self.transport.mic_state().ptt_active;
        let result = self.transport.set_ptt_active(false).await;

        self.settle(ticket);
        result.map(|()| was_active || held.is_some())
    }

    /// Forget the hold after the session went away
    pub fn clear_hold(&self) {
        if let Some(net) = self.held.lock().take() {
            self.policy.floor().set_ptt_held(&net, false);
        }
        self.reconcile();
    }

    pub fn is_transmitting(&self) -> bool {
        self.indicator.load(Ordering::SeqCst)
    }

    pub fn held_net(&self) -> Option<NetId> {
        self.held.lock().clone()
    }

    /// Align the indicator with the transport once no request is pending
    pub fn reconcile(&self) {
        if self.completed.load(Ordering::SeqCst) == self.issued.load(Ordering::SeqCst) {
            self.indicator
                .store(self.transport.mic_state().ptt_active, Ordering::SeqCst);
        }
    }

    fn is_ptt_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    fn issue(&self, optimistic: bool) -> u64 {
        self.indicator.store(optimistic, Ordering::SeqCst);
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn settle(&self, ticket: u64) {
        self.completed.fetch_max(ticket, Ordering::SeqCst);
        if self.issued.load(Ordering::SeqCst) == ticket {
            self.indicator
                .store(self.transport.mic_state().ptt_active, Ordering::SeqCst);
        }
    }

    fn deny(&self, net: &NetId, reason: RejectReason) -> PttOutcome {
        tracing::warn!("PTT on {} denied: {}", net, reason);
        let _ = self.notices.send(SessionNotice::TransmitRejected {
            net_id: Some(net.clone()),
            reason: reason.clone(),
        });
        PttOutcome::Denied { reason }
    }

    async fn press_locked(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        if self.router.whisper_target().await.is_some() {
            return Ok(self.deny(net, RejectReason::WhisperActive));
        }
        let Some(record) = self.roster.get(net) else {
            return Ok(self.deny(net, RejectReason::UnknownNet));
        };

        if self.router.transmit_net().await.as_ref() != Some(net) {
            // Router reports its own rejection notice
            if let RoutingOutcome::Rejected { reason, .. } =
                self.router.select_transmit(Some(net.clone())).await?
            {
                return Ok(PttOutcome::Denied { reason });
            }
        }

        let floor = self.policy.floor();
        if let Some(previous) = self.held.lock().replace(net.clone()) {
            floor.set_ptt_held(&previous, false);
        }
        floor.set_ptt_held(net, true);

        let operator = self.operator.read().clone();
        if let TransmitDecision::Denied(denied) = self.policy.evaluate(&operator, &record) {
            self.held.lock().take();
            floor.set_ptt_held(net, false);
            return Ok(self.deny(net, RejectReason::Discipline { denied }));
        }

        if let Err(e) = self.transport.set_ptt_active(true).await {
            self.held.lock().take();
            floor.set_ptt_held(net, false);
            return Err(e);
        }

        tracing::info!("Transmitting on {}", net);
        Ok(PttOutcome::Transmitting)
    }

    async fn release_locked(&self, net: &NetId) -> Result<PttOutcome, TransportError> {
        {
            let mut held = self.held.lock();
            match held.as_ref() {
                Some(current) if current != net => return Ok(PttOutcome::Ignored),
                _ => *held = None,
            }
        }
        self.policy.floor().set_ptt_held(net, false);

        if self.router.whisper_target().await.is_some() {
            // The whisper owns the track until it ends
            return Ok(PttOutcome::Released);
        }

        self.transport.set_ptt_active(false).await?;
        tracing::info!("Released PTT on {}", net);
        Ok(PttOutcome::Released)
    }
}
