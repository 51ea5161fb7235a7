//! Net routing engine
//!
//! Holds the desired routing (one TX net, any number of monitored nets) and
//! makes the transport match it. The local track is bound to at most one
//! publish bus at any instant: a bus switch always unbinds the old bus before
//! binding the new one.
//!
//! ```text
//!   desired.transmit_net ─┐
//!                         ├─► target bus ──► unbind old ──► bind new
//!   whisper (overrides) ──┘
//!
//!   desired.monitored ──────► unsubscribe stale ──► subscribe fresh
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use super::discipline::{DisciplinePolicy, TransmitDecision};
use super::roster::NetRoster;
use crate::error::TransportError;
use crate::protocol::{Bus, NetId, Operator, RejectReason, SessionNotice, WhisperTarget};
use crate::transport::TransportAdapter;

/// Operator record shared between the routing and control layers
pub type SharedOperator = Arc<RwLock<Operator>>;

/// `configureSubmix` request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmixRequest {
    #[serde(default)]
    pub tx: Option<NetId>,
    #[serde(default)]
    pub monitor: Vec<NetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    pub transmit_net: Option<NetId>,
    pub monitored: BTreeSet<NetId>,
}

/// Routing as observed by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSnapshot {
    pub transmit_net_id: Option<NetId>,
    pub monitored_net_ids: Vec<NetId>,
    /// Bus the local track is bound to right now
    pub publishing: Option<Bus>,
    pub whisper: Option<WhisperTarget>,
    pub mic_enabled: bool,
    pub ptt_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RoutingOutcome {
    /// Request applied; `skipped` lists monitor nets that were not subscribed
    Applied {
        snapshot: RoutingSnapshot,
        skipped: Vec<NetId>,
    },
    /// TX change refused; nothing was changed
    Rejected {
        net_id: Option<NetId>,
        reason: RejectReason,
    },
}

impl RoutingOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RoutingOutcome::Applied { .. })
    }
}

#[derive(Default)]
struct RouterState {
    desired: RoutingState,
    whisper: Option<WhisperTarget>,
    /// What the transport currently has bound / subscribed
    bound: Option<Bus>,
    subscribed: BTreeSet<NetId>,
}

impl RouterState {
    fn target_bus(&self) -> Option<Bus> {
        match &self.whisper {
            Some(target) => Some(Bus::Whisper(target.clone())),
            None => self.desired.transmit_net.clone().map(Bus::Net),
        }
    }
}

pub struct NetRouter {
    transport: TransportAdapter,
    roster: Arc<NetRoster>,
    policy: DisciplinePolicy,
    operator: SharedOperator,
    notices: broadcast::Sender<SessionNotice>,
    state: Mutex<RouterState>,
}

impl NetRouter {
    pub fn new(
        transport: TransportAdapter,
        roster: Arc<NetRoster>,
        policy: DisciplinePolicy,
        operator: SharedOperator,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            transport,
            roster,
            policy,
            operator,
            notices,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Set the TX net and the monitored nets in one step.
    ///
    /// A TX change that the discipline policy refuses leaves everything as it
    /// was and comes back as [`RoutingOutcome::Rejected`].
    pub async fn configure_submix(
        &self,
        request: SubmixRequest,
    ) -> Result<RoutingOutcome, TransportError> {
        let mut state = self.state.lock().await;
        self.apply_request(&mut state, request.tx, Some(request.monitor))
            .await
    }

    /// Change only the TX net, keeping the monitored set
    pub async fn select_transmit(
        &self,
        net: Option<NetId>,
    ) -> Result<RoutingOutcome, TransportError> {
        let mut state = self.state.lock().await;
        self.apply_request(&mut state, net, None).await
    }

    pub async fn transmit_net(&self) -> Option<NetId> {
        self.state.lock().await.desired.transmit_net.clone()
    }

    pub async fn desired(&self) -> RoutingState {
        self.state.lock().await.desired.clone()
    }

    pub async fn snapshot(&self) -> RoutingSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    /// Bind and subscribe everything from scratch on a fresh session
    pub async fn reapply(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.bound = None;
        state.subscribed.clear();

        if !self.transport.is_connected() {
            return Ok(());
        }

        tracing::info!(
            "Re-applying routing: tx {:?}, {} monitored net(s)",
            state.desired.transmit_net,
            state.desired.monitored.len()
        );
        let publish = self.sync_publish(&mut state).await;
        let subscribe = self.sync_subscriptions(&mut state).await;
        publish.and(subscribe)
    }

    /// The session is gone; nothing is bound any more and a whisper does
    /// not carry over to the next one. Returns the dropped whisper target.
    pub async fn detach(&self) -> Option<WhisperTarget> {
        let mut state = self.state.lock().await;
        state.bound = None;
        state.subscribed.clear();
        state.whisper.take()
    }

    /// Drop nets that left the roster or can no longer be received.
    /// Returns the dropped nets.
    pub async fn revalidate(&self) -> Result<Vec<NetId>, TransportError> {
        let mut state = self.state.lock().await;
        let operator = self.operator.read().clone();
        let mut dropped = Vec::new();

        if let Some(code) = state.desired.transmit_net.clone() {
            if !self.roster.contains(&code) {
                tracing::info!("TX net {} left the roster", code);
                state.desired.transmit_net = None;
                dropped.push(code);
            }
        }

        let stale: Vec<NetId> = state
            .desired
            .monitored
            .iter()
            .filter(|code| {
                self.roster
                    .get(code)
                    .map_or(true, |net| !self.policy.can_receive(&operator, &net))
            })
            .cloned()
            .collect();
        for code in stale {
            state.desired.monitored.remove(&code);
            if !dropped.contains(&code) {
                dropped.push(code);
            }
        }

        if dropped.is_empty() {
            return Ok(dropped);
        }

        self.notify_routing(&state);
        if self.transport.is_connected() {
            let publish = self.sync_publish(&mut state).await;
            let subscribe = self.sync_subscriptions(&mut state).await;
            publish.and(subscribe)?;
        }
        Ok(dropped)
    }

    /// Move the publish bus onto a whisper target. Returns the TX net in
    /// effect before the whisper.
    pub async fn begin_whisper(
        &self,
        target: WhisperTarget,
    ) -> Result<Option<NetId>, TransportError> {
        let mut state = self.state.lock().await;
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected(self.transport.state()));
        }

        let prior = state.desired.transmit_net.clone();
        state.whisper = Some(target);
        if let Err(e) = self.sync_publish(&mut state).await {
            state.whisper = None;
            if let Err(restore) = self.sync_publish(&mut state).await {
                tracing::error!("Failed to restore publish bus after whisper failure: {}", restore);
            }
            return Err(e);
        }
        Ok(prior)
    }

    /// Leave the whisper bus and restore `prior` as TX net if it is still
    /// valid, otherwise fall back to no TX net. Returns the restored net.
    pub async fn end_whisper(
        &self,
        prior: Option<NetId>,
    ) -> Result<Option<NetId>, TransportError> {
        let mut state = self.state.lock().await;
        if state.whisper.take().is_none() {
            return Ok(state.desired.transmit_net.clone());
        }

        let restored = prior.filter(|code| {
            self.roster.contains(code) && state.desired.transmit_net.as_ref() == Some(code)
        });
        if state.desired.transmit_net != restored {
            tracing::info!(
                "TX net {:?} did not survive the whisper; restoring no TX net",
                state.desired.transmit_net
            );
            state.desired.transmit_net = restored.clone();
            self.notify_routing(&state);
        }

        if self.transport.is_connected() {
            self.sync_publish(&mut state).await?;
        }
        Ok(restored)
    }

    pub async fn whisper_target(&self) -> Option<WhisperTarget> {
        self.state.lock().await.whisper.clone()
    }

    async fn apply_request(
        &self,
        state: &mut RouterState,
        tx: Option<NetId>,
        monitor: Option<Vec<NetId>>,
    ) -> Result<RoutingOutcome, TransportError> {
        let operator = self.operator.read().clone();

        if tx != state.desired.transmit_net {
            if let Err(reason) = self.check_transmit(&operator, state, tx.as_ref()) {
                tracing::warn!("TX change to {:?} rejected: {}", tx, reason);
                let _ = self.notices.send(SessionNotice::TransmitRejected {
                    net_id: tx.clone(),
                    reason: reason.clone(),
                });
                return Ok(RoutingOutcome::Rejected { net_id: tx, reason });
            }
        }

        let mut skipped = Vec::new();
        let monitored = match monitor {
            Some(requested) => {
                let mut monitored = BTreeSet::new();
                for code in requested {
                    match self.roster.get(&code) {
                        Some(net) if self.policy.can_receive(&operator, &net) => {
                            monitored.insert(code);
                        }
                        _ => {
                            tracing::warn!("Not monitoring {}: unknown or not receivable", code);
                            skipped.push(code);
                        }
                    }
                }
                monitored
            }
            None => state.desired.monitored.clone(),
        };

        let previous = std::mem::replace(
            &mut state.desired,
            RoutingState {
                transmit_net: tx,
                monitored,
            },
        );

        if self.transport.is_connected() {
            if let Err(e) = self.sync_publish(state).await {
                tracing::warn!("Publish switch failed, keeping {:?}: {}", previous.transmit_net, e);
                state.desired = previous;
                if let Err(restore) = self.sync_publish(state).await {
                    tracing::error!("Failed to restore publish bus: {}", restore);
                }
                return Err(e);
            }
            self.sync_subscriptions(state).await?;
        }

        if previous != state.desired {
            tracing::info!(
                "Routing: tx {:?}, monitoring {:?}",
                state.desired.transmit_net,
                state.desired.monitored
            );
            self.notify_routing(state);
        }

        Ok(RoutingOutcome::Applied {
            snapshot: self.snapshot_of(state),
            skipped,
        })
    }

    fn check_transmit(
        &self,
        operator: &Operator,
        state: &RouterState,
        tx: Option<&NetId>,
    ) -> Result<(), RejectReason> {
        if state.whisper.is_some() {
            return Err(RejectReason::WhisperActive);
        }
        let Some(code) = tx else {
            return Ok(());
        };
        let net = self.roster.get(code).ok_or(RejectReason::UnknownNet)?;
        match self.policy.evaluate_selection(operator, &net) {
            TransmitDecision::Permitted => Ok(()),
            TransmitDecision::Denied(denied) => Err(RejectReason::Discipline { denied }),
        }
    }

    async fn sync_publish(&self, state: &mut RouterState) -> Result<(), TransportError> {
        let target = state.target_bus();
        if state.bound == target {
            return Ok(());
        }

        if let Some(old) = state.bound.clone() {
            self.transport.unbind_publish(&old).await?;
            state.bound = None;
        }
        if let Some(new) = target {
            self.transport.bind_publish(&new).await?;
            tracing::debug!("Publish bus bound to {:?}", new);
            state.bound = Some(new);
        }
        Ok(())
    }

    async fn sync_subscriptions(&self, state: &mut RouterState) -> Result<(), TransportError> {
        let mut first_error = None;

        let stale: Vec<NetId> = state
            .subscribed
            .difference(&state.desired.monitored)
            .cloned()
            .collect();
        for code in stale {
            match self.transport.unsubscribe(&code).await {
                Ok(()) => {
                    state.subscribed.remove(&code);
                }
                Err(e) => {
                    tracing::warn!("Unsubscribe from {} failed: {}", code, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let fresh: Vec<NetId> = state
            .desired
            .monitored
            .difference(&state.subscribed)
            .cloned()
            .collect();
        for code in fresh {
            match self.transport.subscribe(&code).await {
                Ok(()) => {
                    state.subscribed.insert(code);
                }
                Err(e) => {
                    tracing::warn!("Subscribe to {} failed: {}", code, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn snapshot_of(&self, state: &RouterState) -> RoutingSnapshot {
        let mic = self.transport.mic_state();
        RoutingSnapshot {
            transmit_net_id: state.desired.transmit_net.clone(),
            monitored_net_ids: state.desired.monitored.iter().cloned().collect(),
            publishing: state.bound.clone(),
            whisper: state.whisper.clone(),
            mic_enabled: mic.enabled,
            ptt_active: mic.ptt_active,
        }
    }

    fn notify_routing(&self, state: &RouterState) {
        let _ = self.notices.send(SessionNotice::RoutingChanged {
            transmit_net_id: state.desired.transmit_net.clone(),
            monitored_net_ids: state.desired.monitored.iter().cloned().collect(),
        });
    }
}
