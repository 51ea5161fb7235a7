//! Priority override arbiter
//!
//! A command-staff user may interrupt their TX net. While the override is in
//! place the discipline policy denies every non-command transmitter on that
//! net. A CRITICAL override also cuts off a local non-command transmitter
//! that is already live. Overrides issued locally expire when the issuing
//! transmission ends.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::ptt::PttController;
use crate::error::TransportError;
use crate::nets::{FloorState, NetRoster, NetRouter, SharedOperator};
use crate::protocol::{NetId, PriorityLevel, PriorityOverride, SessionNotice};
use crate::transport::TransportAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideRejection {
    NoTransmitNet,
    UnknownNet,
    NotCommandStaff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum OverrideOutcome {
    Issued { issued: PriorityOverride },
    Rejected { reason: OverrideRejection },
}

pub struct PriorityArbiter {
    transport: TransportAdapter,
    router: Arc<NetRouter>,
    ptt: Arc<PttController>,
    roster: Arc<NetRoster>,
    floor: Arc<FloorState>,
    operator: SharedOperator,
    notices: broadcast::Sender<SessionNotice>,
}

impl PriorityArbiter {
    pub fn new(
        transport: TransportAdapter,
        router: Arc<NetRouter>,
        ptt: Arc<PttController>,
        roster: Arc<NetRoster>,
        floor: Arc<FloorState>,
        operator: SharedOperator,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            transport,
            router,
            ptt,
            roster,
            floor,
            operator,
            notices,
        }
    }

    /// Issue an override on the local TX net
    pub async fn trigger_priority_override(
        &self,
        message: impl Into<String>,
        priority: PriorityLevel,
    ) -> OverrideOutcome {
        let Some(net) = self.router.transmit_net().await else {
            return self.reject(OverrideRejection::NoTransmitNet);
        };
        if !self.roster.contains(&net) {
            return self.reject(OverrideRejection::UnknownNet);
        }

        let operator = self.operator.read().clone();
        if !operator.is_command_for(&net) {
            return self.reject(OverrideRejection::NotCommandStaff);
        }

        let issued = PriorityOverride {
            message: message.into(),
            priority,
            issued_by_net_id: net,
            issued_by_user_id: operator.user_id,
            issued_at: Utc::now(),
        };
        self.floor.set_override(issued.clone());

        tracing::info!(
            "{:?} priority override on {}: {}",
            issued.priority,
            issued.issued_by_net_id,
            issued.message
        );
        let _ = self.notices.send(SessionNotice::PriorityOverride {
            issued: issued.clone(),
        });
        OverrideOutcome::Issued { issued }
    }

    /// Apply an override broadcast by another client. Returns true if the
    /// local transmitter was silenced.
    pub async fn receive_override(&self, issued: PriorityOverride) -> Result<bool, TransportError> {
        let net = issued.issued_by_net_id.clone();
        let issuer = issued.issued_by_user_id.clone();
        let critical = issued.priority == PriorityLevel::Critical;

        self.floor.set_override(issued.clone());
        tracing::info!("Override received on {} from {}", net, issuer);
        let _ = self.notices.send(SessionNotice::PriorityOverride { issued });

        if !critical || self.operator.read().is_command_for(&net) {
            return Ok(false);
        }
        if self.router.transmit_net().await.as_ref() != Some(&net) {
            return Ok(false);
        }

        let mic = self.transport.mic_state();
        let silenced = if mic.ptt_active {
            self.ptt.force_release().await?
        } else if mic.enabled {
            self.transport.set_mic_enabled(false).await?;
            true
        } else {
            false
        };

        if silenced {
            tracing::warn!("Force-silenced on {} by {}", net, issuer);
            let _ = self.notices.send(SessionNotice::ForceSilenced {
                net_id: net,
                issued_by_user_id: issuer,
            });
        }
        Ok(silenced)
    }

    pub fn clear_override(&self, net: &NetId) -> Option<PriorityOverride> {
        let cleared = self.floor.clear_override(net)?;
        tracing::info!("Override on {} cleared", net);
        let _ = self.notices.send(SessionNotice::OverrideCleared {
            net_id: net.clone(),
        });
        Some(cleared)
    }

    pub fn active_override(&self, net: &NetId) -> Option<PriorityOverride> {
        self.floor.active_override(net)
    }

    /// The local transmission ended: drop the overrides it issued
    pub fn expire_local(&self) -> Vec<NetId> {
        let user_id = self.operator.read().user_id.clone();
        let nets = self.floor.overrides_issued_by(&user_id);
        for net in &nets {
            self.clear_override(net);
        }
        nets
    }

    fn reject(&self, reason: OverrideRejection) -> OverrideOutcome {
        tracing::warn!("Priority override rejected: {:?}", reason);
        OverrideOutcome::Rejected { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nets::{DisciplinePolicy, SubmixRequest};
    use crate::protocol::{Discipline, Operator, VoiceNet};
    use crate::testing::connected_adapter;
    use crate::transport::loopback::LoopbackSession;

    struct Fixture {
        media: Arc<LoopbackSession>,
        transport: TransportAdapter,
        router: Arc<NetRouter>,
        ptt: Arc<PttController>,
        arbiter: PriorityArbiter,
    }

    async fn fixture(operator: Operator) -> Fixture {
        let (media, transport) = connected_adapter().await;
        let roster = Arc::new(NetRoster::from_nets([
            VoiceNet::new("COMMAND", "Command", Discipline::Open),
            VoiceNet::new("ALPHA", "Alpha", Discipline::Open),
        ]));
        let floor = Arc::new(FloorState::new());
        let policy = DisciplinePolicy::new(floor.clone());
        let operator = Arc::new(parking_lot::RwLock::new(operator));
        let (notices, _) = broadcast::channel(64);
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
            policy,
            operator.clone(),
            notices.clone(),
            vec![],
        ));
        let arbiter = PriorityArbiter::new(
            transport.clone(),
            router.clone(),
            ptt.clone(),
            roster,
            floor,
            operator,
            notices,
        );
        Fixture {
            media,
            transport,
            router,
            ptt,
            arbiter,
        }
    }

    fn remote(net: &str, priority: PriorityLevel) -> PriorityOverride {
        PriorityOverride {
            message: "Clear the net".to_string(),
            priority,
            issued_by_net_id: NetId::from(net),
            issued_by_user_id: "cmd-1".to_string(),
            issued_at: Utc::now(),
        }
    }

    async fn select(router: &NetRouter, net: &str) {
        router
            .configure_submix(SubmixRequest {
                tx: Some(net.into()),
                monitor: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_requires_tx_net_and_clearance() {
        let f = fixture(Operator::new("u1", "Raven")).await;
        assert_eq!(
            f.arbiter
                .trigger_priority_override("Break", PriorityLevel::Critical)
                .await,
            OverrideOutcome::Rejected {
                reason: OverrideRejection::NoTransmitNet
            }
        );

        select(&f.router, "COMMAND").await;
        assert_eq!(
            f.arbiter
                .trigger_priority_override("Break", PriorityLevel::Critical)
                .await,
            OverrideOutcome::Rejected {
                reason: OverrideRejection::NotCommandStaff
            }
        );
    }

    #[tokio::test]
    async fn test_override_lasts_until_local_release() {
        let f = fixture(Operator::new("u1", "Anchor").with_command_net("COMMAND")).await;
        f.ptt.press(&"COMMAND".into()).await.unwrap();

        let outcome = f
            .arbiter
            .trigger_priority_override("All stations, hold traffic", PriorityLevel::Critical)
            .await;
        assert!(matches!(outcome, OverrideOutcome::Issued { .. }));
        assert!(f.arbiter.active_override(&"COMMAND".into()).is_some());

        f.ptt.release(&"COMMAND".into()).await.unwrap();
        assert_eq!(f.arbiter.expire_local(), vec![NetId::from("COMMAND")]);
        assert!(f.arbiter.active_override(&"COMMAND".into()).is_none());
    }

    #[tokio::test]
    async fn test_critical_override_silences_local_transmitter() {
        let f = fixture(Operator::new("u1", "Raven")).await;
        f.ptt.press(&"ALPHA".into()).await.unwrap();
        assert!(f.media.is_track_enabled());

        let silenced = f
            .arbiter
            .receive_override(remote("ALPHA", PriorityLevel::Critical))
            .await
            .unwrap();

        assert!(silenced);
        assert!(!f.media.is_track_enabled());
        assert!(!f.ptt.is_transmitting());
        let outcome = f.ptt.press(&"ALPHA".into()).await.unwrap();
        assert!(matches!(outcome, crate::control::PttOutcome::Denied { .. }));
    }

    #[tokio::test]
    async fn test_normal_override_only_gates_new_transmissions() {
        let f = fixture(Operator::new("u1", "Raven")).await;
        f.ptt.press(&"ALPHA".into()).await.unwrap();

        let silenced = f
            .arbiter
            .receive_override(remote("ALPHA", PriorityLevel::Normal))
            .await
            .unwrap();

        assert!(!silenced);
        assert!(f.transport.mic_state().ptt_active);
    }

    #[tokio::test]
    async fn test_override_on_other_net_leaves_local_alone() {
        let f = fixture(Operator::new("u1", "Raven")).await;
        f.ptt.press(&"ALPHA".into()).await.unwrap();

        let silenced = f
            .arbiter
            .receive_override(remote("COMMAND", PriorityLevel::Critical))
            .await
            .unwrap();

        assert!(!silenced);
        assert!(f.media.is_track_enabled());
        assert!(f.arbiter.clear_override(&"COMMAND".into()).is_some());
        assert!(f.arbiter.clear_override(&"COMMAND".into()).is_none());
    }
}
