//! Whisper side-channel
//!
//! While a whisper is held the local track publishes to the whisper bus
//! instead of the TX net. The TX net itself is left alone and comes back
//! when the whisper ends.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::error::TransportError;
use crate::nets::NetRouter;
use crate::protocol::{NetId, SessionNotice, WhisperSession, WhisperTarget};
use crate::transport::TransportAdapter;

struct ActiveWhisper {
    session: WhisperSession,
    prior_tx: Option<NetId>,
    prior_ptt: bool,
    /// Open mic that was live without PTT before the whisper
    prior_open_mic: bool,
}

pub struct WhisperManager {
    transport: TransportAdapter,
    router: Arc<NetRouter>,
    notices: broadcast::Sender<SessionNotice>,
    active: Mutex<Option<ActiveWhisper>>,
}

impl WhisperManager {
    pub fn new(
        transport: TransportAdapter,
        router: Arc<NetRouter>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            transport,
            router,
            notices,
            active: Mutex::new(None),
        }
    }

    /// Start whispering to `target`. A whisper that is already running is
    /// stopped first.
    pub async fn start_whisper(
        &self,
        target: WhisperTarget,
        label: impl Into<String>,
    ) -> Result<WhisperSession, TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::info!("Replacing whisper to {}", previous.session.target);
            self.finish(previous).await?;
        }

        let mic = self.transport.mic_state();
        let prior_ptt = mic.ptt_active;
        let prior_open_mic = mic.enabled && !mic.ptt_active;
        let prior_tx = self.router.begin_whisper(target.clone()).await?;

        if let Err(e) = self.transport.set_ptt_active(true).await {
            if let Err(restore) = self.router.end_whisper(prior_tx).await {
                tracing::error!("Failed to restore routing after whisper failure: {}", restore);
            }
            return Err(e);
        }

        let session = WhisperSession {
            target,
            label: label.into(),
            active: true,
        };
        tracing::info!("Whispering to {} ({})", session.target, session.label);
        let _ = self.notices.send(SessionNotice::WhisperStarted {
            session: session.clone(),
        });

        *active = Some(ActiveWhisper {
            session: session.clone(),
            prior_tx,
            prior_ptt,
            prior_open_mic,
        });
        Ok(session)
    }

    /// End the current whisper. Without one this does nothing.
    pub async fn stop_whisper(&self) -> Result<Option<WhisperSession>, TransportError> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(whisper) => self.finish(whisper).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn active(&self) -> Option<WhisperSession> {
        self.active.lock().await.as_ref().map(|w| w.session.clone())
    }

    /// Forget the whisper after its session went away. Nothing is sent to
    /// the transport; [`NetRouter::detach`] drops the routing side.
    pub async fn abandon(&self) -> Option<WhisperSession> {
        let ActiveWhisper { mut session, .. } = self.active.lock().await.take()?;
        session.active = false;

        let restored = self.router.transmit_net().await;
        tracing::info!("Whisper to {} ended with its session", session.target);
        let _ = self.notices.send(SessionNotice::WhisperEnded {
            session: session.clone(),
            restored_net_id: restored,
        });
        Some(session)
    }

    async fn finish(&self, whisper: ActiveWhisper) -> Result<WhisperSession, TransportError> {
        let ActiveWhisper {
            mut session,
            prior_tx,
            prior_ptt,
            prior_open_mic,
        } = whisper;

        // Silence the track before the bus moves back to the net
        if !prior_ptt {
            if let Err(e) = self.transport.set_ptt_active(false).await {
                tracing::warn!("Failed to release mic at whisper end: {}", e);
            }
        }
        let routed = self.router.end_whisper(prior_tx).await;

        session.active = false;
        let restored = routed.as_ref().ok().cloned().flatten();
        if prior_ptt && restored.is_none() {
            let _ = self.transport.set_ptt_active(false).await;
        }
        if prior_open_mic && restored.is_some() {
            if let Err(e) = self.transport.set_mic_enabled(true).await {
                tracing::warn!("Failed to reopen mic after whisper: {}", e);
            }
        }

        tracing::info!(
            "Whisper to {} ended; TX net {:?}",
            session.target,
            restored
        );
        let _ = self.notices.send(SessionNotice::WhisperEnded {
            session: session.clone(),
            restored_net_id: restored,
        });

        routed.map(|_| session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nets::{DisciplinePolicy, FloorState, NetRoster, SubmixRequest};
    use crate::protocol::{Bus, Discipline, Operator, VoiceNet};
    use crate::testing::connected_adapter;
    use crate::transport::loopback::{FailOp, LoopbackSession};

    struct Fixture {
        media: Arc<LoopbackSession>,
        transport: TransportAdapter,
        roster: Arc<NetRoster>,
        router: Arc<NetRouter>,
        whisper: WhisperManager,
        notices: broadcast::Receiver<SessionNotice>,
    }

    async fn fixture() -> Fixture {
        let (media, transport) = connected_adapter().await;
        let roster = Arc::new(NetRoster::from_nets([
            VoiceNet::new("SQUAD", "Squad", Discipline::Open),
            VoiceNet::new("GENERAL", "General", Discipline::Open),
        ]));
        let (tx, notices) = broadcast::channel(64);
        let router = Arc::new(NetRouter::new(
            transport.clone(),
            roster.clone(),
            DisciplinePolicy::new(Arc::new(FloorState::new())),
            Arc::new(parking_lot::RwLock::new(Operator::new("u1", "Raven"))),
            tx.clone(),
        ));
        router
            .configure_submix(SubmixRequest {
                tx: Some("SQUAD".into()),
                monitor: vec!["GENERAL".into()],
            })
            .await
            .unwrap();
        let whisper = WhisperManager::new(transport.clone(), router.clone(), tx);
        Fixture {
            media,
            transport,
            roster,
            router,
            whisper,
            notices,
        }
    }

    fn user(id: &str) -> WhisperTarget {
        WhisperTarget::User(id.to_string())
    }

    #[tokio::test]
    async fn test_whisper_round_trip_restores_tx() {
        let f = fixture().await;

        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();
        assert_eq!(f.media.bound_buses(), vec![Bus::Whisper(user("u7"))]);
        assert!(f.media.is_track_enabled());
        assert!(f.whisper.active().await.is_some());

        let ended = f.whisper.stop_whisper().await.unwrap().unwrap();
        assert!(!ended.active);
        assert_eq!(f.router.transmit_net().await, Some(NetId::from("SQUAD")));
        assert_eq!(f.media.bound_buses(), vec![Bus::Net("SQUAD".into())]);
        assert!(!f.media.is_track_enabled());
        assert_eq!(f.media.subscriptions(), vec![NetId::from("GENERAL")]);
        assert_eq!(f.media.max_concurrent_publish(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_whisper_is_noop() {
        let f = fixture().await;
        f.media.clear_calls();

        assert_eq!(f.whisper.stop_whisper().await.unwrap(), None);
        assert_eq!(f.whisper.stop_whisper().await.unwrap(), None);
        assert!(f.media.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_replaces_first() {
        let mut f = fixture().await;
        while f.notices.try_recv().is_ok() {}

        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();
        f.whisper
            .start_whisper(WhisperTarget::Squad("blue".to_string()), "Blue")
            .await
            .unwrap();

        assert_eq!(
            f.media.bound_buses(),
            vec![Bus::Whisper(WhisperTarget::Squad("blue".to_string()))]
        );
        assert_eq!(f.media.max_concurrent_publish(), 1);

        let kinds: Vec<&'static str> = std::iter::from_fn(|| f.notices.try_recv().ok())
            .map(|notice| match notice {
                SessionNotice::WhisperStarted { .. } => "started",
                SessionNotice::WhisperEnded { .. } => "ended",
                _ => "other",
            })
            .filter(|kind| *kind != "other")
            .collect();
        assert_eq!(kinds, vec!["started", "ended", "started"]);

        f.whisper.stop_whisper().await.unwrap();
        assert_eq!(f.router.transmit_net().await, Some(NetId::from("SQUAD")));
    }

    #[tokio::test]
    async fn test_restore_falls_back_when_tx_removed() {
        let f = fixture().await;
        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();

        f.roster.remove(&"SQUAD".into());
        f.router.revalidate().await.unwrap();
        f.whisper.stop_whisper().await.unwrap();

        assert_eq!(f.router.transmit_net().await, None);
        assert!(f.media.bound_buses().is_empty());
    }

    #[tokio::test]
    async fn test_keeps_transmitting_when_ptt_was_held() {
        let f = fixture().await;
        f.transport.set_ptt_active(true).await.unwrap();

        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();
        f.whisper.stop_whisper().await.unwrap();

        assert!(f.transport.mic_state().ptt_active);
        assert!(f.media.is_track_enabled());
        assert_eq!(f.media.bound_buses(), vec![Bus::Net("SQUAD".into())]);
    }

    #[tokio::test]
    async fn test_open_mic_resumes_after_whisper() {
        let f = fixture().await;
        f.transport.set_mic_enabled(true).await.unwrap();

        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();
        f.whisper.stop_whisper().await.unwrap();

        let mic = f.transport.mic_state();
        assert!(mic.enabled);
        assert!(!mic.ptt_active);
        assert!(f.media.is_track_enabled());
        assert_eq!(f.media.bound_buses(), vec![Bus::Net("SQUAD".into())]);
    }

    #[tokio::test]
    async fn test_abandon_after_session_loss() {
        let mut f = fixture().await;
        f.whisper.start_whisper(user("u7"), "Hawk").await.unwrap();
        f.transport.disconnect().await.unwrap();
        while f.notices.try_recv().is_ok() {}
        f.media.clear_calls();

        assert_eq!(f.router.detach().await, Some(user("u7")));
        let ended = f.whisper.abandon().await.unwrap();

        assert!(!ended.active);
        assert!(f.whisper.active().await.is_none());
        assert_eq!(f.router.whisper_target().await, None);
        assert_eq!(f.router.transmit_net().await, Some(NetId::from("SQUAD")));
        assert!(f.media.calls().is_empty());
        assert!(matches!(
            f.notices.try_recv().unwrap(),
            SessionNotice::WhisperEnded { restored_net_id: Some(_), .. }
        ));
        assert_eq!(f.whisper.abandon().await, None);
    }

    #[tokio::test]
    async fn test_failed_mic_rolls_back_routing() {
        let f = fixture().await;
        f.media.fail_next(FailOp::Track, 1);

        assert!(f.whisper.start_whisper(user("u7"), "Hawk").await.is_err());
        assert!(f.whisper.active().await.is_none());
        assert_eq!(f.media.bound_buses(), vec![Bus::Net("SQUAD".into())]);
        assert_eq!(f.router.whisper_target().await, None);
    }
}
