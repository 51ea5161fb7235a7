//! WebSocket notice stream
//!
//! Each socket receives every `SessionNotice` as a JSON text frame. The
//! client may send PTT input back over the same socket, which avoids an HTTP
//! round trip per key edge.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

use crate::control::{InputEvent, PttOutcome};
use crate::protocol::NetId;
use crate::session::VoiceSession;
use crate::ui::server::AppState;

/// PTT input sent by the client
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsInput {
    pub net_id: NetId,
    pub input: InputEvent,
}

/// The PTT hold opened through one socket. A socket that goes away can
/// never deliver its release, so closing it counts as one.
#[derive(Debug, Default)]
struct SocketHold {
    net: Option<NetId>,
}

impl SocketHold {
    async fn apply(&mut self, session: &VoiceSession, msg: WsInput) {
        let WsInput { net_id, input } = msg;
        match session.handle_input(&net_id, &input).await {
            Ok(PttOutcome::Transmitting) => self.net = Some(net_id),
            Ok(PttOutcome::Released) if self.net.as_ref() == Some(&net_id) => self.net = None,
            Ok(_) => {}
            Err(e) => tracing::warn!("PTT input on {} failed: {}", net_id, e),
        }
    }

    async fn release(&mut self, session: &VoiceSession) {
        let Some(net) = self.net.take() else {
            return;
        };
        tracing::info!("Socket closed while holding PTT on {}; releasing", net);
        if let Err(e) = session.release(&net).await {
            tracing::warn!("PTT release on {} failed: {}", net, e);
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut notices = state.session.subscribe_notices();
    tracing::debug!("Notice stream opened");

    let mut send_task = tokio::spawn(async move {
        loop {
            let notice = match notices.recv().await {
                Ok(notice) => notice,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notice stream lagged, {} notices dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&notice) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode notice: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let hold = Arc::new(Mutex::new(SocketHold::default()));
    let session = state.session.clone();
    let input_hold = hold.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<WsInput>(&text) {
                    Ok(msg) => input_hold.lock().await.apply(&session, msg).await,
                    Err(e) => tracing::debug!("Ignoring malformed socket message: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    hold.lock().await.release(&state.session).await;
    tracing::debug!("Notice stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{Discipline, Operator, VoiceNet};
    use crate::session::ConnectParams;
    use crate::transport::LoopbackSession;

    async fn session() -> (Arc<LoopbackSession>, VoiceSession) {
        let mut config = AppConfig::default();
        config.operator = Operator::new("u1", "Raven");
        config.nets = vec![
            VoiceNet::new("ALPHA", "Alpha", Discipline::Open),
            VoiceNet::new("BRAVO", "Bravo", Discipline::Open),
        ];
        let media = Arc::new(LoopbackSession::new());
        let session = VoiceSession::new(media.clone(), &config);
        session
            .connect(ConnectParams {
                session_token: "tok".to_string(),
                net_id: "ALPHA".into(),
                endpoint_url: None,
            })
            .await
            .unwrap();
        (media, session)
    }

    fn key(net: &str, input: InputEvent) -> WsInput {
        WsInput {
            net_id: NetId::from(net),
            input,
        }
    }

    #[tokio::test]
    async fn test_closed_socket_releases_held_key() {
        let (media, session) = session().await;
        let mut hold = SocketHold::default();

        hold.apply(&session, key("ALPHA", InputEvent::KeyDown("Space".to_string())))
            .await;
        assert!(session.mic_state().ptt_active);
        assert!(media.is_track_enabled());

        hold.release(&session).await;

        assert!(!session.mic_state().ptt_active);
        assert!(!media.is_track_enabled());
        assert_eq!(hold.net, None);
    }

    #[tokio::test]
    async fn test_released_key_leaves_nothing_to_release() {
        let (media, session) = session().await;
        let mut hold = SocketHold::default();

        hold.apply(&session, key("ALPHA", InputEvent::KeyDown("Space".to_string())))
            .await;
        hold.apply(&session, key("ALPHA", InputEvent::KeyUp("Space".to_string())))
            .await;
        assert_eq!(hold.net, None);

        // a hold taken over HTTP is not this socket's to release
        session.press(&NetId::from("BRAVO")).await.unwrap();
        hold.release(&session).await;
        assert!(session.mic_state().ptt_active);
        assert!(media.is_track_enabled());
    }

    #[test]
    fn test_parse_key_input() {
        let msg: WsInput =
            serde_json::from_str(r#"{"netId":"ALPHA","input":{"type":"key-down","key":"Space"}}"#)
                .unwrap();
        assert_eq!(msg.net_id, NetId::from("ALPHA"));
        assert_eq!(msg.input, InputEvent::KeyDown("Space".to_string()));
    }

    #[test]
    fn test_parse_pointer_input() {
        let msg: WsInput =
            serde_json::from_str(r#"{"netId":"BRAVO","input":{"type":"pointer-leave"}}"#).unwrap();
        assert_eq!(msg.input, InputEvent::PointerLeave);
    }
}
