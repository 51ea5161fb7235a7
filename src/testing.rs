//! Shared fixtures for unit tests

use std::sync::Arc;

use crate::connection::ReconnectPolicy;
use crate::protocol::NetId;
use crate::transport::{JoinRequest, LoopbackSession, SessionUser, TransportAdapter};

pub fn join_request(net: &str) -> JoinRequest {
    JoinRequest {
        session_token: "test-token".to_string(),
        endpoint_url: "wss://sfu.test".to_string(),
        net_id: NetId::from(net),
        user: SessionUser {
            user_id: "u1".to_string(),
            callsign: "Raven".to_string(),
        },
    }
}

/// Adapter over a loopback session, already connected to ALPHA
pub async fn connected_adapter() -> (Arc<LoopbackSession>, TransportAdapter) {
    let media = Arc::new(LoopbackSession::new());
    let adapter = TransportAdapter::new(media.clone(), ReconnectPolicy::default());
    adapter
        .connect(join_request("ALPHA"))
        .await
        .expect("loopback connect");
    (media, adapter)
}
