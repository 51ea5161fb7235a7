//! Web server setup and lifecycle

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use super::{handlers, websocket};
use crate::config::UiConfig;
use crate::session::VoiceSession;

/// Shared state for every handler
pub struct AppState {
    pub session: Arc<VoiceSession>,
    pub started: Instant,
}

/// HTTP + WebSocket control surface for one voice session
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, session: Arc<VoiceSession>) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                session,
                started: Instant::now(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/status", get(handlers::get_status))
            .route("/devices", get(handlers::get_devices))
            .route("/nets", get(handlers::get_nets))
            .route("/participants", get(handlers::get_participants))
            .route("/connect", post(handlers::connect))
            .route("/disconnect", post(handlers::disconnect))
            .route("/submix", post(handlers::configure_submix))
            .route("/ptt/:net/press", post(handlers::ptt_press))
            .route("/ptt/:net/release", post(handlers::ptt_release))
            .route("/mic", post(handlers::set_mic))
            .route("/device", post(handlers::set_device))
            .route("/whisper/start", post(handlers::start_whisper))
            .route("/whisper/stop", post(handlers::stop_whisper))
            .route("/override", post(handlers::trigger_override));

        let mut app = Router::new()
            .nest("/api", api)
            .route("/ws", get(websocket::ws_handler));

        if let Some(dir) = &self.config.static_dir {
            app = app.fallback_service(ServeDir::new(dir));
        }

        app.layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    fn addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        Ok(addr.parse()?)
    }

    /// Serve until the listener fails
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Control surface listening on http://{}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Bind now and serve on a background task
    pub async fn start_background(self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.addr()?).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        tracing::info!("Control surface listening on http://{}", addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Control surface stopped: {}", e);
            }
        });
        Ok((addr, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{ConnectionState, Discipline, Operator, VoiceNet};
    use crate::transport::LoopbackSession;
    use crate::ui::handlers::ApiResponse;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn app() -> Router {
        let mut config = AppConfig::default();
        config.operator = Operator::new("u1", "Raven");
        config.nets = vec![
            VoiceNet::new("ALPHA", "Alpha", Discipline::Open),
            VoiceNet::new("COMMAND", "Command", Discipline::CommandOnly),
        ];
        let session = Arc::new(VoiceSession::new(Arc::new(LoopbackSession::new()), &config));
        WebServer::new(config.ui.clone(), session).router()
    }

    async fn call<T: DeserializeOwned>(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, ApiResponse<T>) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&json).unwrap()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn connect(app: &Router) {
        let (status, body): (_, ApiResponse<ConnectionState>) = call(
            app,
            "POST",
            "/api/connect",
            Some(serde_json::json!({ "sessionToken": "tok", "netId": "ALPHA" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data, Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_status_before_connect() {
        let app = app();
        let (status, body): (_, ApiResponse<serde_json::Value>) =
            call(&app, "GET", "/api/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let data = body.data.unwrap();
        assert_eq!(data["state"], "IDLE");
        assert_eq!(data["transmitStatus"]["status"], "disconnected");
        assert!(data["uptimeSeconds"].is_u64());
    }

    #[tokio::test]
    async fn test_nets_listed() {
        let app = app();
        let (_, body): (_, ApiResponse<Vec<VoiceNet>>) =
            call(&app, "GET", "/api/nets", None).await;
        let codes: Vec<String> = body
            .data
            .unwrap()
            .into_iter()
            .map(|n| n.code.to_string())
            .collect();
        assert_eq!(codes.len(), 2);
        assert!(codes.contains(&"ALPHA".to_string()));
    }

    #[tokio::test]
    async fn test_press_and_release_over_http() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) =
            call(&app, "POST", "/api/ptt/ALPHA/press", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap()["result"], "transmitting");

        let (_, body): (_, ApiResponse<serde_json::Value>) =
            call(&app, "GET", "/api/status", None).await;
        assert_eq!(body.data.unwrap()["mic"]["pttActive"], true);

        let (_, body): (_, ApiResponse<serde_json::Value>) =
            call(&app, "POST", "/api/ptt/ALPHA/release", None).await;
        assert_eq!(body.data.unwrap()["result"], "released");
    }

    #[tokio::test]
    async fn test_command_net_submix_forbidden() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/submix",
            Some(serde_json::json!({ "tx": "COMMAND", "monitor": [] })),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.success);
        assert_eq!(body.data.unwrap()["status"], "rejected");
    }

    #[tokio::test]
    async fn test_submix_applied() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/submix",
            Some(serde_json::json!({ "tx": "ALPHA", "monitor": ["COMMAND"] })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["status"], "applied");
        assert_eq!(data["snapshot"]["transmitNetId"], "ALPHA");
    }

    #[tokio::test]
    async fn test_mic_refused_without_tx_net() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/mic",
            Some(serde_json::json!({ "enabled": true })),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.data.unwrap()["result"], "refused");
    }

    #[tokio::test]
    async fn test_mic_off_always_applies() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/mic",
            Some(serde_json::json!({ "enabled": false })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["result"], "applied");
        assert_eq!(data["enabled"], false);
    }

    #[tokio::test]
    async fn test_output_device_rejected() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/device",
            Some(serde_json::json!({ "deviceId": "output:Speakers" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.unwrap().contains("not a capture device"));
    }

    #[tokio::test]
    async fn test_whisper_requires_connection() {
        let app = app();

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/whisper/start",
            Some(serde_json::json!({ "target": { "scope": "user", "id": "u7" } })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_override_rejected_for_non_command() {
        let app = app();
        connect(&app).await;
        let _: (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/submix",
            Some(serde_json::json!({ "tx": "ALPHA" })),
        )
        .await;

        let (status, body): (_, ApiResponse<serde_json::Value>) = call(
            &app,
            "POST",
            "/api/override",
            Some(serde_json::json!({ "message": "Break", "priority": "CRITICAL" })),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.data.unwrap()["reason"], "not-command-staff");
    }

    #[tokio::test]
    async fn test_disconnect_returns_idle() {
        let app = app();
        connect(&app).await;

        let (status, body): (_, ApiResponse<ConnectionState>) =
            call(&app, "POST", "/api/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data, Some(ConnectionState::Idle));
    }
}
