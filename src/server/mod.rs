//! WebSocket server for the stackchan firmware
//!
//! Routes:
//! - `GET  /health`        — liveness probe
//! - `GET  /ws/stackchan`  — the firmware session socket (binary framing protocol)
//! - `POST /api/v1/audio`  — legacy HTTP audio upload (pcm16le / μ-law)

pub mod app;
pub mod legacy;
pub mod protocol;
pub mod ws_proxy;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::voice::{CloudSpeechClient, SpeechToText, TextToSpeech, VoicevoxClient};
use app::StackchanApp;
use ws_proxy::WsProxy;

/// Capacity of the per-session downlink queue.
const OUTBOUND_QUEUE: usize = 64;

/// Shared server state. Providers are constructed once at startup and
/// shared across sessions.
#[derive(Clone)]
pub struct ServerState {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub recordings_dir: PathBuf,
    app: StackchanApp,
}

/// Start the server with the registered application handlers.
pub async fn start(
    app: StackchanApp,
    host: &str,
    port: u16,
    https: bool,
    cert: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let config = Config::load()?;

    let recordings_dir = config.recordings.dir.clone();
    std::fs::create_dir_all(&recordings_dir)
        .with_context(|| format!("failed to create recordings dir {:?}", recordings_dir))?;

    let state = ServerState {
        stt: Arc::new(CloudSpeechClient::from_config(&config.stt)?),
        tts: Arc::new(VoicevoxClient::from_config(&config.tts)),
        recordings_dir,
        app,
    };

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/ws/stackchan", get(websocket_handler))
        .route("/api/v1/audio", post(legacy::receive_audio))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("listening on http{}://{}", if https { "s" } else { "" }, addr);

    if https {
        if let (Some(cert_path), Some(key_path)) = (cert, key) {
            let cert_data = tokio::fs::read(&cert_path)
                .await
                .context("Failed to read certificate file")?;
            let key_data = tokio::fs::read(&key_path)
                .await
                .context("Failed to read key file")?;

            let tls = axum_server::tls_rustls::RustlsConfig::from_pem(cert_data, key_data).await?;
            axum_server::bind_rustls(addr, tls)
                .serve(router.into_make_service())
                .await?;
            return Ok(());
        }
        anyhow::bail!("--https requires both --cert and --key");
    }

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

/// Wire one accepted socket into a session: sender task for the downlink
/// queue, receive task for inbound frames, orchestrator in between.
async fn handle_session(socket: WebSocket, state: ServerState) {
    info!("stackchan client connected");

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let sender_task = tokio::spawn(ws_proxy::run_sender(out_rx, sink));

    let proxy = WsProxy::new(
        out_tx,
        state.stt.clone(),
        state.tts.clone(),
        state.recordings_dir.clone(),
    );
    proxy.spawn_receive(stream);

    app::run_session(&state.app, proxy).await;

    sender_task.abort();
    info!("stackchan client disconnected");
}
