use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    handler::HandlerWithoutStateExt,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use futures_util::StreamExt;
use lib_telemetry::{BroadcastHub, ChannelClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
struct DownstreamState {
    hub: Arc<BroadcastHub>,
    static_dir: PathBuf,
}

/// `/` upgrades WebSocket requests and serves the dashboard page otherwise.
/// Files under `static_dir` are served as-is; any other path redirects to `/`.
pub fn router(hub: Arc<BroadcastHub>, static_dir: PathBuf) -> Router {
    let files = ServeDir::new(&static_dir).fallback(redirect_home.into_service());
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(files)
        .with_state(DownstreamState { hub, static_dir })
}

pub async fn run(port: u16, hub: Arc<BroadcastHub>, static_dir: PathBuf, shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {} (static files from {})", addr, static_dir.display());
    serve(listener, hub, static_dir, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    static_dir: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    axum::serve(listener, router(hub, static_dir))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn root_handler(
    State(state): State<DownstreamState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state.hub)),
        Err(_) => match tokio::fs::read_to_string(state.static_dir.join("index.html")).await {
            Ok(page) => Html(page).into_response(),
            Err(e) => {
                log::debug!("No dashboard page in {}: {}", state.static_dir.display(), e);
                (StatusCode::NOT_FOUND, "Not Found").into_response()
            }
        },
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DownstreamState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn redirect_home() -> Redirect {
    Redirect::to("/")
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<BroadcastHub>) {
    let client_id = format!("client-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let (client, mut payloads) = ChannelClient::new(client_id.clone());
    hub.register(Arc::new(client));
    log::info!("Client {} connected", client_id);

    loop {
        tokio::select! {
            // Inbound traffic carries no meaning; only watch for the end of the socket
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some(payload) = payloads.recv() => {
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break; // client disconnected
                }
            }
        }
    }

    drop(payloads);
    hub.unregister(&client_id);
    log::info!("Client {} disconnected", client_id);
}
