//! HTTP listener: observer WebSocket plus operator endpoints.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use modlink_common::Format;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::publisher::Publisher;
use crate::status::BridgeStatus;
use crate::store::{RegisterStore, Snapshot};
use crate::supervisor::SupervisorHandle;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: RegisterStore,
    pub publisher: Publisher,
    pub supervisor: SupervisorHandle,
    pub format: Format,
}

/// Create the HTTP router.
pub fn create_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/reconnect", post(reconnect_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Upgrade to the observer channel.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| observe(socket, state))
}

/// Push snapshots to one observer until either side goes away.
async fn observe(socket: WebSocket, state: AppState) {
    let Some(mut subscription) = state.publisher.subscribe() else {
        debug!("Publisher closed, rejecting observer");
        return;
    };
    let id = subscription.id;
    info!(observer = id, "Observer connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            snapshot = subscription.receiver.recv() => {
                let Some(snapshot) = snapshot else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let frame = match encode_frame(&snapshot, state.format) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(observer = id, error = %e, "Failed to encode snapshot");
                        continue;
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(observer = id, error = %e, "Observer socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.publisher.unsubscribe(id);
    info!(observer = id, "Observer disconnected");
}

/// Encode a snapshot as one WebSocket frame.
pub fn encode_frame(snapshot: &Snapshot, format: Format) -> modlink_common::Result<Message> {
    match format {
        Format::Json => Ok(Message::Text(serde_json::to_string(snapshot.registers())?)),
        Format::Cbor => Ok(Message::Binary(modlink_common::encode(
            snapshot.registers(),
            format,
        )?)),
    }
}

/// Handler for the /snapshot endpoint.
async fn snapshot_handler(State(state): State<AppState>) -> Response {
    Json(state.store.snapshot().registers().to_vec()).into_response()
}

/// Handler for the /status endpoint.
async fn status_handler(State(state): State<AppState>) -> Response {
    Json(BridgeStatus::collect(
        &state.supervisor,
        &state.store,
        &state.publisher,
    ))
    .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /reconnect endpoint.
async fn reconnect_handler(State(state): State<AppState>) -> Response {
    if state.supervisor.rearm() {
        (StatusCode::ACCEPTED, "reconnecting\n").into_response()
    } else {
        (
            StatusCode::CONFLICT,
            "reconnection is only possible after retries are exhausted\n",
        )
            .into_response()
    }
}

/// Bound HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Bind the listener.
    pub async fn bind(state: AppState, listen_addr: SocketAddr, ws_path: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;

        Ok(Self {
            listener,
            router: create_router(state, ws_path),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "HTTP server listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                // Wait for shutdown signal
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
