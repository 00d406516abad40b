use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{ClientEvent, ConnectionId, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

use crate::auth::verifier_from_config;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::presence::ConnHandle;
use crate::rate_limit::{CheckResult, TokenBucket};
use crate::relay::{HealthReport, Relay, render_error};
use crate::store::SqliteStore;

/// How long the write task may keep flushing after the connection ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Open the store and verifier named by `config` and assemble a relay.
pub fn build_relay(config: RelayConfig) -> Result<Arc<Relay>> {
    let store = SqliteStore::open(config.store_path.as_deref()).context("failed to open store")?;
    let verifier = verifier_from_config(&config.auth)?;
    Ok(Relay::new(config, Arc::new(store), verifier))
}

pub fn router(relay: Arc<Relay>) -> Result<Router> {
    let cors = build_cors(&relay.config.allow_origins)?;
    Ok(Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(relay))
}

/// Run the relay until ctrl-c.
pub async fn serve(config: RelayConfig) -> Result<()> {
    let listen = config.listen;
    let relay = build_relay(config)?;
    let sweeper = relay.start_background();
    let app = router(relay)?;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind relay listener on {listen}"))?;
    tracing::info!("parley-relay listening on ws://{listen}/ws");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    sweeper.abort();
    Ok(())
}

/// Start a relay on an ephemeral port (used by tests).
pub async fn spawn_relay(
    config: RelayConfig,
) -> Result<(SocketAddr, Arc<Relay>, oneshot::Sender<()>)> {
    let relay = build_relay(config)?;
    let (addr, shutdown_tx) = spawn_relay_with(relay.clone()).await?;
    Ok((addr, relay, shutdown_tx))
}

/// Serve an already-assembled relay on an ephemeral port.
pub async fn spawn_relay_with(relay: Arc<Relay>) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind relay")?;
    let local_addr = listener.local_addr()?;
    let sweeper = relay.start_background();
    let app = router(relay)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
        sweeper.abort();
    });

    Ok((local_addr, shutdown_tx))
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

async fn healthz(State(relay): State<Arc<Relay>>) -> Json<HealthReport> {
    Json(relay.health())
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    let max_frame = relay.config.ws.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Drive one client connection.
///
/// A central write task owns the sink; everything addressed to this
/// connection goes through its bounded queue. The read loop admits the
/// connection from the first frame and then dispatches events to the hub.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(relay.config.ws.outbound_queue);
    let conn_id = relay.next_connection_id();

    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(conn = conn_id, "failed to encode event: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    match await_admission(&relay, conn_id, &mut ws_receiver, tx.clone()).await {
        Ok(handle) => {
            drop(tx);
            read_loop(&relay, &handle, &mut ws_receiver).await;
        }
        Err(reply) => {
            if let Some(event) = reply {
                let _ = tx.try_send(event);
            }
            drop(tx);
        }
    }

    relay.disconnect(conn_id);
    if tokio::time::timeout(WRITER_DRAIN, &mut write_task)
        .await
        .is_err()
    {
        debug!(conn = conn_id, "write task did not drain in time");
        write_task.abort();
    }
}

/// Wait for the `admit` frame. `Err(Some(event))` is the refusal to send
/// before closing; `Err(None)` means the peer went away.
async fn await_admission(
    relay: &Relay,
    conn_id: ConnectionId,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<ConnHandle, Option<ServerEvent>> {
    let deadline = tokio::time::Instant::now() + relay.config.ws.admit_timeout();
    loop {
        let msg = match tokio::time::timeout_at(deadline, ws_receiver.next()).await {
            Err(_) => {
                debug!(conn = conn_id, "admission timed out");
                return Err(Some(render_error(&RelayError::NotAdmitted)));
            }
            Ok(None) | Ok(Some(Err(_))) => return Err(None),
            Ok(Some(Ok(msg))) => msg,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return Err(None),
            Message::Binary(_) => {
                return Err(Some(render_error(&RelayError::InvalidRequest(
                    "binary frames are not supported".to_string(),
                ))));
            }
            _ => continue,
        };
        return match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(ClientEvent::Admit { token }) => {
                relay.admit(conn_id, &token, tx).await.map_err(|e| {
                    debug!(conn = conn_id, "admission refused: {e}");
                    Some(render_error(&e))
                })
            }
            Ok(_) => Err(Some(render_error(&RelayError::NotAdmitted))),
            Err(e) => Err(Some(render_error(&RelayError::InvalidRequest(format!(
                "invalid event: {e}"
            ))))),
        };
    }
}

async fn read_loop(relay: &Relay, handle: &ConnHandle, ws_receiver: &mut SplitStream<WebSocket>) {
    let mut bucket = TokenBucket::new(relay.config.ws.rate_burst, relay.config.ws.rate_per_sec);

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = handle.id, "ws read error: {e}");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) => {
                handle.deliver(render_error(&RelayError::InvalidRequest(
                    "binary frames are not supported".to_string(),
                )));
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match bucket.check() {
            CheckResult::Allowed => {}
            CheckResult::Limited => {
                handle.deliver(render_error(&RelayError::RateLimited));
                continue;
            }
            CheckResult::Abusive => {
                warn!(conn = handle.id, identity = %handle.identity, "closing abusive connection");
                break;
            }
        }

        let event: ClientEvent = match serde_json::from_str(text.as_str()) {
            Ok(e) => e,
            Err(e) => {
                handle.deliver(render_error(&RelayError::InvalidRequest(format!(
                    "invalid event: {e}"
                ))));
                continue;
            }
        };
        let logout = matches!(event, ClientEvent::Logout);

        if let Err(e) = relay.handle(handle, event).await {
            debug!(conn = handle.id, identity = %handle.identity, "event rejected: {e}");
            handle.deliver(render_error(&e));
        }
        if logout {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cors_accepts_wildcard() {
        assert!(build_cors(&["*".to_string()]).is_ok());
    }

    #[test]
    fn build_cors_rejects_garbage_origin() {
        assert!(build_cors(&["http://bad\norigin".to_string()]).is_err());
    }

    #[tokio::test]
    async fn router_builds_from_default_config() {
        let mut config = RelayConfig::default();
        config
            .auth
            .static_tokens
            .insert("tok".to_string(), "alice".to_string());
        let relay = build_relay(config).unwrap();
        assert!(router(relay).is_ok());
    }
}
