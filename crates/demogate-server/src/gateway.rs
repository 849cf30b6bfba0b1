use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use demogate_protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use libdemogate::{Allow, Broker};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Remote address for rate limiting and token binding: first token of
/// `x-forwarded-for` when the reverse proxy set it, else the socket peer.
pub fn remote_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// WebSocket upgrade handler; new connections are rate-limited per
/// address before the upgrade completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
) -> Response {
    let addr = remote_addr(&headers, peer);
    let allow = broker
        .limits
        .connections
        .lock()
        .expect("limiter poisoned")
        .allow(&addr);
    if let Allow::Limited { retry_after } = allow {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
            "too many connections",
        )
            .into_response();
    }

    let agent = user_agent(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, addr, agent))
}

/// One task reads, one task writes; the broker only ever sees the mpsc
/// sender, so per-client emission order is the channel order.
async fn handle_socket(socket: WebSocket, broker: Arc<Broker>, addr: String, agent: String) {
    let client_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    debug!("failed to encode outbound message: {err}");
                    continue;
                }
            };
            if ws_sender.send(Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    broker.handle_connect(&client_id, tx, addr, agent).await;

    loop {
        let frame = tokio::time::timeout(broker.cfg.idle_timeout(), ws_receiver.next()).await;
        let msg = match frame {
            Err(_) => {
                debug!(client_id = %client_id, "closing idle connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(client_id = %client_id, "ws read error: {err}");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(inbound) => broker.handle_message(&client_id, inbound).await,
                Err(err) => {
                    // Malformed input never disconnects.
                    broker
                        .clients
                        .send(
                            &client_id,
                            ServerMessage::Error {
                                message: format!("invalid message: {err}"),
                            },
                        )
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    broker.handle_disconnect(&client_id).await;
    // The registry held the last sender; the write task drains and exits.
    let _ = write_task.await;
    debug!(client_id = %client_id, "connection closed");
}
