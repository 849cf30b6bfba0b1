use std::collections::HashMap;

use demogate_protocol::{ClientId, ServerMessage};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Connection-level lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Queued,
    Active,
    DisconnectedGrace,
}

/// Per-connection record owned by the gateway.
pub struct ClientHandle {
    sender: mpsc::Sender<ServerMessage>,
    pub remote_addr: String,
    pub user_agent: String,
    pub state: ClientState,
    pub enqueued_at_ms: Option<u64>,
    /// Invite the client presented on `join_queue`, carried to consume.
    pub invite_token: Option<String>,
}

/// Registry of live gateway connections.
///
/// The supervisor and queue manager address clients by id only; a
/// departed client produces a lookup miss here, which every emitter
/// treats as "skip".
pub struct ClientRegistry {
    inner: RwLock<HashMap<ClientId, ClientHandle>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        client_id: &str,
        sender: mpsc::Sender<ServerMessage>,
        remote_addr: String,
        user_agent: String,
    ) {
        self.inner.write().await.insert(
            client_id.to_string(),
            ClientHandle {
                sender,
                remote_addr,
                user_agent,
                state: ClientState::Connected,
                enqueued_at_ms: None,
                invite_token: None,
            },
        );
    }

    pub async fn remove(&self, client_id: &str) {
        self.inner.write().await.remove(client_id);
    }

    /// Deliver a message to a client. A missing or closed connection is
    /// not an error.
    pub async fn send(&self, client_id: &str, msg: ServerMessage) {
        let sender = {
            let inner = self.inner.read().await;
            match inner.get(client_id) {
                Some(handle) => handle.sender.clone(),
                None => {
                    debug!(client_id, "skipping emit to departed client");
                    return;
                }
            }
        };
        if sender.send(msg).await.is_err() {
            debug!(client_id, "skipping emit to closed connection");
        }
    }

    pub async fn state(&self, client_id: &str) -> Option<ClientState> {
        self.inner.read().await.get(client_id).map(|h| h.state)
    }

    pub async fn set_state(&self, client_id: &str, state: ClientState) {
        if let Some(handle) = self.inner.write().await.get_mut(client_id) {
            handle.state = state;
        }
    }

    pub async fn mark_queued(&self, client_id: &str, enqueued_at_ms: u64, invite: Option<String>) {
        if let Some(handle) = self.inner.write().await.get_mut(client_id) {
            handle.state = ClientState::Queued;
            handle.enqueued_at_ms = Some(enqueued_at_ms);
            handle.invite_token = invite;
        }
    }

    pub async fn clear_queued(&self, client_id: &str) {
        if let Some(handle) = self.inner.write().await.get_mut(client_id) {
            handle.state = ClientState::Connected;
            handle.enqueued_at_ms = None;
            handle.invite_token = None;
        }
    }

    /// Remote address and user agent snapshot for audit records.
    pub async fn meta(&self, client_id: &str) -> Option<(String, String)> {
        self.inner
            .read()
            .await
            .get(client_id)
            .map(|h| (h.remote_addr.clone(), h.user_agent.clone()))
    }

    pub async fn invite_token(&self, client_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(client_id)
            .and_then(|h| h.invite_token.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
