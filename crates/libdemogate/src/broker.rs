use std::sync::Arc;

use anyhow::{Context, Result};
use demogate_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::clients::{ClientRegistry, ClientState};
use crate::config::Config;
use crate::error::BrokerError;
use crate::invites::InviteStore;
use crate::kv::Kv;
use crate::queue::QueueManager;
use crate::rate_limit::RateLimits;
use crate::supervisor::Slot;
use crate::tokens::TokenMap;
use crate::{credentials, supervisor};

/// The broker ties the gateway-facing components together.
///
/// Ownership follows the component boundaries: the supervisor slot owns
/// the active session and its timers, the queue manager owns ordering,
/// the invite store owns invite documents, and the registry owns
/// connection handles. Everything addresses clients by id, so a
/// departed client degrades to a skipped emit.
pub struct Broker {
    pub cfg: Config,
    pub kv: Kv,
    pub clients: ClientRegistry,
    pub queue: QueueManager,
    pub invites: InviteStore,
    pub tokens: TokenMap,
    pub limits: RateLimits,
    pub(crate) slot: Mutex<Slot>,
    /// Set during operator shutdown so teardown stops promoting.
    pub(crate) shutting_down: std::sync::atomic::AtomicBool,
    /// Data-reset failures carried into the next session's audit record.
    pub(crate) carryover_errors: std::sync::Mutex<Vec<String>>,
}

impl Broker {
    /// Connect to the KV store and assemble the broker. Fatal on weak
    /// secrets, an unwritable credential directory, or an unreachable
    /// store.
    pub async fn new(cfg: Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        credentials::ensure_writable(&cfg.credentials_dir)
            .context("credential directory check failed")?;
        let kv = Kv::connect(&cfg.kv_url).await?;
        Ok(Self::with_kv(cfg, kv))
    }

    /// Assemble around an existing KV handle. Used by tests with the
    /// in-memory backend.
    pub fn with_kv(cfg: Config, kv: Kv) -> Arc<Self> {
        let invites = InviteStore::new(
            kv.clone(),
            cfg.audit_retention(),
            cfg.rate_limits.invite_failures_per_hour,
        );
        Arc::new(Self {
            queue: QueueManager::new(cfg.max_queue_size, cfg.average_session_minutes),
            invites,
            tokens: TokenMap::new(),
            limits: RateLimits::new(&cfg.rate_limits),
            clients: ClientRegistry::new(),
            slot: Mutex::new(Slot::Idle),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            carryover_errors: std::sync::Mutex::new(Vec::new()),
            kv,
            cfg,
        })
    }

    /// Register a fresh gateway connection and push the status snapshot.
    pub async fn handle_connect(
        self: &Arc<Self>,
        client_id: &str,
        sender: mpsc::Sender<ServerMessage>,
        remote_addr: String,
        user_agent: String,
    ) {
        self.clients
            .register(client_id, sender, remote_addr, user_agent)
            .await;
        let status = ServerMessage::Status {
            queue_size: self.queue.len().await,
            session_active: self.session_active().await,
        };
        self.clients.send(client_id, status).await;
    }

    /// Route one inbound message.
    pub async fn handle_message(self: &Arc<Self>, client_id: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinQueue { invite_token } => {
                self.handle_join_queue(client_id, invite_token).await;
            }
            ClientMessage::LeaveQueue => self.handle_leave_queue(client_id).await,
            ClientMessage::Heartbeat => {
                self.clients.send(client_id, ServerMessage::HeartbeatAck).await;
            }
            ClientMessage::ResumeSession { session_token } => {
                self.resume_session(client_id, &session_token).await;
            }
            ClientMessage::EndSession => self.handle_end_request(client_id).await,
        }
    }

    /// Gateway close path: free the queue slot, let the supervisor
    /// decide about grace, and drop the connection record.
    pub async fn handle_disconnect(self: &Arc<Self>, client_id: &str) {
        if self.queue.remove_if_present(client_id).await {
            self.broadcast_positions().await;
        }
        self.tokens.remove_pending_for_client(client_id).await;
        self.client_connection_lost(client_id).await;
        self.clients.remove(client_id).await;
    }

    async fn handle_join_queue(self: &Arc<Self>, client_id: &str, invite_token: Option<String>) {
        match self.clients.state(client_id).await {
            Some(ClientState::Connected) => {}
            Some(ClientState::Queued) | Some(ClientState::Active) => {
                self.clients
                    .send(
                        client_id,
                        ServerMessage::Error {
                            message: "Already in queue".to_string(),
                        },
                    )
                    .await;
                return;
            }
            _ => return,
        }

        let validated_invite = if self.cfg.require_invite || invite_token.is_some() {
            let (remote_addr, _) = match self.clients.meta(client_id).await {
                Some(meta) => meta,
                None => return,
            };
            match self
                .invites
                .validate(invite_token.as_deref(), &remote_addr)
                .await
            {
                Ok(record) => Some(record.token),
                Err(reason) => {
                    self.clients
                        .send(
                            client_id,
                            ServerMessage::InviteInvalid {
                                reason,
                                message: reason.message().to_string(),
                            },
                        )
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        // Admission: an idle slot with an empty queue promotes the
        // caller directly; it never touches the queue.
        if self.queue.is_empty().await && !self.session_active().await {
            self.clients
                .mark_queued(client_id, demogate_protocol::now_ms(), validated_invite.clone())
                .await;
            match supervisor::promote(self, client_id, 0).await {
                Ok(()) => return,
                Err(BrokerError::SlotBusy) => {
                    // Lost the race; fall through to the queue.
                    self.clients.clear_queued(client_id).await;
                }
                Err(err) => {
                    warn!(client_id, "direct promotion failed: {err}");
                    self.clients.clear_queued(client_id).await;
                    self.clients
                        .send(
                            client_id,
                            ServerMessage::Error {
                                message: "Failed to start your session; please retry".to_string(),
                            },
                        )
                        .await;
                    return;
                }
            }
        }

        match self.queue.enqueue(client_id).await {
            Ok(_) => {
                self.clients
                    .mark_queued(client_id, demogate_protocol::now_ms(), validated_invite)
                    .await;
                info!(client_id, "client queued");
                self.broadcast_positions().await;
            }
            Err(BrokerError::QueueFull { cap }) => {
                self.clients
                    .send(
                        client_id,
                        ServerMessage::QueueFull {
                            message: format!(
                                "The waitlist is full ({cap} people); please try again later"
                            ),
                        },
                    )
                    .await;
            }
            Err(_) => {
                self.clients
                    .send(
                        client_id,
                        ServerMessage::Error {
                            message: "Already in queue".to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn handle_leave_queue(self: &Arc<Self>, client_id: &str) {
        if !self.queue.leave(client_id).await {
            // Not queued: silent no-op, no anomalies for anyone else.
            return;
        }
        self.clients.clear_queued(client_id).await;
        self.clients.send(client_id, ServerMessage::LeftQueue).await;
        self.broadcast_positions().await;
    }

    async fn handle_end_request(self: &Arc<Self>, client_id: &str) {
        if let Some(session_id) = self.session_owned_by(client_id).await {
            self.end_session(demogate_protocol::EndReason::UserEnded, Some(&session_id))
                .await;
        }
    }

    /// Emit fresh 1-based positions to every still-queued client.
    pub async fn broadcast_positions(self: &Arc<Self>) {
        for snapshot in self.queue.positions().await {
            self.clients
                .send(
                    &snapshot.client_id,
                    ServerMessage::QueuePosition {
                        position: snapshot.position,
                        estimated_wait: snapshot.estimated_wait,
                        queue_size: snapshot.queue_size,
                    },
                )
                .await;
        }
    }

    /// Snapshot for the `status` message and the landing page.
    pub async fn status_snapshot(&self) -> (usize, bool) {
        (self.queue.len().await, self.session_active().await)
    }

    pub async fn session_active(&self) -> bool {
        !matches!(*self.slot.lock().await, Slot::Idle)
    }
}
