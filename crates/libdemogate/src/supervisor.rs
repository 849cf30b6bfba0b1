use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use demogate_protocol::{
    ClientId, EndReason, ResumeHint, ServerMessage, SessionId, SessionUsage, now_ms,
};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::clients::ClientState;
use crate::config::{Config, HARD_KILL_LEAD, WARNING_LEAD};
use crate::credentials::CredentialFile;
use crate::error::BrokerError;
use crate::tokens::{constant_time_eq, mint_session_token};

/// The global singleton slot. At most one session exists process-wide;
/// every state but Idle blocks promotion.
pub(crate) enum Slot {
    Idle,
    Starting,
    Active(Box<ActiveSession>),
    Ending,
}

/// The one live session. Owned exclusively by the supervisor; timers
/// and the credential file never outlive it.
pub(crate) struct ActiveSession {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub session_token: String,
    pub child_pid: Option<u32>,
    pub child_exited: Arc<AtomicBool>,
    /// Warning, soft-timeout, and hard-kill timers; aborted in one pass
    /// on Ending.
    pub timers: Vec<JoinHandle<()>>,
    pub grace_timer: Option<JoinHandle<()>>,
    /// Single-flight reconnect guard.
    pub rebinding: bool,
    pub disconnected: bool,
    pub warning_fired: bool,
    pub credentials: CredentialFile,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
    pub queue_wait_ms: u64,
    pub invite_token: Option<String>,
    pub remote_addr: String,
    pub user_agent: String,
    pub errors: Vec<String>,
}

fn resume_key(client_id: &str) -> String {
    format!("session:{client_id}")
}

/// Promote a client into the slot. Rejects unless the slot is Idle.
pub(crate) async fn promote(
    broker: &Arc<Broker>,
    client_id: &str,
    queue_wait_ms: u64,
) -> Result<(), BrokerError> {
    {
        let mut slot = broker.slot.lock().await;
        match *slot {
            Slot::Idle => *slot = Slot::Starting,
            _ => return Err(BrokerError::SlotBusy),
        }
    }

    match start_session(broker, client_id, queue_wait_ms).await {
        Ok(session) => {
            let session_id = session.session_id.clone();
            let session_token = session.session_token.clone();
            let child_exited = Arc::clone(&session.child_exited);
            let starting = ServerMessage::SessionStarting {
                terminal_url: broker.cfg.terminal.url.clone(),
                expires_at: session.deadline_ms,
                session_token: session_token.clone(),
            };
            *broker.slot.lock().await = Slot::Active(Box::new(session));
            broker.tokens.activate(&session_token, &session_id).await;
            broker
                .clients
                .set_state(client_id, ClientState::Active)
                .await;
            broker.clients.send(client_id, starting).await;
            info!(client_id, session_id = %session_id, "session started");

            // The child can exit before the slot reaches Active; the
            // exit watcher's signal would have no-opped against
            // Starting, so re-check here.
            if child_exited.load(Ordering::SeqCst) {
                broker
                    .end_session(EndReason::ContainerExit, Some(&session_id))
                    .await;
                return Ok(());
            }

            // The client can vanish between admission and Active; treat
            // it like a disconnect so the grace window applies.
            if broker.clients.state(client_id).await.is_none() {
                broker.client_connection_lost(client_id).await;
            }
            Ok(())
        }
        Err(err) => {
            *broker.slot.lock().await = Slot::Idle;
            error!(client_id, "session start failed: {err}");
            Err(err)
        }
    }
}

/// Steps 2-8 of the promotion protocol; on any error every side effect
/// made so far is rolled back before returning.
async fn start_session(
    broker: &Arc<Broker>,
    client_id: &str,
    queue_wait_ms: u64,
) -> Result<ActiveSession, BrokerError> {
    broker.queue.remove_if_present(client_id).await;

    let Some((remote_addr, user_agent)) = broker.clients.meta(client_id).await else {
        return Err(BrokerError::ClientGone(client_id.to_string()));
    };

    let session_id = Uuid::new_v4().to_string();
    let session_token = mint_session_token(broker.cfg.session_secret.as_bytes(), &session_id)
        .map_err(|err| BrokerError::Spawn(err.to_string()))?;

    let started_at_ms = now_ms();
    let deadline_ms = started_at_ms + broker.cfg.session_timeout().as_millis() as u64;

    // The previous session must have unlinked its file already; a
    // leftover here is an invariant violation.
    sweep_stale_credentials(&broker.cfg.credentials_dir);
    let mut credentials = CredentialFile::write(
        &broker.cfg.credentials_dir,
        &session_id,
        &broker.cfg.credentials,
    )
    .map_err(|err| BrokerError::Spawn(err.to_string()))?;

    broker
        .tokens
        .insert_pending(&session_token, client_id, &remote_addr)
        .await;

    let mut cmd = build_terminal_command(&broker.cfg, &session_id, credentials.path());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            credentials.remove();
            broker.tokens.remove(&session_token).await;
            return Err(BrokerError::Spawn(format!("terminal spawn failed: {err}")));
        }
    };
    let child_pid = child.id();
    let child_exited = Arc::new(AtomicBool::new(false));

    // Reap the child and fold its exit into the state machine. Not a
    // cancellable timer: it must survive Ending to avoid zombies.
    {
        let broker = Arc::clone(broker);
        let session_id = session_id.clone();
        let exited = Arc::clone(&child_exited);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(session_id = %session_id, %status, "terminal child exited"),
                Err(err) => warn!(session_id = %session_id, "terminal child wait failed: {err}"),
            }
            exited.store(true, Ordering::SeqCst);
            broker
                .end_session(EndReason::ContainerExit, Some(&session_id))
                .await;
        });
    }

    let timers = arm_timers(broker, &session_id, deadline_ms, child_pid, &child_exited);

    let mut errors = Vec::new();
    let hint = ResumeHint {
        session_id: session_id.clone(),
        client_id: client_id.to_string(),
        started_at_ms,
        deadline_ms,
        invite_token: broker.clients.invite_token(client_id).await,
        queue_wait_ms,
    };
    match serde_json::to_string(&hint) {
        Ok(json) => {
            if let Err(err) = broker
                .kv
                .set(
                    &resume_key(client_id),
                    &json,
                    Some(broker.cfg.session_timeout()),
                )
                .await
            {
                warn!("failed to write resume hint: {err}");
                errors.push(format!("resume hint write failed: {err}"));
            }
        }
        Err(err) => warn!("failed to serialize resume hint: {err}"),
    }

    Ok(ActiveSession {
        invite_token: hint.invite_token,
        session_id,
        client_id: client_id.to_string(),
        session_token,
        child_pid,
        child_exited,
        timers,
        grace_timer: None,
        rebinding: false,
        disconnected: false,
        warning_fired: false,
        credentials,
        started_at_ms,
        deadline_ms,
        queue_wait_ms,
        remote_addr,
        user_agent,
        errors,
    })
}

/// Warning, soft-timeout, and hard-kill timers for one session. Each is
/// a plain task handle the supervisor aborts on Ending.
fn arm_timers(
    broker: &Arc<Broker>,
    session_id: &str,
    deadline_ms: u64,
    child_pid: Option<u32>,
    child_exited: &Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let mut timers = Vec::with_capacity(3);

    let warn_in = Duration::from_millis(
        deadline_ms
            .saturating_sub(WARNING_LEAD.as_millis() as u64)
            .saturating_sub(now_ms()),
    );
    {
        let broker = Arc::clone(broker);
        let session_id = session_id.to_string();
        timers.push(tokio::spawn(async move {
            tokio::time::sleep(warn_in).await;
            broker.fire_session_warning(&session_id).await;
        }));
    }

    let expire_in = Duration::from_millis(deadline_ms.saturating_sub(now_ms()));
    {
        let broker = Arc::clone(broker);
        let session_id = session_id.to_string();
        timers.push(tokio::spawn(async move {
            tokio::time::sleep(expire_in).await;
            broker.end_session(EndReason::Timeout, Some(&session_id)).await;
        }));
    }

    // Defensive second layer: force-kill a child that outlives its
    // deadline by the full escalation lead.
    let kill_in = expire_in + HARD_KILL_LEAD;
    {
        let session_id = session_id.to_string();
        let exited = Arc::clone(child_exited);
        timers.push(tokio::spawn(async move {
            tokio::time::sleep(kill_in).await;
            if !exited.load(Ordering::SeqCst) {
                warn!(session_id = %session_id, "hard-kill timer firing on overdue terminal child");
                force_kill(child_pid);
            }
        }));
    }

    timers
}

impl Broker {
    /// Session id of the slot, when this client owns it.
    pub(crate) async fn session_owned_by(&self, client_id: &str) -> Option<SessionId> {
        match &*self.slot.lock().await {
            Slot::Active(session) if session.client_id == client_id => {
                Some(session.session_id.clone())
            }
            _ => None,
        }
    }

    /// Termination protocol. Re-entrant signals (timer vs child exit vs
    /// operator) collapse to the first caller; `expect` guards a stale
    /// timer from ending a later session.
    ///
    /// Written as a manually boxed future rather than `async fn`: this
    /// method and `promote`/`start_session` recurse into each other
    /// (`end_session` -> `promote_next` -> `promote` -> `end_session`),
    /// and rustc's Send auto-trait inference cannot resolve the opaque
    /// return types of mutually recursive async fns. Boxing gives this
    /// one a concrete, explicitly-Send type and breaks the cycle.
    pub fn end_session<'a>(
        self: &'a Arc<Self>,
        reason: EndReason,
        expect: Option<&'a str>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let mut session = {
            let mut slot = self.slot.lock().await;
            let matches = match &*slot {
                Slot::Active(session) => expect.is_none_or(|id| id == session.session_id),
                _ => false,
            };
            if !matches {
                return;
            }
            match std::mem::replace(&mut *slot, Slot::Ending) {
                Slot::Active(session) => session,
                _ => unreachable!("slot checked Active under the same lock"),
            }
        };
        info!(
            session_id = session.session_id,
            reason = %reason,
            "ending session"
        );

        // Every timer goes before any further I/O.
        for timer in session.timers.drain(..) {
            timer.abort();
        }
        if let Some(timer) = session.grace_timer.take() {
            timer.abort();
        }

        // Ask the child to wind down; never wait here. The escalation
        // task force-kills if the graceful path stalls.
        terminate(session.child_pid);
        spawn_kill_escalation(session.child_pid, Arc::clone(&session.child_exited));

        // Cleanup order matters: the credential file is gone before the
        // token stops resolving and before the client hears session_ended.
        session.credentials.remove();
        self.tokens.remove(&session.session_token).await;

        if let Some(invite_token) = &session.invite_token {
            let mut errors = session.errors.clone();
            errors.extend(self.carryover_errors.lock().expect("carryover poisoned").drain(..));
            let usage = SessionUsage {
                session_id: session.session_id.clone(),
                client_id: session.client_id.clone(),
                started_at_ms: session.started_at_ms,
                ended_at_ms: now_ms(),
                end_reason: reason,
                queue_wait_ms: session.queue_wait_ms,
                remote_addr: session.remote_addr.clone(),
                user_agent: session.user_agent.clone(),
                errors,
            };
            if let Err(err) = self.invites.consume(invite_token, usage).await {
                // Audit loss is preferred over stalling teardown.
                warn!("failed to record invite usage: {err}");
            }
        }

        if let Err(err) = self.kv.del(&resume_key(&session.client_id)).await {
            warn!("failed to remove resume hint: {err}");
        }

        self.clients
            .send(
                &session.client_id,
                ServerMessage::SessionEnded {
                    reason,
                    clear_session_cookie: true,
                },
            )
            .await;
        self.clients
            .set_state(&session.client_id, ClientState::Connected)
            .await;

        self.spawn_reset_hook();

        *self.slot.lock().await = Slot::Idle;
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.promote_next().await;
        }
        })
    }

    /// Operator shutdown: end any live session, then stop promoting.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.end_session(EndReason::Shutdown, None).await;
    }

    /// Owning client's socket closed: hold the session open for the
    /// grace window instead of ending immediately.
    pub(crate) async fn client_connection_lost(self: &Arc<Self>, client_id: &str) {
        let mut slot = self.slot.lock().await;
        let Slot::Active(session) = &mut *slot else {
            return;
        };
        if session.client_id != client_id || session.disconnected {
            return;
        }
        session.disconnected = true;

        let broker = Arc::clone(self);
        let session_id = session.session_id.clone();
        let grace = self.cfg.disconnect_grace();
        session.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            broker
                .end_session(EndReason::Disconnected, Some(&session_id))
                .await;
        }));
        info!(
            client_id,
            grace_ms = grace.as_millis() as u64,
            "client dropped; reconnect grace armed"
        );
    }

    /// Rebind a disconnected session to a fresh connection presenting
    /// its token. Exactly one concurrent attempt can win.
    pub(crate) async fn resume_session(self: &Arc<Self>, client_id: &str, token: &str) {
        let outcome = {
            let mut slot = self.slot.lock().await;
            match &mut *slot {
                Slot::Active(session)
                    if constant_time_eq(session.session_token.as_bytes(), token.as_bytes()) =>
                {
                    if session.rebinding {
                        Err("Another reconnect attempt is already in progress")
                    } else if !session.disconnected {
                        Err("Session is not awaiting reconnect")
                    } else {
                        session.rebinding = true;
                        if let Some(timer) = session.grace_timer.take() {
                            timer.abort();
                        }
                        session.disconnected = false;
                        session.client_id = client_id.to_string();
                        session.rebinding = false;
                        Ok((session.session_token.clone(), session.deadline_ms))
                    }
                }
                _ => Err("No active session for that token"),
            }
        };

        match outcome {
            Ok((session_token, deadline_ms)) => {
                if let Some((remote_addr, _)) = self.clients.meta(client_id).await {
                    self.tokens
                        .rebind(&session_token, client_id, &remote_addr)
                        .await;
                }
                self.clients
                    .set_state(client_id, ClientState::Active)
                    .await;
                self.clients
                    .send(
                        client_id,
                        ServerMessage::SessionStarting {
                            terminal_url: self.cfg.terminal.url.clone(),
                            expires_at: deadline_ms,
                            session_token,
                        },
                    )
                    .await;
                info!(client_id, "session rebound after reconnect");
            }
            Err(message) => {
                self.clients
                    .send(
                        client_id,
                        ServerMessage::Error {
                            message: message.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Hand the slot to the next queued client that is still connected.
    pub(crate) async fn promote_next(self: &Arc<Self>) {
        loop {
            let Some((client_id, enqueued_at_ms)) = self.queue.pop_head().await else {
                self.broadcast_positions().await;
                return;
            };
            if self.clients.state(&client_id).await.is_none() {
                continue;
            }
            let queue_wait_ms = now_ms().saturating_sub(enqueued_at_ms);
            match promote(self, &client_id, queue_wait_ms).await {
                Ok(()) => {
                    self.broadcast_positions().await;
                    return;
                }
                Err(BrokerError::SlotBusy) => {
                    // A direct join won the race; give the slot back.
                    self.queue.push_front(&client_id, enqueued_at_ms).await;
                    self.broadcast_positions().await;
                    return;
                }
                Err(err) => {
                    warn!(client_id = %client_id, "promotion failed, trying next in line: {err}");
                    self.clients
                        .send(
                            &client_id,
                            ServerMessage::Error {
                                message: "Failed to start your session; please rejoin".to_string(),
                            },
                        )
                        .await;
                    self.clients.clear_queued(&client_id).await;
                }
            }
        }
    }

    /// `session_warning`, once, shortly before hard expiry.
    pub(crate) async fn fire_session_warning(self: &Arc<Self>, session_id: &str) {
        let target = {
            let mut slot = self.slot.lock().await;
            match &mut *slot {
                Slot::Active(session)
                    if session.session_id == session_id && !session.warning_fired =>
                {
                    session.warning_fired = true;
                    let remaining_ms = session.deadline_ms.saturating_sub(now_ms());
                    Some((session.client_id.clone(), remaining_ms.div_ceil(60_000)))
                }
                _ => None,
            }
        };
        if let Some((client_id, minutes_remaining)) = target {
            self.clients
                .send(
                    &client_id,
                    ServerMessage::SessionWarning { minutes_remaining },
                )
                .await;
        }
    }

    /// Fire-and-forget data-reset hook; the next session never waits on
    /// it. Failures surface in the next audit record.
    fn spawn_reset_hook(self: &Arc<Self>) {
        let Some(command) = self.cfg.reset.command.clone() else {
            return;
        };
        let args = self.cfg.reset.args.clone();
        let creds = self.cfg.credentials.clone();
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let result = Command::new(&command)
                .args(&args)
                .env("JIRA_SITE_URL", &creds.jira_site_url)
                .env("JIRA_EMAIL", &creds.jira_email)
                .env("JIRA_API_TOKEN", &creds.jira_api_token)
                .env_remove("CLAUDE_CODE_OAUTH_TOKEN")
                .stdin(std::process::Stdio::null())
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => {
                    info!(command = %command, "data-reset hook finished");
                }
                Ok(output) => {
                    let code = output.status.code().unwrap_or(-1);
                    warn!(command = %command, code, "data-reset hook failed");
                    broker.record_carryover_error(format!("data-reset exited with code {code}"));
                }
                Err(err) => {
                    warn!(command = %command, "data-reset hook failed to spawn: {err}");
                    broker.record_carryover_error(format!("data-reset spawn failed: {err}"));
                }
            }
        });
    }

    pub(crate) fn record_carryover_error(&self, message: String) {
        self.carryover_errors
            .lock()
            .expect("carryover poisoned")
            .push(message);
    }
}

/// Build the terminal child invocation. A container runtime gets the
/// hardened `run` flags and reads the credential file itself via
/// `--env-file` (values stay out of argv); anything else receives the
/// path in its environment.
pub(crate) fn build_terminal_command(cfg: &Config, session_id: &str, cred_path: &Path) -> Command {
    let terminal = &cfg.terminal;
    let mut cmd = Command::new(&terminal.command);
    if terminal.command == "docker" || terminal.command == "podman" {
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(format!("demogate-{session_id}"))
            .arg("--read-only")
            .arg("--tmpfs")
            .arg("/workspace:rw,size=256m")
            .arg("--memory")
            .arg("1g")
            .arg("--cpus")
            .arg("1.5")
            .arg("--pids-limit")
            .arg("256")
            .arg("--cap-drop")
            .arg("ALL")
            .arg("--security-opt")
            .arg("no-new-privileges")
            .arg("--env-file")
            .arg(cred_path);
        for (key, value) in &terminal.extra_env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("-e")
            .arg(format!("DEMOGATE_SESSION_ID={session_id}"))
            .arg("-e")
            .arg(format!(
                "DEMOGATE_SESSION_TIMEOUT_MINUTES={}",
                cfg.session_timeout_minutes
            ));
        cmd.args(&terminal.args);
        cmd.arg(&terminal.image);
    } else {
        cmd.args(&terminal.args);
        cmd.env("DEMOGATE_CREDENTIALS_FILE", cred_path);
        cmd.env("DEMOGATE_SESSION_ID", session_id);
        cmd.env(
            "DEMOGATE_SESSION_TIMEOUT_MINUTES",
            cfg.session_timeout_minutes.to_string(),
        );
        for (key, value) in &terminal.extra_env {
            cmd.env(key, value);
        }
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    cmd
}

/// Remove credential files a crashed predecessor may have left behind.
fn sweep_stale_credentials(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("session-") && name.ends_with(".env") {
            error!(file = %name, "stale credential file found before promote; removing");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

fn force_kill(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

/// Backstop for a child that ignores SIGTERM during Ending.
fn spawn_kill_escalation(pid: Option<u32>, exited: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::time::sleep(HARD_KILL_LEAD).await;
        if !exited.load(Ordering::SeqCst) {
            warn!("terminal child ignored SIGTERM; force-killing");
            force_kill(pid);
        }
    });
}
