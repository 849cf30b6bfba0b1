use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Opaque identifier for a gateway connection.
pub type ClientId = String;

/// Unique identifier for a demo session.
pub type SessionId = String;

/// Bytes of entropy in a generated invite token.
pub const INVITE_TOKEN_BYTES: usize = 24;

/// Shortest token the invite store will even look up.
pub const MIN_INVITE_TOKEN_LEN: usize = 10;

/// Client-to-broker messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to join the waitlist, presenting an invite token.
    JoinQueue {
        #[serde(default, alias = "inviteToken")]
        invite_token: Option<String>,
    },
    /// Leave the waitlist. No-op when not queued.
    LeaveQueue,
    /// Keepalive; answered with `heartbeat_ack` and resets the idle window.
    Heartbeat,
    /// Reclaim a session within the disconnect grace window.
    ResumeSession { session_token: String },
    /// Voluntarily end the caller's active session.
    EndSession,
}

/// Broker-to-client messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Snapshot sent once right after the socket opens.
    Status {
        queue_size: usize,
        session_active: bool,
    },
    /// Fresh 1-indexed position, re-sent on every queue-order change.
    QueuePosition {
        position: usize,
        /// Rough wait in minutes (position x average session length).
        estimated_wait: u64,
        queue_size: usize,
    },
    QueueFull {
        message: String,
    },
    LeftQueue,
    SessionStarting {
        terminal_url: String,
        expires_at: u64,
        session_token: String,
    },
    /// Fires once, shortly before the hard expiry.
    SessionWarning {
        minutes_remaining: u64,
    },
    SessionEnded {
        reason: EndReason,
        clear_session_cookie: bool,
    },
    InviteInvalid {
        reason: RejectReason,
        message: String,
    },
    Error {
        message: String,
    },
    HeartbeatAck,
}

/// Why a session ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    Disconnected,
    ContainerExit,
    UserEnded,
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::Timeout => "timeout",
            EndReason::Disconnected => "disconnected",
            EndReason::ContainerExit => "container_exit",
            EndReason::UserEnded => "user_ended",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Why an invite was rejected. Closed set; nothing beyond the code leaks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Missing,
    Invalid,
    NotFound,
    Revoked,
    Used,
    Expired,
    RateLimited,
}

impl RejectReason {
    /// Human-visible companion text for the reason code.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Missing => "An invite token is required to join the queue",
            RejectReason::Invalid => "That invite token is not valid",
            RejectReason::NotFound => "That invite token was not found",
            RejectReason::Revoked => "That invite has been revoked",
            RejectReason::Used => "That invite has already been used",
            RejectReason::Expired => "That invite has expired",
            RejectReason::RateLimited => "Too many failed attempts; try again later",
        }
    }
}

/// Lifecycle state of an invite record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Used,
    Expired,
    Revoked,
}

impl std::str::FromStr for InviteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InviteStatus::Pending),
            "used" => Ok(InviteStatus::Used),
            "expired" => Ok(InviteStatus::Expired),
            "revoked" => Ok(InviteStatus::Revoked),
            other => Err(format!("unknown invite status: {other}")),
        }
    }
}

/// Persisted invite document, stored at `invite:<token>` with a TTL.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InviteRecord {
    pub token: String,
    #[serde(default)]
    pub label: Option<String>,
    pub created_by: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: InviteStatus,
    pub max_uses: u32,
    pub use_count: u32,
    /// Append-only usage history; never mutated after write.
    #[serde(default)]
    pub audit: Vec<SessionUsage>,
}

/// One entry in an invite's audit trail.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionUsage {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub end_reason: EndReason,
    pub queue_wait_ms: u64,
    pub remote_addr: String,
    pub user_agent: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Resume hint stored at `session:<client_id>` for the session's lifetime.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResumeHint {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
    #[serde(default)]
    pub invite_token: Option<String>,
    pub queue_wait_ms: u64,
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a fresh URL-safe invite token with [`INVITE_TOKEN_BYTES`] of entropy.
pub fn new_invite_token() -> String {
    let mut bytes = [0u8; INVITE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Error from [`parse_duration`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("duration must be <integer><unit> with unit one of m, h, d, w: {0}")]
    Malformed(String),
    #[error("duration must be greater than zero")]
    Zero,
}

/// Parse an operator duration like `30m`, `48h`, `7d`, or `2w`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if !input.is_ascii() {
        return Err(DurationParseError::Malformed(input.to_string()));
    }
    let (digits, unit) = input.split_at(input.len() - 1);
    let count: u64 = digits
        .parse()
        .map_err(|_| DurationParseError::Malformed(input.to_string()))?;
    if count == 0 {
        return Err(DurationParseError::Zero);
    }
    let secs = match unit {
        "m" => count * 60,
        "h" => count * 3_600,
        "d" => count * 86_400,
        "w" => count * 604_800,
        _ => return Err(DurationParseError::Malformed(input.to_string())),
    };
    Ok(Duration::from_secs(secs))
}
