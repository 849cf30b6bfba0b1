use std::collections::HashMap;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use demogate_protocol::{ClientId, SessionId, now_ms};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

type HmacSha256 = Hmac<Sha256>;

/// Mint a session token: HMAC-SHA256 of the session id under the
/// process secret, URL-safe encoded. Opaque to clients.
pub fn mint_session_token(secret: &[u8], session_id: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).context("invalid hmac key")?;
    mac.update(session_id.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check that `token` is the mint of `session_id`.
pub fn verify_session_token(secret: &[u8], session_id: &str, token: &str) -> bool {
    let Ok(expected) = mint_session_token(secret, session_id) else {
        return false;
    };
    constant_time_eq(expected.as_bytes(), token.as_bytes())
}

/// Constant-time equality for token material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// What a session token currently stands for.
#[derive(Debug, Clone)]
pub enum TokenEntry {
    /// Minted during promotion, before the slot reaches Active.
    Pending {
        client_id: ClientId,
        remote_addr: String,
        created_at_ms: u64,
    },
    Active {
        session_id: SessionId,
        client_id: ClientId,
        remote_addr: String,
    },
}

impl TokenEntry {
    pub fn remote_addr(&self) -> &str {
        match self {
            TokenEntry::Pending { remote_addr, .. } => remote_addr,
            TokenEntry::Active { remote_addr, .. } => remote_addr,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            TokenEntry::Pending { client_id, .. } => client_id,
            TokenEntry::Active { client_id, .. } => client_id,
        }
    }
}

/// token -> entry map for active and pending sessions. Small; writes
/// are rare.
pub struct TokenMap {
    inner: RwLock<HashMap<String, TokenEntry>>,
}

impl Default for TokenMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_pending(&self, token: &str, client_id: &str, remote_addr: &str) {
        self.inner.write().await.insert(
            token.to_string(),
            TokenEntry::Pending {
                client_id: client_id.to_string(),
                remote_addr: remote_addr.to_string(),
                created_at_ms: now_ms(),
            },
        );
    }

    /// Upgrade a pending entry once the session slot reaches Active.
    pub async fn activate(&self, token: &str, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(token) {
            let (client_id, remote_addr) =
                (entry.client_id().to_string(), entry.remote_addr().to_string());
            *entry = TokenEntry::Active {
                session_id: session_id.to_string(),
                client_id,
                remote_addr,
            };
        }
    }

    /// Rebind an active token to a new connection after reconnect.
    pub async fn rebind(&self, token: &str, client_id: &str, remote_addr: &str) {
        let mut inner = self.inner.write().await;
        if let Some(TokenEntry::Active {
            client_id: owner,
            remote_addr: addr,
            ..
        }) = inner.get_mut(token)
        {
            *owner = client_id.to_string();
            *addr = remote_addr.to_string();
        }
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }

    pub async fn lookup(&self, token: &str) -> Option<TokenEntry> {
        self.inner.read().await.get(token).cloned()
    }

    /// Called when a client departs before its pending session starts.
    pub async fn remove_pending_for_client(&self, client_id: &str) {
        self.inner.write().await.retain(|_, entry| {
            !matches!(entry, TokenEntry::Pending { client_id: owner, .. } if owner == client_id)
        });
    }

    /// Token+address check used by the cookie and validation endpoints.
    /// Returns the session id (or client id for pending entries) to put
    /// in the downstream logging header.
    pub async fn authorize(&self, token: &str, remote_addr: &str) -> Option<String> {
        let inner = self.inner.read().await;
        let entry = inner.get(token)?;
        if entry.remote_addr() != remote_addr {
            return None;
        }
        match entry {
            TokenEntry::Pending { client_id, .. } => Some(client_id.clone()),
            TokenEntry::Active { session_id, .. } => Some(session_id.clone()),
        }
    }
}
