use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use demogate_protocol::{
    InviteRecord, InviteStatus, MIN_INVITE_TOKEN_LEN, RejectReason, SessionUsage,
    new_invite_token, now_ms,
};
use tracing::warn;

use crate::kv::Kv;
use crate::rate_limit::SlidingWindow;

const FAILURE_WINDOW: Duration = Duration::from_secs(3_600);

fn invite_key(token: &str) -> String {
    format!("invite:{token}")
}

/// CRUD over invite records plus the brute-force shield.
///
/// The store is the only writer of invite documents; callers get
/// copies. All failure reasons are drawn from the closed
/// [`RejectReason`] set and nothing else leaks.
pub struct InviteStore {
    kv: Kv,
    audit_retention: Duration,
    failures: Mutex<SlidingWindow>,
}

impl InviteStore {
    pub fn new(kv: Kv, audit_retention: Duration, failures_per_hour: usize) -> Self {
        Self {
            kv,
            audit_retention,
            failures: Mutex::new(SlidingWindow::new(failures_per_hour, FAILURE_WINDOW)),
        }
    }

    /// Create an invite. `custom_token` (operator vanity name) collides
    /// with any existing record, expired ones included.
    pub async fn generate(
        &self,
        expires_in: Duration,
        max_uses: u32,
        label: Option<String>,
        custom_token: Option<String>,
        created_by: &str,
    ) -> Result<InviteRecord> {
        let token = match custom_token {
            Some(token) => {
                if self.kv.get(&invite_key(&token)).await?.is_some() {
                    bail!("invite token already exists: {token}");
                }
                token
            }
            None => new_invite_token(),
        };

        let now = now_ms();
        let record = InviteRecord {
            token: token.clone(),
            label,
            created_by: created_by.to_string(),
            created_at_ms: now,
            expires_at_ms: now + expires_in.as_millis() as u64,
            status: InviteStatus::Pending,
            max_uses: max_uses.max(1),
            use_count: 0,
            audit: Vec::new(),
        };
        self.put(&record, Some(expires_in + self.audit_retention))
            .await?;
        Ok(record)
    }

    /// Validate a presented token. Check order: shield, missing,
    /// malformed, not-found, revoked, used, expired. Every failure
    /// counts against the caller's address; successes do not reset the
    /// counter.
    pub async fn validate(
        &self,
        token: Option<&str>,
        remote_addr: &str,
    ) -> Result<InviteRecord, RejectReason> {
        if self
            .failures
            .lock()
            .expect("failure window poisoned")
            .blocked(remote_addr)
            .is_some()
        {
            return Err(self.fail(remote_addr, RejectReason::RateLimited));
        }

        let Some(token) = token else {
            return Err(self.fail(remote_addr, RejectReason::Missing));
        };
        if token.len() < MIN_INVITE_TOKEN_LEN {
            return Err(self.fail(remote_addr, RejectReason::Invalid));
        }

        // KV trouble fails closed as not-found.
        let record = match self.kv.get(&invite_key(token)).await {
            Ok(Some(json)) => match serde_json::from_str::<InviteRecord>(&json) {
                Ok(record) => record,
                Err(err) => {
                    warn!(token_len = token.len(), "corrupt invite record: {err}");
                    return Err(self.fail(remote_addr, RejectReason::NotFound));
                }
            },
            Ok(None) => return Err(self.fail(remote_addr, RejectReason::NotFound)),
            Err(err) => {
                warn!("kv unavailable during invite validation: {err}");
                return Err(self.fail(remote_addr, RejectReason::NotFound));
            }
        };

        if record.status == InviteStatus::Revoked {
            return Err(self.fail(remote_addr, RejectReason::Revoked));
        }
        if record.status == InviteStatus::Used || record.use_count >= record.max_uses {
            return Err(self.fail(remote_addr, RejectReason::Used));
        }
        if now_ms() >= record.expires_at_ms {
            // Fix up the stored status on encounter, keeping whatever
            // TTL the record still has.
            let mut expired = record;
            expired.status = InviteStatus::Expired;
            if let Err(err) = self.rewrite_keeping_ttl(&expired).await {
                warn!("failed to persist expired invite status: {err}");
            }
            return Err(self.fail(remote_addr, RejectReason::Expired));
        }

        Ok(record)
    }

    /// Append a usage record and advance the use count; flips the
    /// invite to Used at the cap. The TTL is extended past expiry by
    /// the audit retention so history outlives the invite. Best-effort:
    /// audit loss is preferred over stalling teardown.
    pub async fn consume(&self, token: &str, usage: SessionUsage) -> Result<()> {
        let json = self
            .kv
            .get(&invite_key(token))
            .await?
            .with_context(|| format!("invite vanished before consume: {token}"))?;
        let mut record: InviteRecord =
            serde_json::from_str(&json).context("corrupt invite record on consume")?;

        record.audit.push(usage);
        record.use_count += 1;
        if record.use_count >= record.max_uses && record.status != InviteStatus::Revoked {
            record.status = InviteStatus::Used;
        }

        let now = now_ms();
        let until_expiry = Duration::from_millis(record.expires_at_ms.saturating_sub(now));
        self.put(&record, Some(until_expiry + self.audit_retention))
            .await
    }

    /// Operator revocation. Terminal; preserves the remaining TTL.
    pub async fn revoke(&self, token: &str) -> Result<InviteRecord> {
        let json = self
            .kv
            .get(&invite_key(token))
            .await?
            .with_context(|| format!("no such invite: {token}"))?;
        let mut record: InviteRecord =
            serde_json::from_str(&json).context("corrupt invite record on revoke")?;
        record.status = InviteStatus::Revoked;
        self.rewrite_keeping_ttl(&record).await?;
        Ok(record)
    }

    pub async fn info(&self, token: &str) -> Result<Option<InviteRecord>> {
        match self.kv.get(&invite_key(token)).await? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("corrupt invite record")?,
            )),
            None => Ok(None),
        }
    }

    pub async fn list(&self, status: Option<InviteStatus>) -> Result<Vec<InviteRecord>> {
        let keys = self.kv.scan_keys("invite:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(json) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<InviteRecord>(&json) {
                Ok(record) => {
                    if status.is_none_or(|wanted| record.status == wanted) {
                        records.push(record);
                    }
                }
                Err(err) => warn!(key = %key, "skipping corrupt invite record: {err}"),
            }
        }
        records.sort_by_key(|record| record.created_at_ms);
        Ok(records)
    }

    fn fail(&self, remote_addr: &str, reason: RejectReason) -> RejectReason {
        self.failures
            .lock()
            .expect("failure window poisoned")
            .record(remote_addr);
        reason
    }

    async fn put(&self, record: &InviteRecord, ttl: Option<Duration>) -> Result<()> {
        let json = serde_json::to_string(record).context("failed to serialize invite")?;
        self.kv.set(&invite_key(&record.token), &json, ttl).await
    }

    async fn rewrite_keeping_ttl(&self, record: &InviteRecord) -> Result<()> {
        let ttl = self.kv.ttl(&invite_key(&record.token)).await?;
        self.put(record, ttl).await
    }
}
