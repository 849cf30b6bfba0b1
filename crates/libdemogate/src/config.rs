use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Lead time before hard expiry at which `session_warning` fires.
pub const WARNING_LEAD: Duration = Duration::from_secs(5 * 60);

/// Extra time after hard expiry before the terminal child is force-killed.
pub const HARD_KILL_LEAD: Duration = Duration::from_secs(5 * 60);

/// Secrets that must never be used as the session secret.
const WEAK_SECRETS: &[&str] = &[
    "change-me-in-production",
    "changeme",
    "secret",
    "password",
    "demogate",
    "development",
];

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen: String,
    /// KV store URL (`redis://...` or `memory://` for tests).
    pub kv_url: String,
    /// HMAC key for session tokens. Overridable via DEMOGATE_SESSION_SECRET.
    pub session_secret: String,
    pub session_timeout_minutes: u64,
    pub max_queue_size: usize,
    /// Used only for the wait-time estimate shown to queued clients.
    pub average_session_minutes: u64,
    pub disconnect_grace_ms: u64,
    /// Gateway closes a connection with no inbound frames for this long.
    pub idle_timeout_secs: u64,
    pub audit_retention_days: u64,
    /// Directory holding one 0600 credential file per session.
    pub credentials_dir: PathBuf,
    pub require_invite: bool,
    pub cookie_secure: bool,
    /// Comma-separated allowed CORS origins; `*` for any.
    pub cors_origins: String,
    pub rate_limits: RateLimitConfig,
    pub terminal: TerminalConfig,
    pub reset: ResetConfig,
    pub credentials: CredentialConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub connections_per_minute: usize,
    pub invite_failures_per_hour: usize,
    pub cookie_requests_per_minute: usize,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TerminalConfig {
    /// Program spawned per session. When this is a container runtime
    /// (`docker`/`podman`) the broker assembles the hardened `run`
    /// invocation itself; anything else runs with `args` as given.
    pub command: String,
    pub args: Vec<String>,
    /// Sandbox image for the container runtime path.
    pub image: String,
    /// URL handed to the browser in `session_starting`.
    pub url: String,
    /// Non-sensitive env passed through to the child (mock flags,
    /// telemetry endpoints).
    pub extra_env: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ResetConfig {
    /// Data-reset hook run after each session; disabled when empty.
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CredentialConfig {
    pub jira_email: String,
    pub jira_site_url: String,
    /// Overridable via JIRA_API_TOKEN.
    pub jira_api_token: String,
    /// Overridable via CLAUDE_CODE_OAUTH_TOKEN.
    pub claude_oauth_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8420".to_string(),
            kv_url: "redis://127.0.0.1:6379".to_string(),
            session_secret: String::new(),
            session_timeout_minutes: 60,
            max_queue_size: 10,
            average_session_minutes: 45,
            disconnect_grace_ms: 10_000,
            idle_timeout_secs: 300,
            audit_retention_days: 30,
            credentials_dir: PathBuf::from("/run/demogate/credentials"),
            require_invite: true,
            cookie_secure: false,
            cors_origins: "http://localhost:3000".to_string(),
            rate_limits: RateLimitConfig::default(),
            terminal: TerminalConfig::default(),
            reset: ResetConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: 30,
            invite_failures_per_hour: 10,
            cookie_requests_per_minute: 10,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command: "docker".to_string(),
            args: Vec::new(),
            image: "demogate-sandbox:latest".to_string(),
            url: "http://localhost:7681".to_string(),
            extra_env: HashMap::new(),
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            jira_email: String::new(),
            jira_site_url: String::new(),
            jira_api_token: String::new(),
            claude_oauth_token: String::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file, fall back to defaults, then apply env
    /// overrides for secrets and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::load_unchecked(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load without the startup validation. For operator tooling that
    /// only needs the KV settings.
    pub fn load_unchecked(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("DEMOGATE_SESSION_SECRET") {
            self.session_secret = secret;
        }
        if let Ok(token) = std::env::var("JIRA_API_TOKEN") {
            self.credentials.jira_api_token = token;
        }
        if let Ok(token) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
            self.credentials.claude_oauth_token = token;
        }
    }

    /// Startup checks that must hold before serving. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        let lowered = self.session_secret.to_ascii_lowercase();
        if WEAK_SECRETS.iter().any(|weak| lowered == *weak) {
            bail!("session_secret is a known weak literal; generate a random one");
        }
        if self.session_secret.len() < 32 {
            bail!("session_secret must be at least 32 bytes");
        }
        if self.session_timeout_minutes == 0 {
            bail!("session_timeout_minutes must be greater than zero");
        }
        if self.max_queue_size == 0 {
            bail!("max_queue_size must be greater than zero");
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(self.audit_retention_days * 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            session_secret: "a".repeat(32),
            ..Config::default()
        }
    }

    #[test]
    fn default_config_rejects_empty_secret() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn short_secret_is_fatal() {
        let cfg = Config {
            session_secret: "too-short".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn weak_literal_is_reported_as_weak() {
        let cfg = Config {
            session_secret: "Change-Me-In-Production".to_string(),
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("weak"), "unexpected error: {err}");
    }

    #[test]
    fn long_random_secret_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            [rate_limits]
            invite_failures_per_hour = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9000");
        assert_eq!(cfg.rate_limits.invite_failures_per_hour, 5);
        assert_eq!(cfg.session_timeout_minutes, 60);
        assert_eq!(cfg.max_queue_size, 10);
    }
}
