use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::CredentialConfig;

/// Per-session secret handoff file.
///
/// Written 0600 before the terminal child spawns; the child gets the
/// path, never the values. Removal is guaranteed: explicitly during
/// teardown, or by the drop guard if teardown never ran.
pub struct CredentialFile {
    path: PathBuf,
    removed: bool,
}

impl CredentialFile {
    /// Create the file for `session_id` under `dir`, owner-only, as
    /// `KEY=value` lines. Fails if a file for this session already
    /// exists.
    pub fn write(dir: &Path, session_id: &str, creds: &CredentialConfig) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create credentials dir {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to restrict credentials dir {}", dir.display()))?;

        let path = dir.join(format!("session-{session_id}.env"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("failed to create credential file {}", path.display()))?;

        let contents = format!(
            "JIRA_API_TOKEN={}\nJIRA_EMAIL={}\nJIRA_SITE_URL={}\nCLAUDE_CODE_OAUTH_TOKEN={}\n",
            creds.jira_api_token, creds.jira_email, creds.jira_site_url, creds.claude_oauth_token,
        );
        file.write_all(contents.as_bytes())
            .context("failed to write credential file")?;
        file.flush().context("failed to flush credential file")?;

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the file. Idempotent; a missing file is not an error.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    "failed to remove credential file: {err}"
                );
            }
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Startup probe: the credentials directory must exist and be writable
/// before the broker serves anything.
pub fn ensure_writable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("credentials dir {} cannot be created", dir.display()))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("credentials dir {} cannot be restricted", dir.display()))?;
    let probe = dir.join(".probe");
    fs::write(&probe, b"probe")
        .with_context(|| format!("credentials dir {} is not writable", dir.display()))?;
    fs::remove_file(&probe).ok();
    Ok(())
}
