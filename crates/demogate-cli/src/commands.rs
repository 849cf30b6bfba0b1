use anyhow::Result;
use demogate_protocol::{InviteRecord, InviteStatus, now_ms, parse_duration};
use libdemogate::InviteStore;

pub async fn generate(
    store: &InviteStore,
    expires: &str,
    token: Option<String>,
    label: Option<String>,
    max_uses: u32,
) -> Result<()> {
    let expires_in = match parse_duration(expires) {
        Ok(duration) => duration,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    match store
        .generate(expires_in, max_uses, label, token, "cli")
        .await
    {
        Ok(invite) => {
            println!("{}", invite.token);
            println!("  expires: {}", fmt_until(invite.expires_at_ms));
            println!("  max uses: {}", invite.max_uses);
            if let Some(label) = &invite.label {
                println!("  label: {label}");
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

pub async fn list(store: &InviteStore, status: Option<&str>) -> Result<()> {
    let filter = match status {
        Some(raw) => match raw.parse::<InviteStatus>() {
            Ok(status) => Some(status),
            Err(err) => {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let invites = store.list(filter).await?;
    if invites.is_empty() {
        println!("no invites");
        return Ok(());
    }

    println!(
        "{:<34}  {:<8}  {:<6}  {:<12}  LABEL",
        "TOKEN", "STATUS", "USES", "EXPIRES"
    );
    for invite in &invites {
        println!(
            "{:<34}  {:<8}  {:<6}  {:<12}  {}",
            invite.token,
            status_str(invite.status),
            format!("{}/{}", invite.use_count, invite.max_uses),
            fmt_until(invite.expires_at_ms),
            invite.label.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn info(store: &InviteStore, token: &str) -> Result<()> {
    match store.info(token).await? {
        Some(invite) => {
            print_invite(&invite);
            Ok(())
        }
        None => {
            eprintln!("error: no such invite: {token}");
            std::process::exit(1);
        }
    }
}

pub async fn revoke(store: &InviteStore, token: &str) -> Result<()> {
    match store.revoke(token).await {
        Ok(invite) => {
            println!("revoked {}", invite.token);
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn print_invite(invite: &InviteRecord) {
    println!("token:    {}", invite.token);
    println!("status:   {}", status_str(invite.status));
    println!("uses:     {}/{}", invite.use_count, invite.max_uses);
    println!("label:    {}", invite.label.as_deref().unwrap_or("-"));
    println!("created:  {} by {}", fmt_ago(invite.created_at_ms), invite.created_by);
    println!("expires:  {}", fmt_until(invite.expires_at_ms));

    if invite.audit.is_empty() {
        println!("sessions: none");
        return;
    }
    println!("sessions:");
    for usage in &invite.audit {
        let minutes = usage.ended_at_ms.saturating_sub(usage.started_at_ms) / 60_000;
        println!(
            "  {}  {}  {}min  waited {}s  from {}",
            usage.session_id,
            usage.end_reason,
            minutes,
            usage.queue_wait_ms / 1_000,
            usage.remote_addr,
        );
        for error in &usage.errors {
            println!("    error: {error}");
        }
    }
}

fn status_str(status: InviteStatus) -> &'static str {
    match status {
        InviteStatus::Pending => "pending",
        InviteStatus::Used => "used",
        InviteStatus::Expired => "expired",
        InviteStatus::Revoked => "revoked",
    }
}

/// Compact relative time like `47h13m` or `3d2h`.
fn fmt_span(ms: u64) -> String {
    let mins = ms / 60_000;
    let (days, hours, mins) = (mins / 1_440, (mins % 1_440) / 60, mins % 60);
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else {
        format!("{mins}m")
    }
}

fn fmt_until(at_ms: u64) -> String {
    let now = now_ms();
    if at_ms <= now {
        format!("{} ago", fmt_span(now - at_ms))
    } else {
        format!("in {}", fmt_span(at_ms - now))
    }
}

fn fmt_ago(at_ms: u64) -> String {
    format!("{} ago", fmt_span(now_ms().saturating_sub(at_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_pick_the_two_largest_units() {
        assert_eq!(fmt_span(5 * 60_000), "5m");
        assert_eq!(fmt_span((47 * 60 + 13) * 60_000), "47h13m");
        assert_eq!(fmt_span((3 * 1_440 + 120) * 60_000), "3d2h");
    }
}
