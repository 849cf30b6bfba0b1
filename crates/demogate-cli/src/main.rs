mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use libdemogate::{Config, InviteStore, Kv};

#[derive(Parser, Debug)]
#[command(name = "demogate", about = "Invite management for the demogate broker")]
struct Cli {
    /// Path to the broker's TOML config (for the KV settings).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the KV store URL.
    #[arg(long)]
    kv_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new invite.
    Generate {
        /// Lifetime as <integer><unit>, unit one of m, h, d, w (e.g. 48h).
        #[arg(long)]
        expires: String,
        /// Vanity token; fails if any record with this token exists.
        #[arg(long)]
        token: Option<String>,
        /// Human-visible label.
        #[arg(long)]
        label: Option<String>,
        /// Sessions this invite admits.
        #[arg(long, default_value_t = 1)]
        max_uses: u32,
    },
    /// List invites.
    List {
        /// Filter: pending, used, expired, or revoked.
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one invite with its audit trail.
    Info { token: String },
    /// Revoke an invite.
    Revoke { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load_unchecked(cli.config.as_deref())?;
    let kv_url = cli.kv_url.unwrap_or_else(|| cfg.kv_url.clone());

    let kv = Kv::connect(&kv_url).await?;
    let store = InviteStore::new(
        kv,
        cfg.audit_retention(),
        cfg.rate_limits.invite_failures_per_hour,
    );

    match cli.command {
        Commands::Generate {
            expires,
            token,
            label,
            max_uses,
        } => commands::generate(&store, &expires, token, label, max_uses).await,
        Commands::List { status } => commands::list(&store, status.as_deref()).await,
        Commands::Info { token } => commands::info(&store, &token).await,
        Commands::Revoke { token } => commands::revoke(&store, &token).await,
    }
}
