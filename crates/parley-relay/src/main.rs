use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_relay::RelayConfig;
use parley_relay::auth::issue_token;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "parley presence, messaging and call-signaling relay")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/parley/relay.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// SQLite database file.
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long, env = "PARLEY_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    #[arg(long)]
    max_connections: Option<usize>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint a development token for an identity.
    IssueToken {
        identity: String,
        #[arg(long, default_value = "86400")]
        ttl_secs: u64,
        /// Signing secret (defaults to the configured one).
        #[arg(long)]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_relay=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RelayConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(store) = args.store {
        config.store_path = Some(store);
    }
    if let Some(secret) = args.jwt_secret {
        config.auth.jwt_secret = Some(secret);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    config.validate()?;

    match args.command {
        Some(Command::IssueToken {
            identity,
            ttl_secs,
            secret,
        }) => {
            let secret = secret
                .or(config.auth.jwt_secret)
                .context("no signing secret: pass --secret or configure auth.jwt_secret")?;
            let token = issue_token(&secret, &identity, Duration::from_secs(ttl_secs))
                .context("failed to sign token")?;
            println!("{token}");
            Ok(())
        }
        None => {
            tracing::info!(
                listen = %config.listen,
                max_connections = config.max_connections,
                store = ?config.store_path,
                "starting parley-relay"
            );
            parley_relay::serve(config).await
        }
    }
}
