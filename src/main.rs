use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rpcswitch::auth;
use rpcswitch::config::AppConfig;
use rpcswitch::logging::{self, LogConfig};
use rpcswitch::policy::Policy;
use rpcswitch::switch::Switch;
use rpcswitch::switch::client::SwitchClient;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rpcswitch")]
#[command(about = "JSON-RPC 2.0 switch", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the switch daemon
    Daemon {
        #[arg(short, long, default_value = "/etc/rpcswitch/config.toml")]
        config: PathBuf,
    },
    /// Query a running switch for its stats
    Status {
        #[arg(long, default_value = "127.0.0.1:6551")]
        addr: SocketAddr,
        #[arg(long, default_value = "password")]
        auth_method: String,
        #[arg(long)]
        who: String,
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config } => {
            run_daemon(config).await.context("Failed to start daemon")?
        }
        Commands::Status {
            addr,
            auth_method,
            who,
            token,
        } => run_status(addr, &auth_method, &who, &token)
            .await
            .context("Failed to query switch")?,
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> Result<()> {
    let cfg = AppConfig::load(&config_path)?;
    logging::init(LogConfig {
        json: cfg.json_log,
        verbose: cfg.verbose,
    });

    let policy = Policy::load(&cfg.methods)?;
    let verifier = auth::create_verifier(&cfg);

    let pid_file = cfg.pid_file.clone();
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pid file {}", path.display()))?;
    }

    let switch = Switch::new(cfg, policy, verifier);

    // SIGHUP swaps in a fresh method configuration; a failed parse keeps
    // the running one.
    {
        let switch = Arc::clone(&switch);
        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                if let Err(e) = switch.reload_policy().await {
                    error!(error = %format!("{e:#}"), "Reload failed, keeping previous policy");
                }
            }
        });
    }

    // SIGINT/SIGTERM shut down gracefully.
    {
        let switch = Arc::clone(&switch);
        tokio::spawn(async move {
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            info!("Shutdown requested");
            switch.shutdown();
        });
    }

    Arc::clone(&switch).run().await?;

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }

    Ok(())
}

async fn run_status(
    addr: SocketAddr,
    auth_method: &str,
    who: &str,
    token: &str,
) -> Result<()> {
    let mut client = SwitchClient::connect(addr).await?;
    client.hello(auth_method, who, token).await?;
    let stats: Value = client.call("rpcswitch.get_stats", None).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
