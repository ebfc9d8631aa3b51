use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use picoclaw::agent::HttpAgentProcessor;
use picoclaw::config::Config;
use picoclaw::state::StateManager;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `PicoClaw` — pairing-secured webhook gateway.
#[derive(Parser, Debug)]
#[command(name = "picoclaw")]
#[command(version)]
#[command(about = "Webhook gateway with one-time pairing and JWT auth.", long_about = None)]
struct Cli {
    /// Override the config directory (default: ~/.picoclaw)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the webhook gateway
    Gateway {
        /// Port to listen on (default: from config)
        #[arg(long)]
        port: Option<u16>,
        /// Host to bind (default: from config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Show configuration and session state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("PICOCLAW_CONFIG_DIR", config_dir);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let Some(agent_url) = config.agent.url.clone() else {
                bail!("agent.url is not configured — set it in config.toml before starting the gateway");
            };
            let agent = Arc::new(HttpAgentProcessor::new(&agent_url));

            info!("🚀 Starting PicoClaw Gateway on {host}:{port}");
            picoclaw::gateway::run_gateway(&host, port, config, agent).await
        }

        Commands::Status => {
            let state = StateManager::new(&config.workspace_dir);
            println!("🦀 PicoClaw Status");
            println!();
            println!("Version:     {}", env!("CARGO_PKG_VERSION"));
            println!("Config:      {}", config.config_path.display());
            println!("Workspace:   {}", config.workspace_dir.display());
            println!();
            println!(
                "🔒 Pairing:      {}",
                if config.gateway.require_pairing {
                    "required"
                } else {
                    "optional"
                }
            );
            println!(
                "   Credentials:  {} issued",
                config.gateway.paired_tokens.len()
            );
            println!(
                "🔑 JWT auth:     {}",
                if config.gateway.jwt_secret.is_some() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!(
                "🤖 Agent:        {}",
                config.agent.url.as_deref().unwrap_or("(not configured)")
            );
            println!("   Model:        {}", config.agent.model);
            println!();
            let last_channel = state.last_channel();
            println!(
                "💬 Last channel: {}",
                if last_channel.is_empty() {
                    "(none)"
                } else {
                    &last_channel
                }
            );
            println!("🏢 Businesses:   {} active", state.active_auth().len());
            Ok(())
        }
    }
}
