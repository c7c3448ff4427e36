use admission_gate::config::Config;
use admission_gate::server::Server;
use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line overrides; everything else comes from the environment.
#[derive(Parser, Debug)]
#[command(name = "admission-gate")]
#[command(about = "Sliding-window admission control service with Redis and local fallback")]
struct Args {
    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// JSON policy table
    #[arg(long)]
    policy_file: Option<PathBuf>,

    /// Serve every decision from the in-process store
    #[arg(long)]
    disable_redis: bool,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(policy_file) = args.policy_file {
        config.policy_file = Some(policy_file);
    }
    if args.disable_redis {
        config.disable_redis = true;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    config
        .check()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("admission_gate={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting admission gate");
    tracing::info!(
        bind_addr = %config.bind_addr,
        shared_store = if config.disable_redis { "disabled" } else { config.redis_url.as_str() },
        environment = %config.environment,
        "Configuration loaded"
    );

    let server = Server::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
