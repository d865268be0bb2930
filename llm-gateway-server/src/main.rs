use anyhow::Context;
use clap::Parser;
use llm_gateway_server::config::GatewayConfig;
use llm_gateway_server::server;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Multi-provider LLM gateway.
#[derive(Parser, Debug)]
#[command(name = "llm-gateway", version, about)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "config/gateway.toml")]
    config: PathBuf,

    /// Override the configured API port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llm_gateway_core=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing::info!(
        providers = config.providers.iter().filter(|p| p.enabled).count(),
        strategy = %config.router.strategy,
        "starting llm-gateway"
    );
    server::run(config).await
}
