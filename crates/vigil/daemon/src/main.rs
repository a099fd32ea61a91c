//! Vigil Daemon - per-user market monitoring service
//!
//! The daemon provides:
//! - Polling of Hot and Warm streams on their cadence
//! - Per-user patrol loops
//! - REST API for conditions, streams, samples and budgets

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_daemon::{DaemonConfig, Server};
use vigil_monitor::Profile;

/// Vigil Daemon CLI
#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "Vigil Daemon - per-user market monitoring service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "VIGIL_LISTEN_ADDR")]
    listen: Option<String>,

    /// Monitoring profile (pro, development)
    #[arg(short, long, env = "VIGIL_PROFILE")]
    profile: Option<String>,

    /// Log level
    #[arg(long, env = "VIGIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "VIGIL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", listen))?;
    }
    if let Some(profile) = &cli.profile {
        config.profile = profile.parse::<Profile>().map_err(anyhow::Error::msg)?;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    println!(
        r#"
        _       _ __
 _   __(_)___ _(_) /
| | / / / __ `/ / /
| |/ / / /_/ / / /
|___/_/\__, /_/_/
      /____/

  Vigil - Market Monitoring Daemon
  Version: {}
  Profile: {:?}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.profile,
        config.server.listen_addr
    );

    let server = Server::new(config).context("building server")?;
    server.run().await.context("running server")?;
    Ok(())
}
