//! Relay entry point: load config, apply CLI overrides, serve until signalled.

use anyhow::anyhow;
use std::time::Duration;
use tracing::info;

use horizon_relay::cli::CliArgs;
use horizon_relay::config::AppConfig;
use horizon_relay::logging::setup_logging;
use horizon_relay::signals::{drain_on, shutdown_signal};
use horizon_relay::RelayServer;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

async fn run(args: CliArgs) -> anyhow::Result<()> {
    // Load configuration first (before logging setup)
    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    args.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

    setup_logging(&config.logging)?;

    let version = env!("CARGO_PKG_VERSION");
    info!("🚀 Horizon Relay v{}", version);
    info!(
        "📂 Config: {} | Auth: {}",
        args.config_path.display(),
        if config.relay.auth_token.is_some() { "token" } else { "open" }
    );

    let server = RelayServer::new(
        config.relay.bind_address()?,
        config.relay.auth_token.clone(),
    );
    let handle = server.start().await?;

    let monitoring_handle = {
        let hub = handle.hub().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            let mut last_published = 0u64;
            loop {
                interval.tick().await;
                let stats = hub.stats();
                let this_period = stats.frames_published - last_published;
                last_published = stats.frames_published;
                info!(
                    "📊 Relay Health - {} publishes/min | {} connections | {} channels",
                    this_period, stats.connections, stats.channels
                );
            }
        })
    };

    info!("✅ Horizon Relay is now running on {}", handle.local_addr());
    info!("🛑 Press Ctrl+C to gracefully shutdown");

    let final_stats = drain_on(handle, shutdown_signal()).await;
    monitoring_handle.abort();
    let final_stats = final_stats?;

    info!("✅ Horizon Relay shutdown complete");
    info!(
        "📊 Relayed {} publishes as {} deliveries",
        final_stats.frames_published, final_stats.frames_delivered
    );
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("❌ Failed to run relay: {e:?}");
        std::process::exit(1);
    }
}
