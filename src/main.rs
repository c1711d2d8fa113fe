use clap::Parser;
use sinkdns::config::Config;
use sinkdns::dns::cache::RecordCache;
use sinkdns::dns::{DnsHandler, DnsServer};
use sinkdns::stats::Stats;
use sinkdns::{api, blocker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sinkdns", about = "Caching, ad-blocking DNS proxy", version)]
struct Cli {
    /// Path to configuration file
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = if let Some(path) = cli.config {
        path
    } else {
        // Try common locations
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let candidates = vec![
            PathBuf::from("sinkdns.toml"), // Current directory
            PathBuf::from("config.toml"),  // Current directory
            PathBuf::from(format!("{home}/.config/sinkdns/config.toml")),
            PathBuf::from("/etc/sinkdns/config.toml"),
        ];

        candidates
            .into_iter()
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("/etc/sinkdns/config.toml"))
    };

    let config = Config::from_file(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!(config_path = ?config_path, "configuration loaded");

    let cache = Arc::new(RecordCache::new());
    let stats = Stats::new();
    stats.spawn_qps_ticker();

    let handler = DnsHandler::new(&config, Arc::clone(&cache), Arc::clone(&stats));
    let server = DnsServer::new(config.server.bind_addr, handler).await?;

    if config.api.enable {
        api::serve(
            config.api.bind_addr,
            server.local_addr(),
            Arc::clone(&cache),
            Arc::clone(&stats),
        )
        .await?;
    }

    // Blocklists load in the background; until they are in and the filter
    // activates, queries are answered purely from upstream.
    {
        let blocker_config = config.blocker.clone();
        let cache = Arc::clone(&cache);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            if blocker_config.enable {
                blocker::perform_update(&blocker_config, &cache, &stats, false).await;
            }
            stats.activate();
            tracing::info!("filter pipeline active");
        });
    }

    server.run().await
}
