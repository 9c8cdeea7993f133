use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use granite_common::config::GraniteConfig;
use granite_tserver::{build_catalog, load_config, open_configured_tablets, TabletManager};

#[derive(Parser, Debug)]
#[command(name = "granite-tserver", about = "Granite tablet server")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "granite.toml")]
    config: PathBuf,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Catalog heartbeat interval in milliseconds.
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", GraniteConfig::default().to_toml_string()?);
        return Ok(());
    }

    granite_observability::init_tracing();
    tracing::info!("starting granite tablet server");

    let mut config = load_config(&cli.config)?;
    if let Some(addr) = cli.metrics_addr {
        config.server.metrics_addr = addr;
    }
    config.validate()?;
    tracing::info!(node = %config.server.node_id, tablets = config.server.tablets.len(), "config ready");

    if !config.server.metrics_addr.is_empty() {
        if let Err(e) = granite_observability::init_metrics(&config.server.metrics_addr) {
            tracing::warn!("failed to initialize metrics: {}", e);
        }
    }

    let catalog = Arc::new(build_catalog(&config)?);
    let config = Arc::new(config);
    let manager = TabletManager::new(Arc::clone(&config), catalog)?;
    let opened = open_configured_tablets(&manager, &config);
    tracing::info!(opened, configured = config.server.tablets.len(), "tablets opened");

    let heartbeat_every = Duration::from_millis(cli.heartbeat_ms.max(1));
    let heartbeat_manager = Arc::clone(&manager);
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_every);
        loop {
            interval.tick().await;
            let manager = Arc::clone(&heartbeat_manager);
            match tokio::task::spawn_blocking(move || manager.heartbeat()).await {
                Ok(Ok(report)) if !report.tablets.is_empty() => {
                    tracing::debug!(sequence = report.sequence, tablets = report.tablets.len(), "heartbeat sent");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("heartbeat failed: {}", e),
                Err(e) => tracing::error!("heartbeat task panicked: {}", e),
            }
        }
    });

    let reason = wait_for_shutdown_signal().await;
    tracing::info!("{} - shutting down", reason);
    heartbeat.abort();

    let (report, _) = manager.generate_report(false);
    let shutdown_manager = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || shutdown_manager.shutdown()).await?;
    tracing::info!(report = %serde_json::to_string(&report)?, "final tablet report");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, returning which one fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}
