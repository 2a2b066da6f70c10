// src/main.rs - Control server entry point
use clap::Parser;
use krusty_control::transport::SerialLink;
use krusty_control::{Config, ControlServer, load_config};
use std::path::Path;

#[derive(Debug, Parser)]
#[command(name = "control-server", version, about = "Bridges a printer firmware and local IPC clients")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "control.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    // The level comes from the config, so parse it before logging is up
    let loaded = if Path::new(&args.config).exists() {
        Some(load_config(&args.config))
    } else {
        None
    };
    let config = match &loaded {
        Some(Ok(config)) => config.clone(),
        _ => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level()?)
        .init();

    tracing::info!("Starting control server {}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Some(Ok(_)) => tracing::info!("Loaded configuration from {}", args.config),
        Some(Err(e)) => {
            tracing::error!("Failed to load config from '{}': {}", args.config, e);
            return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>);
        }
        None => tracing::warn!("Config file {} not found, using defaults", args.config),
    }

    let link = SerialLink::open(&config.firmware.device, config.firmware.baud, config.firmware.poll_interval() * 4)
        .map_err(|e| {
            tracing::error!("Failed to open firmware link {}: {}", config.firmware.device, e);
            e
        })?;

    let server = ControlServer::new(config, link);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;
    Ok(())
}
