//! skein-agent: hosts plan switches for one storage node

use anyhow::Result;
use clap::Parser;
use skein_agent::{Cli, Commands, check_config, load_config, serve};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    skein_telemetry::init_logging(&config.log)?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::CheckConfig => {
            check_config(&config)?;
            info!("configuration is valid");
            Ok(())
        }
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.network.port = port;
            }
            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received, shutting down");
                        on_signal.cancel();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for interrupts"),
                }
            });
            serve(config, shutdown).await
        }
    }
}
