//! skein-agent library exports
//!
//! Command line definition and the agent's serve loop, split from `main`
//! so they can be tested.

use anyhow::{Context, Result};
use clap::Parser;
use skein_config::{ConfigLoader, SkeinConfig, Validator};
use skein_switch::{
    AgentService, LocalBlobStore, NodeContext, StaticDirectory, TcpAgentConnector, TcpAgentServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "SKEIN";

#[derive(Parser)]
#[command(name = "skein-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the agent server (default)
    Serve {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

/// Load the configuration named on the command line, with `SKEIN_*`
/// environment overrides applied last
pub fn load_config(cli: &Cli) -> Result<SkeinConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader
        .with_env_prefix(ENV_PREFIX)
        .load()
        .context("loading configuration")?;
    config.log.level = config.log.level.raised_by(cli.verbose);
    Ok(config)
}

/// Validate `config`, logging every warning
pub fn check_config(config: &SkeinConfig) -> Result<()> {
    let warnings = Validator::new()
        .validate(config)
        .into_result()
        .context("invalid configuration")?;
    for warning in warnings {
        warn!("{}", warning);
    }
    Ok(())
}

/// Serve plans on the configured address until `shutdown` fires
pub async fn serve(config: SkeinConfig, shutdown: CancellationToken) -> Result<()> {
    check_config(&config)?;

    let blobs = LocalBlobStore::new(&config.storage.data_dir)
        .await
        .with_context(|| format!("opening blob store at {}", config.storage.data_dir.display()))?;
    let directory = Arc::new(StaticDirectory::new(config.peer_nodes()));
    let connector = Arc::new(TcpAgentConnector::new(directory, config.engine.clone()));
    let ctx = NodeContext::node(
        config.node_id(),
        Arc::new(blobs),
        connector,
        config.engine.clone(),
    );
    let agent = Arc::new(AgentService::new(Arc::new(ctx)));

    let address = config.network.listen_address();
    let server = TcpAgentServer::bind(&address, agent)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(
        node = %config.node_id(),
        address = %server.local_addr()?,
        peers = config.network.peers.len(),
        "skein agent started"
    );
    server.serve(shutdown).await?;
    info!("skein agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["skein-agent", "-vv", "--config", "/etc/skein.toml", "serve", "-p", "7600"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/skein.toml")));
        assert!(matches!(cli.command, Some(Commands::Serve { port: Some(7600) })));

        let cli = Cli::parse_from(["skein-agent"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_load_config_raises_verbosity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"warn\"").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let cli = Cli::parse_from(["skein-agent", "-v", "--config", path.as_str(), "check-config"]);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.log.level, skein_telemetry::LogLevel::Info);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SkeinConfig::default();
        config.storage.data_dir = dir.path().join("blobs");
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.port = 0;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(config, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        task.await.unwrap().unwrap();
        assert!(dir.path().join("blobs").is_dir());
    }

    #[tokio::test]
    async fn test_serve_rejects_invalid_config() {
        let mut config = SkeinConfig::default();
        config.lock.acquire_timeout_ms = 0;
        let err = serve(config, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
