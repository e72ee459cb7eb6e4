//! CLI Entry Point for daq_supervisor
//!
//! Runs one acquisition cycle over every device in a configuration file:
//! configure → ping → start → wait → collect → stop → shutdown.
//!
//! # Usage
//!
//! ```bash
//! daq_supervisor --config config/supervisor.toml --duration-secs 5
//! daq_supervisor --config config/supervisor.toml --mock
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use daq_supervisor::config::SupervisorConfig;
use daq_supervisor::telemetry;
use daq_supervisor::transport::{MockTransportFactory, TransportFactory, UdpTransportFactory};
use daq_supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq_supervisor")]
#[command(about = "Streams samples from a rack of instruments", long_about = None)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, default_value = "config/supervisor.toml")]
    config: PathBuf,

    /// Use simulated instruments instead of UDP sockets
    #[arg(long)]
    mock: bool,

    /// How long to collect before flushing, in seconds
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SupervisorConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    telemetry::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let factory: Arc<dyn TransportFactory> = if cli.mock {
        Arc::new(MockTransportFactory::new())
    } else {
        Arc::new(UdpTransportFactory)
    };

    let mut supervisor = Supervisor::from_config(&config, factory)?;
    info!(
        application = %config.application.name,
        devices = supervisor.len(),
        mock = cli.mock,
        "Supervisor ready"
    );

    let result = run_cycle(&mut supervisor, &config, Duration::from_secs(cli.duration_secs)).await;
    supervisor.shutdown().await?;
    result
}

async fn run_cycle(
    supervisor: &mut Supervisor,
    config: &SupervisorConfig,
    duration: Duration,
) -> Result<()> {
    supervisor.configure_all(&config.configure_params()).await?;
    supervisor.start_all(&config.start_params()).await?;

    let reachable = supervisor.ping_all(config.supervisor.ping_timeout).await;
    for (name, ok) in &reachable {
        if !ok {
            warn!(equipment = %name, "Equipment did not answer ping");
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, flushing early"),
    }

    let collected = supervisor.collect_data(config.supervisor.ping_timeout).await?;
    supervisor.stop_all().await?;

    for (name, samples) in &collected {
        info!(equipment = %name, samples = samples.len(), "Collection summary");
    }
    Ok(())
}
